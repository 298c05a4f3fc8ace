//! Per-feed timers.
//!
//! Each owned feed gets an independent timer task. A tick either starts the
//! feed's job or is dropped: when the previous run of the same feed has not
//! finished (`overlap`), or when the tick is delivered later than the misfire
//! grace period after its nominal time (`misfire`). Dropped ticks are never
//! queued or replayed.

use crate::metrics_defs::{ACTIVE_FEEDS, RUNNING_FEEDS, TICKS_SKIPPED};
use crate::types::FeedDescriptor;
use async_trait::async_trait;
use shared::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The work performed for one feed on each admitted tick.
#[async_trait]
pub trait FeedJob: Send + Sync + 'static {
    async fn run(&self, feed: &FeedDescriptor);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Started,
    SkippedOverlap,
    SkippedMisfire,
    SkippedShutdown,
}

impl TickOutcome {
    fn skip_reason(&self) -> Option<&'static str> {
        match self {
            TickOutcome::Started => None,
            TickOutcome::SkippedOverlap => Some("overlap"),
            TickOutcome::SkippedMisfire => Some("misfire"),
            TickOutcome::SkippedShutdown => Some("shutdown"),
        }
    }
}

/// Idle/Running state of a single feed.
#[derive(Default)]
pub struct FeedSlot {
    running: AtomicBool,
}

impl FeedSlot {
    pub fn state(&self) -> FeedState {
        match self.running.load(Ordering::Acquire) {
            true => FeedState::Running,
            false => FeedState::Idle,
        }
    }

    /// Idle -> Running. Returns `None` if the feed is already running.
    fn try_begin(self: &Arc<Self>, status: &Arc<SchedulerStatus>) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let running = status.running.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!(RUNNING_FEEDS).set(running as f64);

        Some(RunGuard {
            slot: self.clone(),
            status: status.clone(),
        })
    }
}

/// Running -> Idle when dropped, including when the job panics.
struct RunGuard {
    slot: Arc<FeedSlot>,
    status: Arc<SchedulerStatus>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::Release);
        let running = self.status.running.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!(RUNNING_FEEDS).set(running as f64);
    }
}

/// Liveness information shared with the admin endpoints.
#[derive(Default)]
pub struct SchedulerStatus {
    started: AtomicBool,
    stopped: AtomicBool,
    timers_alive: AtomicUsize,
    jobs_scheduled: AtomicUsize,
    running: AtomicUsize,
}

impl SchedulerStatus {
    /// True once started, until stopped, while every feed timer is alive.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
            && self.timers_alive.load(Ordering::SeqCst) == self.jobs_scheduled.load(Ordering::SeqCst)
    }

    pub fn jobs_scheduled(&self) -> usize {
        self.jobs_scheduled.load(Ordering::SeqCst)
    }

    /// Number of feeds currently in the Running state.
    pub fn running_feeds(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

struct TimerAlive(Arc<SchedulerStatus>);

impl Drop for TimerAlive {
    fn drop(&mut self) {
        self.0.timers_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FeedEntry {
    feed: Arc<FeedDescriptor>,
    slot: Arc<FeedSlot>,
}

/// Decides the fate of each tick and spawns admitted jobs.
#[derive(Clone)]
struct Dispatcher {
    job: Arc<dyn FeedJob>,
    misfire_grace: Duration,
    status: Arc<SchedulerStatus>,
    jobs: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    fn on_tick(
        &self,
        feed: &Arc<FeedDescriptor>,
        slot: &Arc<FeedSlot>,
        scheduled: Instant,
        now: Instant,
    ) -> TickOutcome {
        let outcome = self.admit(feed, slot, scheduled, now);

        if let Some(reason) = outcome.skip_reason() {
            tracing::debug!(
                feed_id = %feed.id,
                reason,
                late_ms = now.saturating_duration_since(scheduled).as_millis() as u64,
                "tick_skipped"
            );
            counter!(
                TICKS_SKIPPED,
                vec![
                    metrics::Label::new("feed_id", feed.id.clone()),
                    metrics::Label::new("reason", reason),
                ]
            )
            .increment(1);
        }

        outcome
    }

    fn admit(
        &self,
        feed: &Arc<FeedDescriptor>,
        slot: &Arc<FeedSlot>,
        scheduled: Instant,
        now: Instant,
    ) -> TickOutcome {
        if self.shutdown.is_cancelled() {
            return TickOutcome::SkippedShutdown;
        }
        if now.saturating_duration_since(scheduled) > self.misfire_grace {
            return TickOutcome::SkippedMisfire;
        }
        let Some(guard) = slot.try_begin(&self.status) else {
            return TickOutcome::SkippedOverlap;
        };

        let job = self.job.clone();
        let feed = feed.clone();
        self.jobs.spawn(async move {
            let _guard = guard;
            job.run(&feed).await;
        });

        TickOutcome::Started
    }
}

pub struct Scheduler {
    entries: Vec<FeedEntry>,
    dispatcher: Dispatcher,
    timers: TaskTracker,
}

impl Scheduler {
    pub fn new(feeds: Vec<FeedDescriptor>, job: Arc<dyn FeedJob>, misfire_grace: Duration) -> Self {
        let entries = feeds
            .into_iter()
            .map(|feed| FeedEntry {
                feed: Arc::new(feed),
                slot: Arc::new(FeedSlot::default()),
            })
            .collect();

        Scheduler {
            entries,
            dispatcher: Dispatcher {
                job,
                misfire_grace,
                status: Arc::new(SchedulerStatus::default()),
                jobs: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            },
            timers: TaskTracker::new(),
        }
    }

    pub fn status(&self) -> Arc<SchedulerStatus> {
        self.dispatcher.status.clone()
    }

    pub fn feed_states(&self) -> HashMap<String, FeedState> {
        self.entries
            .iter()
            .map(|e| (e.feed.id.clone(), e.slot.state()))
            .collect()
    }

    /// Spawns one timer per feed. The first tick of each feed fires immediately.
    /// Calling this more than once has no effect.
    pub fn start(&self) {
        let status = &self.dispatcher.status;
        if status.started.swap(true, Ordering::SeqCst) {
            return;
        }

        status.jobs_scheduled.store(self.entries.len(), Ordering::SeqCst);
        gauge!(ACTIVE_FEEDS).set(self.entries.len() as f64);

        for entry in &self.entries {
            status.timers_alive.fetch_add(1, Ordering::SeqCst);
            let alive = TimerAlive(status.clone());
            let dispatcher = self.dispatcher.clone();
            let feed = entry.feed.clone();
            let slot = entry.slot.clone();

            self.timers.spawn(async move {
                let _alive = alive;
                run_timer(dispatcher, feed, slot).await;
            });
        }

        tracing::info!(active_feeds = self.entries.len(), "scheduler_started");
    }

    /// Delivers a tick for `feed_id` now, outside of its timer. The usual
    /// overlap rule applies. Returns `None` for unknown feeds.
    pub fn trigger(&self, feed_id: &str) -> Option<TickOutcome> {
        let entry = self.entries.iter().find(|e| e.feed.id == feed_id)?;
        let now = Instant::now();
        Some(self.dispatcher.on_tick(&entry.feed, &entry.slot, now, now))
    }

    /// Stops all timers and waits up to `grace` for in-flight jobs.
    /// Returns false if some jobs were still running when the grace expired.
    pub async fn stop(&self, grace: Duration) -> bool {
        self.dispatcher.status.stopped.store(true, Ordering::SeqCst);
        self.dispatcher.shutdown.cancel();

        self.timers.close();
        self.timers.wait().await;

        let jobs = &self.dispatcher.jobs;
        jobs.close();
        let drained = tokio::time::timeout(grace, jobs.wait()).await.is_ok();

        tracing::info!(
            drained,
            in_flight = self.dispatcher.status.running_feeds(),
            "scheduler_stopped"
        );
        drained
    }
}

async fn run_timer(dispatcher: Dispatcher, feed: Arc<FeedDescriptor>, slot: Arc<FeedSlot>) {
    let mut interval = tokio::time::interval(feed.interval);
    // A late timer fires once and then realigns; the late tick itself is
    // subject to the misfire check.
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let scheduled = tokio::select! {
            _ = dispatcher.shutdown.cancelled() => break,
            scheduled = interval.tick() => scheduled,
        };

        dispatcher.on_tick(&feed, &slot, scheduled, Instant::now());
    }
}
