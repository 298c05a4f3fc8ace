use crate::scheduler::SchedulerStatus;
use metrics_exporter_prometheus::PrometheusHandle;
use shared::admin_service::AdminState;
use std::sync::Arc;
use std::time::Instant;

/// Backs the admin listener of the collector.
pub struct CollectorAdminState {
    started_at: Instant,
    scheduler: Arc<SchedulerStatus>,
    total_feeds: usize,
    prometheus: Option<PrometheusHandle>,
}

impl CollectorAdminState {
    pub fn new(
        scheduler: Arc<SchedulerStatus>,
        total_feeds: usize,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        CollectorAdminState {
            started_at: Instant::now(),
            scheduler,
            total_feeds,
            prometheus,
        }
    }
}

impl AdminState for CollectorAdminState {
    fn is_ready(&self) -> bool {
        self.scheduler.is_running()
    }

    fn health(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "healthy",
            "uptime_seconds": self.started_at.elapsed().as_secs_f64(),
            "scheduler": {
                "running": self.scheduler.is_running(),
                "jobs_scheduled": self.scheduler.jobs_scheduled(),
                "running_feeds": self.scheduler.running_feeds(),
            },
            "feeds": {
                "total": self.total_feeds,
            },
        })
    }

    fn render_metrics(&self) -> Option<String> {
        self.prometheus.as_ref().map(PrometheusHandle::render)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{FeedJob, Scheduler};
    use crate::testutils::feed;
    use crate::types::FeedDescriptor;
    use async_trait::async_trait;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::time::Duration;

    struct NoopJob;

    #[async_trait]
    impl FeedJob for NoopJob {
        async fn run(&self, _feed: &FeedDescriptor) {}
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let scheduler = Scheduler::new(
            vec![feed("a", "https://x.test/a.pb"), feed("b", "https://x.test/b.pb")],
            Arc::new(NoopJob),
            Duration::from_secs(5),
        );
        let state = CollectorAdminState::new(scheduler.status(), 5, None);

        assert!(!state.is_ready());
        assert_eq!(state.health()["scheduler"]["running"], false);

        scheduler.start();
        assert!(state.is_ready());

        let health = state.health();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["scheduler"]["running"], true);
        assert_eq!(health["scheduler"]["jobs_scheduled"], 2);
        assert_eq!(health["feeds"]["total"], 5);
        assert!(health["uptime_seconds"].as_f64().unwrap() >= 0.0);

        scheduler.stop(Duration::from_secs(1)).await;
        assert!(!state.is_ready());
    }

    #[test]
    fn test_prometheus_rendering() {
        let scheduler = Scheduler::new(vec![], Arc::new(NoopJob), Duration::from_secs(5));
        let without = CollectorAdminState::new(scheduler.status(), 0, None);
        assert!(without.render_metrics().is_none());

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("fetch.attempts").increment(3);
        });

        let with = CollectorAdminState::new(scheduler.status(), 0, Some(handle));
        let body = with.render_metrics().unwrap();
        assert!(body.contains("fetch_attempts"));
    }
}
