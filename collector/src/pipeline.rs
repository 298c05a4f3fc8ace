use crate::fetcher::{FetchError, Fetcher};
use crate::gate::ConcurrencyGate;
use crate::keys::derive_keys;
use crate::metrics_defs::{
    FETCH_ATTEMPTS, FETCH_BYTES, FETCH_DURATION, FETCH_ERRORS, FETCH_RETRIES, FETCH_SUCCESS,
    LAST_ATTEMPT_TIMESTAMP, UPLOAD_DURATION, UPLOAD_ERRORS, UPLOAD_SUCCESS,
};
use crate::retry::AttemptFailure;
use crate::scheduler::FeedJob;
use crate::storage::{ArchiveMetadata, StorageWriter};
use crate::types::FeedDescriptor;
use async_trait::async_trait;
use shared::{counter, gauge, histogram};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCategory {
    RetriesExhausted,
    NonRetryableStatus(u16),
    UploadFailed,
    ShuttingDown,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCategory::RetriesExhausted => write!(f, "retries exhausted"),
            FailureCategory::NonRetryableStatus(code) => write!(f, "non-retryable status: {code}"),
            FailureCategory::UploadFailed => write!(f, "upload failed"),
            FailureCategory::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived {
        key: String,
        bytes: usize,
        attempts: u32,
    },
    Failed(FailureCategory),
}

/// `error_type` label value for the last failed attempt.
fn error_type(failure: AttemptFailure) -> String {
    match failure {
        AttemptFailure::Status(code) => format!("http_{code}"),
        AttemptFailure::Timeout => "timeout".into(),
        AttemptFailure::Transport => "transport".into(),
    }
}

fn failure_category(error: &FetchError) -> FailureCategory {
    match error {
        FetchError::Abandoned { error, .. } => match error.failure {
            AttemptFailure::Status(code) => FailureCategory::NonRetryableStatus(code),
            AttemptFailure::Timeout | AttemptFailure::Transport => FailureCategory::RetriesExhausted,
        },
        FetchError::RetriesExhausted { .. } => FailureCategory::RetriesExhausted,
    }
}

/// One tick of work for a feed: fetch, then archive the response.
pub struct ArchiveJob {
    fetcher: Fetcher,
    storage: Arc<StorageWriter>,
    gate: ConcurrencyGate,
}

impl ArchiveJob {
    pub fn new(fetcher: Fetcher, storage: Arc<StorageWriter>, gate: ConcurrencyGate) -> Self {
        ArchiveJob {
            fetcher,
            storage,
            gate,
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub async fn archive(&self, feed: &FeedDescriptor) -> ArchiveOutcome {
        let labels = feed.metric_labels();
        counter!(FETCH_ATTEMPTS, labels.clone()).increment(1);
        gauge!(
            LAST_ATTEMPT_TIMESTAMP,
            vec![metrics::Label::new("feed_id", feed.id.clone())]
        )
        .set(chrono::Utc::now().timestamp() as f64);

        // Held until the upload finishes, released on every path.
        let Ok(_permit) = self.gate.acquire().await else {
            return ArchiveOutcome::Failed(FailureCategory::ShuttingDown);
        };

        let result = match self.fetcher.fetch(feed).await {
            Ok(result) => result,
            Err(err) => {
                let category = failure_category(&err);
                let mut error_labels = labels.clone();
                error_labels.push(metrics::Label::new("error_category", category.to_string()));
                error_labels.push(metrics::Label::new(
                    "error_type",
                    error_type(err.last_failure()),
                ));
                counter!(FETCH_ERRORS, error_labels).increment(1);
                counter!(FETCH_RETRIES, labels).increment(u64::from(err.attempts().saturating_sub(1)));

                match category {
                    FailureCategory::NonRetryableStatus(_) => tracing::warn!(
                        feed_id = %feed.id,
                        attempts = err.attempts(),
                        category = %category,
                        "fetch_failed"
                    ),
                    _ => tracing::error!(
                        feed_id = %feed.id,
                        attempts = err.attempts(),
                        category = %category,
                        error = %err,
                        "fetch_failed"
                    ),
                }
                return ArchiveOutcome::Failed(category);
            }
        };

        let bytes = result.content_length();
        counter!(FETCH_SUCCESS, labels.clone()).increment(1);
        counter!(FETCH_RETRIES, labels.clone()).increment(u64::from(result.attempts.saturating_sub(1)));
        histogram!(FETCH_DURATION, labels.clone()).record(result.duration.as_secs_f64());
        histogram!(FETCH_BYTES, labels.clone()).record(bytes as f64);
        tracing::info!(
            feed_id = %feed.id,
            status = result.status,
            bytes,
            attempts = result.attempts,
            duration_ms = result.duration.as_millis() as u64,
            "fetch_success"
        );

        let keys = derive_keys(feed.feed_type, &feed.url, &result.fetched_at);
        let metadata = ArchiveMetadata::new(feed, &result);
        let started = Instant::now();

        if let Err(err) = self.storage.write(&keys, result.body, &metadata).await {
            let mut error_labels = labels;
            error_labels.push(metrics::Label::new("error_type", err.error_type()));
            counter!(UPLOAD_ERRORS, error_labels).increment(1);
            tracing::error!(feed_id = %feed.id, key = %keys.object, error = %err, "upload_error");
            return ArchiveOutcome::Failed(FailureCategory::UploadFailed);
        }

        histogram!(UPLOAD_DURATION, labels.clone()).record(started.elapsed().as_secs_f64());
        counter!(UPLOAD_SUCCESS, labels).increment(1);
        tracing::info!(feed_id = %feed.id, key = %keys.object, bytes, "upload_success");

        ArchiveOutcome::Archived {
            key: keys.object,
            bytes,
            attempts: result.attempts,
        }
    }
}

#[async_trait]
impl FeedJob for ArchiveJob {
    async fn run(&self, feed: &FeedDescriptor) {
        self.archive(feed).await;
    }
}
