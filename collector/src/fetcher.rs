use crate::retry::{AttemptFailure, RetryError, Verdict, classify, retry_with_backoff};
use crate::types::{AuthKind, FeedDescriptor};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use reqwest::redirect::Policy;
use std::fmt;
use std::time::{Duration, Instant};
use url::Url;

const USER_AGENT: &str = concat!("rt-archiver/", env!("CARGO_PKG_VERSION"));

/// A successful (2xx) response, exactly as received.
#[derive(Debug, Clone)]
pub struct FetchSuccess {
    pub body: Bytes,
    pub headers: HeaderMap,
    pub status: u16,
    /// Start of the attempt that produced this response.
    pub fetched_at: DateTime<Utc>,
    /// Duration of the successful attempt.
    pub duration: Duration,
    pub attempts: u32,
}

impl FetchSuccess {
    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// A failed attempt, with the transport's description of what went wrong.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptError {
    pub failure: AttemptFailure,
    pub detail: String,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.detail)
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum FetchError {
    #[error("non-retryable failure after {attempts} attempt(s): {error}")]
    Abandoned { error: AttemptError, attempts: u32 },
    #[error("retries exhausted after {attempts} attempt(s): {error}")]
    RetriesExhausted { error: AttemptError, attempts: u32 },
}

impl FetchError {
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Abandoned { attempts, .. } | FetchError::RetriesExhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn last_failure(&self) -> AttemptFailure {
        match self {
            FetchError::Abandoned { error, .. } | FetchError::RetriesExhausted { error, .. } => {
                error.failure
            }
        }
    }
}

impl From<RetryError<AttemptError>> for FetchError {
    fn from(err: RetryError<AttemptError>) -> Self {
        match err {
            RetryError::Abandoned { error, attempts } => FetchError::Abandoned { error, attempts },
            RetryError::Exhausted { error, attempts } => {
                FetchError::RetriesExhausted { error, attempts }
            }
        }
    }
}

/// Performs bounded-timeout GETs with credential injection and retries.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(max_connections: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::limited(10))
            .pool_max_idle_per_host((max_connections / 2).max(1))
            .build()?;

        Ok(Fetcher { client })
    }

    pub async fn fetch(&self, feed: &FeedDescriptor) -> Result<FetchSuccess, FetchError> {
        self.fetch_with(feed, classify).await
    }

    /// Same as `fetch`, with the retry classifier supplied by the caller.
    pub async fn fetch_with<C>(
        &self,
        feed: &FeedDescriptor,
        classifier: C,
    ) -> Result<FetchSuccess, FetchError>
    where
        C: Fn(&AttemptFailure) -> Verdict,
    {
        let (mut success, attempts) = retry_with_backoff(
            &feed.retry,
            |error: &AttemptError| classifier(&error.failure),
            |attempt| {
                tracing::debug!(feed_id = %feed.id, attempt, "fetch_attempt");
                self.fetch_once(feed)
            },
        )
        .await?;

        success.attempts = attempts;
        Ok(success)
    }

    /// A single GET bounded by the feed's timeout. Any non-2xx status is an error.
    async fn fetch_once(&self, feed: &FeedDescriptor) -> Result<FetchSuccess, AttemptError> {
        let fetched_at = Utc::now();
        let started = Instant::now();

        let mut request = self
            .client
            .get(request_url(feed))
            .timeout(feed.timeout);

        if let Some(auth) = &feed.auth
            && auth.kind == AuthKind::Header
            && let Some(value) = &auth.resolved
        {
            request = request.header(auth.key.as_str(), value.expose());
        }

        let response = request.send().await.map_err(attempt_error)?;
        let status = response.status();

        if !status.is_success() {
            return Err(AttemptError {
                failure: AttemptFailure::Status(status.as_u16()),
                detail: format!("HTTP {status}"),
            });
        }

        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(attempt_error)?;

        Ok(FetchSuccess {
            body,
            headers,
            status: status.as_u16(),
            fetched_at,
            duration: started.elapsed(),
            attempts: 1,
        })
    }
}

/// The URL actually requested: the feed URL plus the query credential, if any.
/// A configured parameter with the same name as the credential is replaced.
pub fn request_url(feed: &FeedDescriptor) -> Url {
    let mut url = feed.url.clone();

    let Some(auth) = &feed.auth else {
        return url;
    };
    let (AuthKind::Query, Some(value)) = (auth.kind, &auth.resolved) else {
        return url;
    };

    let existing: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != auth.key.as_str())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(existing)
        .append_pair(&auth.key, value.expose());
    url
}

fn attempt_error(err: reqwest::Error) -> AttemptError {
    let failure = if err.is_timeout() {
        AttemptFailure::Timeout
    } else {
        AttemptFailure::Transport
    };

    // Strip the URL so query credentials never reach logs
    AttemptError {
        failure,
        detail: err.without_url().to_string(),
    }
}
