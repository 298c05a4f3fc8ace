//! Object key derivation.
//!
//! Keys are Hive-style partitioned and must stay byte-for-byte stable, since
//! downstream compaction locates snapshots by these paths:
//!
//! ```text
//! {feed_type}/date={YYYY-MM-DD}/hour={YYYY-MM-DDTHH:00:00Z}/base64url={B}/{timestamp}.pb
//! ```

use crate::types::FeedType;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, SecondsFormat, Utc};
use url::Url;

pub const PAYLOAD_EXTENSION: &str = "pb";
pub const METADATA_EXTENSION: &str = "meta";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveKeys {
    pub object: String,
    pub metadata: String,
}

/// URL-safe base64 without padding.
pub fn encode_base64url(value: &str) -> String {
    URL_SAFE_NO_PAD.encode(value.as_bytes())
}

/// The form of a feed URL used in storage keys. Credentials and fragments
/// are dropped so that secret rotation never changes the path.
pub fn canonical_url(url: &Url) -> String {
    let mut url = url.clone();
    // Both only fail for cannot-be-a-base URLs, which carry no credentials.
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_fragment(None);
    url.to_string()
}

/// ISO-8601 UTC with millisecond precision, e.g. `2025-01-15T14:20:00.000Z`.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn partition_prefix(feed_type: FeedType, base_url: &Url, timestamp: &DateTime<Utc>) -> String {
    format!(
        "{feed_type}/date={date}/hour={hour}/base64url={encoded}",
        feed_type = feed_type.as_str(),
        date = timestamp.format("%Y-%m-%d"),
        hour = timestamp.format("%Y-%m-%dT%H:00:00Z"),
        encoded = encode_base64url(&canonical_url(base_url)),
    )
}

pub fn derive_keys(feed_type: FeedType, base_url: &Url, timestamp: &DateTime<Utc>) -> ArchiveKeys {
    let prefix = partition_prefix(feed_type, base_url, timestamp);
    let stamp = format_timestamp(timestamp);

    ArchiveKeys {
        object: format!("{prefix}/{stamp}.{PAYLOAD_EXTENSION}"),
        metadata: format!("{prefix}/{stamp}.{METADATA_EXTENSION}"),
    }
}
