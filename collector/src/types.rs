use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

pub type FeedId = String;

/// The realtime feed variants. The serialized name is the first segment of
/// every archived object key.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    VehiclePositions,
    TripUpdates,
    ServiceAlerts,
}

impl FeedType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FeedType::VehiclePositions => "vehicle_positions",
            FeedType::TripUpdates => "trip_updates",
            FeedType::ServiceAlerts => "service_alerts",
        }
    }

    /// "vehicle_positions" -> "Vehicle Positions"
    pub fn title(&self) -> String {
        self.as_str()
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds
    #[serde(default = "RetryPolicy::default_backoff_base")]
    pub backoff_base: f64,
    /// Seconds
    #[serde(default = "RetryPolicy::default_backoff_max")]
    pub backoff_max: f64,
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_backoff_base() -> f64 {
        1.0
    }

    fn default_backoff_max() -> f64 {
        10.0
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: Self::default_max_attempts(),
            backoff_base: Self::default_backoff_base(),
            backoff_max: Self::default_backoff_max(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Header,
    Query,
}

/// A secret value resolved at startup. Never printed.
#[derive(Clone, PartialEq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        SecretValue(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

pub const SECRET_PLACEHOLDER: &str = "${SECRET}";

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AuthDescriptor {
    #[serde(rename = "type")]
    pub kind: AuthKind,
    pub secret_name: String,
    /// Header name or query parameter name.
    pub key: String,
    /// Template for the injected value; `${SECRET}` is replaced with the secret.
    #[serde(default = "AuthDescriptor::default_template")]
    pub value: String,
    #[serde(skip)]
    pub resolved: Option<SecretValue>,
}

impl AuthDescriptor {
    fn default_template() -> String {
        SECRET_PLACEHOLDER.to_string()
    }

    pub fn resolve_with(&mut self, secret: &str) {
        self.resolved = Some(SecretValue::new(
            self.value.replace(SECRET_PLACEHOLDER, secret),
        ));
    }
}

/// One pollable endpoint. Built once from configuration and immutable afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedDescriptor {
    pub id: FeedId,
    pub name: String,
    /// Authless URL. Auth is injected per request and never part of this URL.
    pub url: Url,
    pub feed_type: FeedType,
    pub agency_id: Option<String>,
    pub agency_name: Option<String>,
    pub system_id: Option<String>,
    pub system_name: Option<String>,
    pub schedule_url: Option<Url>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub auth: Option<AuthDescriptor>,
}

impl FeedDescriptor {
    pub fn agency_label(&self) -> &str {
        self.agency_id.as_deref().unwrap_or("unknown")
    }

    /// Labels attached to every per-feed metric.
    pub fn metric_labels(&self) -> Vec<metrics::Label> {
        vec![
            metrics::Label::new("feed_id", self.id.clone()),
            metrics::Label::new("feed_type", self.feed_type.as_str()),
            metrics::Label::new("agency", self.agency_label().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_type_names() {
        assert_eq!(FeedType::VehiclePositions.as_str(), "vehicle_positions");
        assert_eq!(FeedType::TripUpdates.title(), "Trip Updates");
        assert_eq!(FeedType::ServiceAlerts.to_string(), "service_alerts");

        let parsed: FeedType = serde_yaml::from_str("trip_updates").unwrap();
        assert_eq!(parsed, FeedType::TripUpdates);
    }

    #[test]
    fn test_auth_template() {
        let mut auth: AuthDescriptor = serde_yaml::from_str(
            r#"
            type: header
            secret_name: bart-api-key
            key: Authorization
            value: "Bearer ${SECRET}"
            "#,
        )
        .unwrap();
        assert_eq!(auth.kind, AuthKind::Header);
        assert!(auth.resolved.is_none());

        auth.resolve_with("abc123");
        assert_eq!(auth.resolved.unwrap().expose(), "Bearer abc123");
    }

    #[test]
    fn test_auth_default_template_is_raw_secret() {
        let mut auth: AuthDescriptor =
            serde_yaml::from_str("{type: query, secret_name: key, key: api_key}").unwrap();
        auth.resolve_with("s3cret");
        assert_eq!(auth.resolved.as_ref().unwrap().expose(), "s3cret");
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = SecretValue::new("hunter2");
        assert!(!format!("{secret:?}").contains("hunter2"));
    }

    #[test]
    fn test_retry_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_base, 1.0);
        assert_eq!(policy.backoff_max, 10.0);
    }
}
