use crate::shard::{ShardAssignment, ShardError};
use crate::types::{AuthDescriptor, AuthKind, FeedDescriptor, FeedType, RetryPolicy};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const INTERVAL_RANGE: (u64, u64) = (5, 3600);
const TIMEOUT_RANGE: (u64, u64) = (1, 120);
const MAX_ATTEMPTS_RANGE: (u32, u32) = (1, 10);
const BACKOFF_BASE_RANGE: (f64, f64) = (0.1, 10.0);
const BACKOFF_MAX_RANGE: (f64, f64) = (1.0, 60.0);
const MAX_CONCURRENT_RANGE: (usize, usize) = (1, 500);

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid shard settings: {0}")]
    Shard(#[from] ShardError),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{kind} id {id:?} must match ^[a-z0-9-]+$")]
    InvalidId { kind: &'static str, id: String },
    #[error("secret name {0:?} must match ^[A-Za-z0-9_-]+$")]
    InvalidSecretName(String),
    #[error("{field} of {scope} is {value}, must be within {min}..={max}")]
    OutOfRange {
        scope: String,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("feed {feed}: invalid url {url:?}: {reason}")]
    InvalidUrl {
        feed: String,
        url: String,
        reason: String,
    },
    #[error("feed {feed}: invalid auth key {key:?}")]
    InvalidAuthKey { feed: String, key: String },
    #[error("duplicate feed id {0}")]
    DuplicateFeedId(String),
    #[error("agency {0} defines neither systems nor feeds")]
    EmptyAgency(String),
    #[error("admin listener port must not be 0")]
    InvalidListenerPort,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreType {
    Gcs { bucket: String },
    Filesystem { path: String },
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct StoreConfig {
    #[serde(flatten)]
    pub r#type: StoreType,
    /// Prepended to every object key.
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SecretsConfig {
    /// `{prefix}{NAME}` environment variables.
    Env {
        #[serde(default)]
        prefix: String,
    },
    /// One file per secret, as mounted by secret volumes.
    File { dir: PathBuf },
    None,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        SecretsConfig::Env {
            prefix: String::new(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub admin_listener: Listener,
    #[serde(default = "default_feeds_path")]
    pub feeds_path: PathBuf,
    pub store: StoreConfig,
    #[serde(default = "default_true")]
    pub write_metadata: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: f64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

fn default_feeds_path() -> PathBuf {
    PathBuf::from("./agencies.yaml")
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    100
}

fn default_misfire_grace_secs() -> f64 {
    5.0
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.admin_listener.port == 0 {
            return Err(ValidationError::InvalidListenerPort);
        }
        check_range(
            "collector",
            "max_concurrent",
            self.max_concurrent as f64,
            (MAX_CONCURRENT_RANGE.0 as f64, MAX_CONCURRENT_RANGE.1 as f64),
        )?;
        check_range(
            "collector",
            "misfire_grace_secs",
            self.misfire_grace_secs,
            (0.0, f64::from(u32::MAX)),
        )?;
        Ok(())
    }

    pub fn misfire_grace(&self) -> Duration {
        Duration::from_secs_f64(self.misfire_grace_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// Agencies file

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct IntervalDefaults {
    #[serde(default = "default_fast_interval")]
    pub vehicle_positions: u64,
    #[serde(default = "default_fast_interval")]
    pub trip_updates: u64,
    #[serde(default = "default_alerts_interval")]
    pub service_alerts: u64,
}

fn default_fast_interval() -> u64 {
    20
}

fn default_alerts_interval() -> u64 {
    60
}

impl Default for IntervalDefaults {
    fn default() -> Self {
        IntervalDefaults {
            vehicle_positions: default_fast_interval(),
            trip_updates: default_fast_interval(),
            service_alerts: default_alerts_interval(),
        }
    }
}

impl IntervalDefaults {
    pub fn for_type(&self, feed_type: FeedType) -> u64 {
        match feed_type {
            FeedType::VehiclePositions => self.vehicle_positions,
            FeedType::TripUpdates => self.trip_updates,
            FeedType::ServiceAlerts => self.service_alerts,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct DefaultsConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub intervals: IntervalDefaults,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        DefaultsConfig {
            timeout_seconds: default_timeout_seconds(),
            retry: RetryPolicy::default(),
            intervals: IntervalDefaults::default(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct RealtimeFeedConfig {
    pub feed_type: FeedType,
    pub url: String,
    pub name: Option<String>,
    pub interval_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub retry: Option<RetryPolicy>,
    pub auth: Option<AuthDescriptor>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct SystemConfig {
    pub id: String,
    pub name: String,
    pub schedule_url: Option<String>,
    pub auth: Option<AuthDescriptor>,
    pub feeds: Vec<RealtimeFeedConfig>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct AgencyConfig {
    pub id: String,
    pub name: String,
    pub schedule_url: Option<String>,
    pub auth: Option<AuthDescriptor>,
    #[serde(default)]
    pub systems: Vec<SystemConfig>,
    #[serde(default)]
    pub feeds: Vec<RealtimeFeedConfig>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct AgenciesFile {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    pub agencies: Vec<AgencyConfig>,
}

pub fn load_agencies_file(path: &Path) -> Result<AgenciesFile, ConfigError> {
    let file = File::open(path)?;
    let data = serde_yaml::from_reader(file)?;

    Ok(data)
}

/// Loads the agencies file and returns the validated, flattened feed list.
pub fn load_feeds(path: &Path) -> Result<Vec<FeedDescriptor>, ConfigError> {
    let agencies = load_agencies_file(path)?;
    Ok(flatten_agencies(&agencies)?)
}

/// `{agency_id}[-{system_id}]-{feed-type}`
pub fn generate_feed_id(agency_id: &str, system_id: Option<&str>, feed_type: FeedType) -> String {
    let feed_type = feed_type.as_str().replace('_', "-");
    match system_id {
        Some(system_id) => format!("{agency_id}-{system_id}-{feed_type}"),
        None => format!("{agency_id}-{feed_type}"),
    }
}

/// `{Agency Name} [{System Name}] {Feed Type Title}`
pub fn generate_feed_name(agency_name: &str, system_name: Option<&str>, feed_type: FeedType) -> String {
    match system_name {
        Some(system_name) => format!("{agency_name} {system_name} {}", feed_type.title()),
        None => format!("{agency_name} {}", feed_type.title()),
    }
}

/// Expands the agency/system hierarchy into one descriptor per feed,
/// applying inheritance and validating every value.
pub fn flatten_agencies(config: &AgenciesFile) -> Result<Vec<FeedDescriptor>, ValidationError> {
    let defaults = &config.defaults;
    validate_defaults(defaults)?;

    let mut feeds = Vec::new();
    let mut seen = HashSet::new();

    for agency in &config.agencies {
        validate_id("agency", &agency.id)?;

        if !agency.systems.is_empty() {
            for system in &agency.systems {
                validate_id("system", &system.id)?;
                for feed in &system.feeds {
                    feeds.push(flatten_feed(feed, agency, Some(system), defaults)?);
                }
            }
        } else if !agency.feeds.is_empty() {
            for feed in &agency.feeds {
                feeds.push(flatten_feed(feed, agency, None, defaults)?);
            }
        } else {
            return Err(ValidationError::EmptyAgency(agency.id.clone()));
        }
    }

    for feed in &feeds {
        if !seen.insert(feed.id.as_str()) {
            return Err(ValidationError::DuplicateFeedId(feed.id.clone()));
        }
    }

    Ok(feeds)
}

fn flatten_feed(
    feed: &RealtimeFeedConfig,
    agency: &AgencyConfig,
    system: Option<&SystemConfig>,
    defaults: &DefaultsConfig,
) -> Result<FeedDescriptor, ValidationError> {
    let id = generate_feed_id(&agency.id, system.map(|s| s.id.as_str()), feed.feed_type);
    let name = match &feed.name {
        Some(name) => name.clone(),
        None => generate_feed_name(&agency.name, system.map(|s| s.name.as_str()), feed.feed_type),
    };

    let interval = feed
        .interval_seconds
        .unwrap_or_else(|| defaults.intervals.for_type(feed.feed_type));
    let timeout = feed.timeout_seconds.unwrap_or(defaults.timeout_seconds);
    let retry = feed.retry.clone().unwrap_or_else(|| defaults.retry.clone());
    let auth = feed
        .auth
        .as_ref()
        .or_else(|| system.and_then(|s| s.auth.as_ref()))
        .or(agency.auth.as_ref())
        .cloned();
    let schedule_url = system
        .and_then(|s| s.schedule_url.as_deref())
        .or(agency.schedule_url.as_deref());

    check_range(&id, "interval_seconds", interval as f64, as_f64(INTERVAL_RANGE))?;
    check_range(&id, "timeout_seconds", timeout as f64, as_f64(TIMEOUT_RANGE))?;
    validate_retry(&id, &retry)?;
    if let Some(auth) = &auth {
        validate_auth(&id, auth)?;
    }

    Ok(FeedDescriptor {
        url: parse_http_url(&id, &feed.url)?,
        schedule_url: schedule_url.map(|u| parse_http_url(&id, u)).transpose()?,
        id,
        name,
        feed_type: feed.feed_type,
        agency_id: Some(agency.id.clone()),
        agency_name: Some(agency.name.clone()),
        system_id: system.map(|s| s.id.clone()),
        system_name: system.map(|s| s.name.clone()),
        interval: Duration::from_secs(interval),
        timeout: Duration::from_secs(timeout),
        retry,
        auth,
    })
}

fn validate_defaults(defaults: &DefaultsConfig) -> Result<(), ValidationError> {
    let intervals = &defaults.intervals;
    for (field, value) in [
        ("intervals.vehicle_positions", intervals.vehicle_positions),
        ("intervals.trip_updates", intervals.trip_updates),
        ("intervals.service_alerts", intervals.service_alerts),
    ] {
        check_range("defaults", field, value as f64, as_f64(INTERVAL_RANGE))?;
    }
    check_range(
        "defaults",
        "timeout_seconds",
        defaults.timeout_seconds as f64,
        as_f64(TIMEOUT_RANGE),
    )?;
    validate_retry("defaults", &defaults.retry)
}

fn validate_retry(scope: &str, retry: &RetryPolicy) -> Result<(), ValidationError> {
    check_range(
        scope,
        "retry.max_attempts",
        f64::from(retry.max_attempts),
        (f64::from(MAX_ATTEMPTS_RANGE.0), f64::from(MAX_ATTEMPTS_RANGE.1)),
    )?;
    check_range(scope, "retry.backoff_base", retry.backoff_base, BACKOFF_BASE_RANGE)?;
    check_range(scope, "retry.backoff_max", retry.backoff_max, BACKOFF_MAX_RANGE)
}

fn validate_auth(feed_id: &str, auth: &AuthDescriptor) -> Result<(), ValidationError> {
    let valid_name = !auth.secret_name.is_empty()
        && auth
            .secret_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_name {
        return Err(ValidationError::InvalidSecretName(auth.secret_name.clone()));
    }

    let valid_key = match auth.kind {
        AuthKind::Header => http::HeaderName::from_bytes(auth.key.as_bytes()).is_ok(),
        AuthKind::Query => !auth.key.is_empty(),
    };
    if !valid_key {
        return Err(ValidationError::InvalidAuthKey {
            feed: feed_id.to_string(),
            key: auth.key.clone(),
        });
    }

    Ok(())
}

fn validate_id(kind: &'static str, id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(ValidationError::InvalidId {
            kind,
            id: id.to_string(),
        });
    }
    Ok(())
}

fn parse_http_url(feed_id: &str, raw: &str) -> Result<Url, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidUrl {
        feed: feed_id.to_string(),
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme {other}"))),
    }
}

fn check_range(scope: &str, field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), ValidationError> {
    if value < min || value > max || value.is_nan() {
        return Err(ValidationError::OutOfRange {
            scope: scope.to_string(),
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn as_f64((min, max): (u64, u64)) -> (f64, f64) {
    (min as f64, max as f64)
}

/// `SHARD_INDEX` (default 0) and `TOTAL_SHARDS` (default 1).
pub struct ShardSettings;

impl ShardSettings {
    pub fn from_env() -> Result<ShardAssignment, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<ShardAssignment, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &'static str, default: u32| -> Result<u32, ConfigError> {
            match lookup(name) {
                None => Ok(default),
                Some(value) => match value.trim().parse() {
                    Ok(parsed) => Ok(parsed),
                    Err(_) => Err(ConfigError::InvalidEnv { name, value }),
                },
            }
        };

        let index = read("SHARD_INDEX", 0)?;
        let total = read("TOTAL_SHARDS", 1)?;
        Ok(ShardAssignment::new(index, total)?)
    }
}
