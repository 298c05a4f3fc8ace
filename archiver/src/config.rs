use collector::config::Config as CollectorConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum MetricsConfig {
    Statsd {
        host: String,
        port: u16,
        #[serde(default)]
        prefix: Option<String>,
    },
    Prometheus,
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    #[default]
    Json,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    pub sentry_dsn: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            sentry_dsn: None,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub collector: CollectorConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use collector::config::{SecretsConfig, StoreType};
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                type: statsd
                host: 127.0.0.1
                port: 8125
                prefix: gtfs_rt
            logging:
                level: debug
                format: text
                sentry_dsn: https://key@sentry.example.com/1
            collector:
                admin_listener:
                    host: 127.0.0.1
                    port: 9000
                feeds_path: /etc/archiver/agencies.yaml
                store:
                    type: gcs
                    bucket: rt-protobuf
                    prefix: raw
                max_concurrent: 50
                secrets:
                    type: env
                    prefix: GTFS_
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(
            config.common.metrics,
            Some(MetricsConfig::Statsd {
                host: "127.0.0.1".into(),
                port: 8125,
                prefix: Some("gtfs_rt".into()),
            })
        );
        assert_eq!(config.common.logging.level, "debug");
        assert_eq!(config.common.logging.format, LogFormat::Text);
        assert!(config.common.logging.sentry_dsn.is_some());

        let collector = config.collector;
        assert_eq!(collector.admin_listener.port, 9000);
        assert_eq!(collector.max_concurrent, 50);
        assert_eq!(
            collector.store.r#type,
            StoreType::Gcs {
                bucket: "rt-protobuf".into()
            }
        );
        assert_eq!(
            collector.secrets,
            SecretsConfig::Env {
                prefix: "GTFS_".into()
            }
        );
    }

    #[test]
    fn minimal_config() {
        let yaml = r#"
            collector:
                store:
                    type: filesystem
                    path: /var/lib/archiver
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert!(config.common.metrics.is_none());
        assert_eq!(config.common.logging, LoggingConfig::default());
        assert_eq!(config.common.logging.format, LogFormat::Json);
        assert_eq!(config.collector.admin_listener.port, 8080);
    }

    #[test]
    fn prometheus_metrics() {
        let yaml = r#"
            metrics:
                type: prometheus
            collector:
                store:
                    type: memory
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.common.metrics, Some(MetricsConfig::Prometheus));
    }

    #[test]
    fn missing_collector_section() {
        let tmp = write_tmp_file("metrics:\n  type: prometheus\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/archiver.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
