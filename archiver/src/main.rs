mod config;

use clap::{Args, Parser};
use collector::config::{ShardSettings, load_feeds};
use collector::metrics_defs::ALL_METRICS;
use config::{Config, LogFormat, LoggingConfig, MetricsConfig};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(version, about = "Archives GTFS-Realtime feeds to object storage")]
enum CliCommand {
    /// Poll every owned feed until SIGINT or SIGTERM
    Run(ConfigArgs),
    /// Load and validate the config and feeds files, then exit
    Validate(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, default_value = "archiver.yaml")]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum MetricsInitError {
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("could not install prometheus recorder: {0}")]
    Prometheus(#[from] BuildError),
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

fn main() {
    let cli = CliCommand::parse();
    let (CliCommand::Run(args) | CliCommand::Validate(args)) = &cli;

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", args.config.display());
            process::exit(1);
        }
    };

    let sentry = init_logging(&config.common.logging);

    let code = match cli {
        CliCommand::Run(_) => run(config),
        CliCommand::Validate(_) => validate(config),
    };

    // Flush pending events; `exit` skips destructors
    drop(sentry);
    process::exit(code);
}

fn run(config: Config) -> i32 {
    let shard = match ShardSettings::from_env() {
        Ok(shard) => shard,
        Err(e) => {
            tracing::error!(error = %e, "invalid shard settings");
            return 1;
        }
    };

    let prometheus = match init_metrics(config.common.metrics.as_ref()) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "could not initialize metrics");
            return 1;
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "could not start runtime");
            return 1;
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        shard_index = shard.index(),
        total_shards = shard.total(),
        "starting_archiver"
    );

    match rt.block_on(collector::run(config.collector, shard, prometheus)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "archiver failed");
            1
        }
    }
}

fn validate(config: Config) -> i32 {
    let collector = &config.collector;
    if let Err(e) = collector.validate() {
        tracing::error!(error = %e, "invalid collector config");
        return 1;
    }

    let feeds = match load_feeds(&collector.feeds_path) {
        Ok(feeds) => feeds,
        Err(e) => {
            tracing::error!(error = %e, path = %collector.feeds_path.display(), "invalid feeds file");
            return 1;
        }
    };

    match ShardSettings::from_env() {
        Ok(shard) => tracing::info!(
            total_feeds = feeds.len(),
            owned_feeds = feeds.iter().filter(|f| shard.owns(&f.id)).count(),
            shard_index = shard.index(),
            total_shards = shard.total(),
            "config_valid"
        ),
        Err(e) => {
            tracing::error!(error = %e, "invalid shard settings");
            return 1;
        }
    }
    0
}

/// Installs the tracing subscriber. Errors are also reported to Sentry when a
/// DSN is configured; the returned guard flushes pending events on drop.
fn init_logging(config: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let fmt_layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };
    let sentry_layer = sentry
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .with(filter)
        .init();

    sentry
}

fn init_metrics(config: Option<&MetricsConfig>) -> Result<Option<PrometheusHandle>, MetricsInitError> {
    let handle = match config {
        None => return Ok(None),
        Some(MetricsConfig::Statsd { host, port, prefix }) => {
            let recorder = StatsdBuilder::from(host.as_str(), *port).build(prefix.as_deref())?;
            metrics::set_global_recorder(recorder).map_err(|_| MetricsInitError::AlreadyInstalled)?;
            None
        }
        Some(MetricsConfig::Prometheus) => Some(PrometheusBuilder::new().install_recorder()?),
    };

    shared::metrics_defs::describe_all(ALL_METRICS);
    Ok(handle)
}
