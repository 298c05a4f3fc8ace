pub mod admin;
pub mod config;
pub mod fetcher;
pub mod gate;
pub mod keys;
pub mod metrics_defs;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod secrets;
pub mod shard;
pub mod storage;
#[cfg(test)]
mod testutils;
pub mod types;

use crate::admin::CollectorAdminState;
use crate::config::{Config, ConfigError, load_feeds};
use crate::fetcher::Fetcher;
use crate::gate::ConcurrencyGate;
use crate::pipeline::ArchiveJob;
use crate::scheduler::Scheduler;
use crate::secrets::{SecretError, resolve_feed_secrets, resolver_from_config};
use crate::shard::ShardAssignment;
use crate::storage::{StorageWriter, StoreError};
use metrics_exporter_prometheus::PrometheusHandle;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum CollectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("secret resolution failed: {0}")]
    Secret(#[from] SecretError),
    #[error("could not build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Runs the collector until SIGINT or SIGTERM.
pub async fn run(
    config: Config,
    shard: ShardAssignment,
    prometheus: Option<PrometheusHandle>,
) -> Result<(), CollectorError> {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => tracing::info!(signal, "shutdown_signal_received"),
            Err(err) => tracing::error!(error = %err, "could not listen for shutdown signals"),
        }
        signal_token.cancel();
    });

    run_until(config, shard, prometheus, shutdown).await
}

/// Runs the collector until `shutdown` is cancelled, then stops the timers
/// and waits up to the configured grace period for in-flight jobs.
pub async fn run_until(
    config: Config,
    shard: ShardAssignment,
    prometheus: Option<PrometheusHandle>,
    shutdown: CancellationToken,
) -> Result<(), CollectorError> {
    config.validate().map_err(ConfigError::from)?;

    let feeds = load_feeds(&config.feeds_path)?;
    let total_feeds = feeds.len();
    tracing::info!(count = total_feeds, path = %config.feeds_path.display(), "loaded_feeds");

    // Only the feeds this shard polls need their secrets
    let mut owned = shard.filter(feeds);
    let resolver = resolver_from_config(&config.secrets);
    resolve_feed_secrets(&mut owned, resolver.as_ref()).await?;

    tracing::info!(
        shard_index = shard.index(),
        total_shards = shard.total(),
        owned_feeds = owned.len(),
        total_feeds,
        "shard_assigned"
    );

    let fetcher = Fetcher::new(config.max_concurrent)?;
    let storage = Arc::new(StorageWriter::from_config(&config.store, config.write_metadata)?);
    let gate = ConcurrencyGate::new(config.max_concurrent);
    let job = Arc::new(ArchiveJob::new(fetcher, storage, gate.clone()));

    let scheduler = Scheduler::new(owned, job, config.misfire_grace());
    scheduler.start();

    let state = CollectorAdminState::new(scheduler.status(), total_feeds, prometheus);
    let admin_service = AdminService::<_, CollectorError>::new(Arc::new(state));
    let admin_shutdown = shutdown.child_token();
    let listener = config.admin_listener.clone();
    let mut admin_task = tokio::spawn(async move {
        run_http_service(&listener.host, listener.port, admin_service, admin_shutdown).await
    });
    tracing::info!(
        host = %config.admin_listener.host,
        port = config.admin_listener.port,
        "admin_server_started"
    );

    let admin_result = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = &mut admin_task => Some(result),
    };

    tracing::info!("shutting_down");
    gate.close();
    let drained = scheduler.stop(config.shutdown_grace()).await;
    if !drained {
        tracing::warn!(
            grace_secs = config.shutdown_grace_secs,
            "in-flight jobs did not finish before the shutdown grace period"
        );
    }

    shutdown.cancel();
    let admin_result = match admin_result {
        Some(result) => result,
        None => admin_task.await,
    };
    tracing::info!("shutdown_complete");

    match admin_result {
        Ok(result) => result,
        Err(join_error) => Err(io::Error::other(join_error).into()),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Listener, SecretsConfig, StoreConfig, StoreType};
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(feeds_path: PathBuf, archive_dir: &std::path::Path, port: u16) -> Config {
        Config {
            admin_listener: Listener {
                host: "127.0.0.1".into(),
                port,
            },
            feeds_path,
            store: StoreConfig {
                r#type: StoreType::Filesystem {
                    path: archive_dir.to_str().unwrap().into(),
                },
                prefix: Some("raw".into()),
            },
            write_metadata: true,
            max_concurrent: 4,
            misfire_grace_secs: 5.0,
            shutdown_grace_secs: 5,
            secrets: SecretsConfig::None,
        }
    }

    fn count_files(dir: &std::path::Path, extension: &str) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        entries
            .map(|entry| entry.unwrap().path())
            .map(|path| {
                if path.is_dir() {
                    count_files(&path, extension)
                } else {
                    usize::from(path.extension().is_some_and(|e| e == extension))
                }
            })
            .sum()
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 10]))
            .mount(&server)
            .await;

        let mut agencies = tempfile::NamedTempFile::new().unwrap();
        write!(
            agencies,
            "agencies:\n  - id: test\n    name: Test\n    feeds:\n      - feed_type: vehicle_positions\n        url: {}/vp.pb\n      - feed_type: service_alerts\n        url: {}/sa.pb\n",
            server.uri(),
            server.uri()
        )
        .unwrap();
        let archive = tempfile::tempdir().unwrap();
        let port = free_port();
        let config = config(agencies.path().to_path_buf(), archive.path(), port);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_until(
            config,
            ShardAssignment::new(0, 1).unwrap(),
            None,
            shutdown.clone(),
        ));

        // Both feeds tick immediately on start
        let client = reqwest::Client::new();
        let mut ready = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let Ok(response) = client.get(format!("http://127.0.0.1:{port}/ready")).send().await else {
                continue;
            };
            if response.status() == 200 && count_files(archive.path(), "pb") == 2 {
                ready = true;
                break;
            }
        }
        assert!(ready);

        let health: serde_json::Value = client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["feeds"]["total"], 2);
        assert_eq!(health["scheduler"]["jobs_scheduled"], 2);

        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert!(archive.path().join("raw/vehicle_positions").is_dir());
        assert!(archive.path().join("raw/service_alerts").is_dir());
        assert_eq!(count_files(archive.path(), "meta"), 2);
    }

    #[tokio::test]
    async fn test_missing_secret_is_fatal() {
        let mut agencies = tempfile::NamedTempFile::new().unwrap();
        write!(
            agencies,
            "agencies:\n  - id: test\n    name: Test\n    auth: {{type: header, secret_name: key, key: X-Api-Key}}\n    feeds:\n      - feed_type: trip_updates\n        url: https://x.test/tu.pb\n"
        )
        .unwrap();
        let archive = tempfile::tempdir().unwrap();
        let config = config(agencies.path().to_path_buf(), archive.path(), free_port());

        let result = run_until(
            config,
            ShardAssignment::new(0, 1).unwrap(),
            None,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(CollectorError::Secret(_))));
    }

    #[tokio::test]
    async fn test_secrets_of_other_shards_are_not_resolved() {
        use crate::config::generate_feed_id;
        use crate::shard::shard_of;
        use crate::types::FeedType;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 4]))
            .mount(&server)
            .await;

        let owned_id = generate_feed_id("owned", None, FeedType::TripUpdates);
        let other_id = generate_feed_id("other", None, FeedType::TripUpdates);
        let total = (2..64)
            .find(|&n| shard_of(&owned_id, n) != shard_of(&other_id, n))
            .unwrap();

        let mut agencies = tempfile::NamedTempFile::new().unwrap();
        write!(
            agencies,
            "agencies:\n  - id: owned\n    name: Owned\n    feeds:\n      - feed_type: trip_updates\n        url: {}/tu.pb\n  - id: other\n    name: Other\n    auth: {{type: header, secret_name: missing, key: X-Api-Key}}\n    feeds:\n      - feed_type: trip_updates\n        url: https://x.test/tu.pb\n",
            server.uri()
        )
        .unwrap();
        let archive = tempfile::tempdir().unwrap();
        let owned_config = config(agencies.path().to_path_buf(), archive.path(), free_port());
        let other_config = config(agencies.path().to_path_buf(), archive.path(), free_port());

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result = run_until(
            owned_config,
            ShardAssignment::new(shard_of(&owned_id, total), total).unwrap(),
            None,
            shutdown,
        )
        .await;
        assert!(result.is_ok());

        // The shard that owns the feed with the missing secret still fails
        let result = run_until(
            other_config,
            ShardAssignment::new(shard_of(&other_id, total), total).unwrap(),
            None,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(CollectorError::Secret(_))));
    }

    #[tokio::test]
    async fn test_invalid_feeds_file_is_fatal() {
        let archive = tempfile::tempdir().unwrap();
        let config = config(archive.path().join("absent.yaml"), archive.path(), free_port());

        let result = run_until(
            config,
            ShardAssignment::new(0, 1).unwrap(),
            None,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(CollectorError::Config(ConfigError::LoadError(_)))
        ));
    }
}
