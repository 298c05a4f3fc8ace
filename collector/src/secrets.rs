//! Resolution of feed authentication secrets at startup.

use crate::config::SecretsConfig;
use crate::types::FeedDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
    #[error("secret {name} not found in environment variable {var}")]
    MissingEnv { name: String, var: String },
    #[error("could not read secret {name} from {path}: {source}")]
    Read {
        name: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("secret {0} is empty")]
    Empty(String),
    #[error("secret {0} requested but no secret source is configured")]
    NoSource(String),
}

#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<String, SecretError>;
}

/// Reads `{prefix}{NAME}` where NAME is the secret name upper-cased with
/// `-` replaced by `_`.
pub struct EnvResolver {
    prefix: String,
}

impl EnvResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        EnvResolver {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.to_uppercase().replace('-', "_"))
    }
}

#[async_trait]
impl SecretResolver for EnvResolver {
    async fn resolve(&self, name: &str) -> Result<String, SecretError> {
        let var = self.variable_name(name);
        match std::env::var(&var) {
            Ok(value) if !value.is_empty() => Ok(value),
            Ok(_) => Err(SecretError::Empty(name.to_string())),
            Err(_) => Err(SecretError::MissingEnv {
                name: name.to_string(),
                var,
            }),
        }
    }
}

/// Reads `{dir}/{name}`, dropping the trailing newline.
pub struct FileResolver {
    dir: PathBuf,
}

impl FileResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileResolver { dir: dir.into() }
    }
}

#[async_trait]
impl SecretResolver for FileResolver {
    async fn resolve(&self, name: &str) -> Result<String, SecretError> {
        let path = self.dir.join(name);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SecretError::Read {
                name: name.to_string(),
                path,
                source,
            })?;

        let value = contents.trim_end_matches(['\n', '\r']);
        if value.is_empty() {
            return Err(SecretError::Empty(name.to_string()));
        }
        Ok(value.to_string())
    }
}

pub struct NoSecrets;

#[async_trait]
impl SecretResolver for NoSecrets {
    async fn resolve(&self, name: &str) -> Result<String, SecretError> {
        Err(SecretError::NoSource(name.to_string()))
    }
}

/// Memoizes values per secret name so feeds sharing a secret cause one lookup.
pub struct CachingResolver<R> {
    inner: R,
    cache: Mutex<HashMap<String, String>>,
}

impl<R: SecretResolver> CachingResolver<R> {
    pub fn new(inner: R) -> Self {
        CachingResolver {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<R: SecretResolver> SecretResolver for CachingResolver<R> {
    async fn resolve(&self, name: &str) -> Result<String, SecretError> {
        let mut cache = self.cache.lock().await;
        if let Some(value) = cache.get(name) {
            return Ok(value.clone());
        }
        let value = self.inner.resolve(name).await?;
        cache.insert(name.to_string(), value.clone());
        Ok(value)
    }
}

pub fn resolver_from_config(config: &SecretsConfig) -> Box<dyn SecretResolver> {
    match config {
        SecretsConfig::Env { prefix } => Box::new(CachingResolver::new(EnvResolver::new(prefix.clone()))),
        SecretsConfig::File { dir } => Box::new(CachingResolver::new(FileResolver::new(dir.clone()))),
        SecretsConfig::None => Box::new(NoSecrets),
    }
}

/// Fills in the resolved auth value of every feed that has auth configured.
/// Fails on the first secret that cannot be resolved.
pub async fn resolve_feed_secrets(
    feeds: &mut [FeedDescriptor],
    resolver: &dyn SecretResolver,
) -> Result<usize, SecretError> {
    let mut resolved = 0;
    for feed in feeds.iter_mut() {
        let Some(auth) = feed.auth.as_mut() else {
            continue;
        };
        let secret = resolver.resolve(&auth.secret_name).await?;
        auth.resolve_with(&secret);
        resolved += 1;
    }

    tracing::info!(resolved, "secrets_resolved");
    Ok(resolved)
}
