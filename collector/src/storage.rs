//! Writes archived responses and their metadata documents to the object store.
//!
//! Each key is written once. Keys embed the fetch timestamp, so a write that
//! is repeated after a crash produces a new object rather than overwriting.

use crate::config::{StoreConfig, StoreType};
use crate::fetcher::FetchSuccess;
use crate::keys::{ArchiveKeys, canonical_url, format_timestamp};
use crate::types::FeedDescriptor;
use bytes::Bytes;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

const PAYLOAD_CONTENT_TYPE: &str = "application/x-protobuf";
const METADATA_CONTENT_TYPE: &str = "application/json";

/// Response headers copied into the metadata document.
const SELECTED_HEADERS: &[&str] = &["etag", "last-modified", "content-type", "content-length"];

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("invalid object key {key}: {source}")]
    InvalidKey {
        key: String,
        source: object_store::path::Error,
    },
    #[error("could not encode metadata: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// `error_type` label value for `upload.errors`.
    pub fn error_type(&self) -> &'static str {
        match self {
            StoreError::ObjectStore(object_store::Error::NotFound { .. }) => "not_found",
            StoreError::ObjectStore(object_store::Error::PermissionDenied { .. })
            | StoreError::ObjectStore(object_store::Error::Unauthenticated { .. }) => "permission_denied",
            StoreError::ObjectStore(_) => "object_store",
            StoreError::InvalidKey { .. } => "invalid_key",
            StoreError::Encode(_) => "encode",
            StoreError::Io(_) => "io",
        }
    }
}

/// The `.meta` sidecar written next to every payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveMetadata {
    pub feed_id: String,
    pub url: String,
    pub fetch_timestamp: String,
    pub duration_ms: f64,
    pub status: u16,
    pub content_length: usize,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl ArchiveMetadata {
    pub fn new(feed: &FeedDescriptor, result: &FetchSuccess) -> Self {
        let headers = SELECTED_HEADERS
            .iter()
            .filter_map(|name| {
                result
                    .header(name)
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();

        ArchiveMetadata {
            feed_id: feed.id.clone(),
            url: canonical_url(&feed.url),
            fetch_timestamp: format_timestamp(&result.fetched_at),
            duration_ms: result.duration.as_secs_f64() * 1000.0,
            status: result.status,
            content_length: result.content_length(),
            content_type: result.content_type().map(String::from),
            headers,
        }
    }
}

pub struct StorageWriter {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    write_metadata: bool,
    // Not every backend supports object attributes
    content_types: bool,
}

impl StorageWriter {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<String>, write_metadata: bool) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        StorageWriter {
            store,
            prefix,
            write_metadata,
            content_types: false,
        }
    }

    pub fn from_config(config: &StoreConfig, write_metadata: bool) -> Result<Self, StoreError> {
        let (store, content_types): (Arc<dyn ObjectStore>, bool) = match &config.r#type {
            StoreType::Gcs { bucket } => {
                let gcs = GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()?;
                (Arc::new(gcs), true)
            }
            StoreType::Filesystem { path } => {
                std::fs::create_dir_all(path)?;
                (Arc::new(LocalFileSystem::new_with_prefix(path)?), false)
            }
            StoreType::Memory => (Arc::new(InMemory::new()), true),
        };

        let mut writer = StorageWriter::new(store, config.prefix.clone(), write_metadata);
        writer.content_types = content_types;
        Ok(writer)
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn object_path(&self, key: &str) -> Result<ObjectPath, StoreError> {
        let full = match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        };
        ObjectPath::parse(&full).map_err(|source| StoreError::InvalidKey { key: full, source })
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &'static str) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        let mut opts = PutOptions::default();
        if self.content_types {
            opts.attributes = Attributes::from_iter([(Attribute::ContentType, content_type)]);
        }
        self.store
            .put_opts(&path, PutPayload::from(body), opts)
            .await?;
        Ok(())
    }

    /// Uploads the payload, then its metadata document. Each object is
    /// written in a single request, so readers see all of it or none of it.
    pub async fn write(
        &self,
        keys: &ArchiveKeys,
        payload: Bytes,
        metadata: &ArchiveMetadata,
    ) -> Result<(), StoreError> {
        self.put(&keys.object, payload, PAYLOAD_CONTENT_TYPE).await?;

        if self.write_metadata {
            let document = serde_json::to_vec_pretty(metadata)?;
            self.put(&keys.metadata, Bytes::from(document), METADATA_CONTENT_TYPE)
                .await?;
        }

        Ok(())
    }
}
