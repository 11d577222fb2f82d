//! Durable keyed storage shared by the registry and any other collaborator.
//!
//! Records are addressed by `(category, identifier)` and hold one JSON blob.
//! Two backends implement [`StorageBackend`]: one file per record under a data
//! directory, or a Redis-compatible key/value service. The backend is chosen
//! once at startup by [`Store::connect`] and never changes afterwards.

mod file;
mod remote;

pub use file::FileStore;
pub use remote::{KvClient, RedisClient, RemoteStore};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Characters and sequences that may never appear in an identifier or category.
/// The file backend maps both straight onto path components.
const FORBIDDEN_SEQUENCES: [&str; 3] = ["/", "\\", ".."];

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("irregular identifier: {0:?}")]
    IrregularIdentifier(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("remote store error: {0}")]
    Remote(String),

    #[error("storage {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl StorageError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::IrregularIdentifier(_) => "irregular_identifier",
            Self::Io(_) => "storage_io",
            Self::Serde(_) => "malformed_record",
            Self::Remote(_) => "remote_store",
            Self::Timeout { .. } => "storage_timeout",
        }
    }
}

/// Reject identifiers that could escape their category.
///
/// Both backends call this before touching anything, so a rejected
/// identifier never causes I/O.
pub fn validate_identifier(identifier: &str) -> Result<(), StorageError> {
    if identifier.is_empty()
        || FORBIDDEN_SEQUENCES
            .iter()
            .any(|seq| identifier.contains(seq))
    {
        return Err(StorageError::IrregularIdentifier(identifier.to_string()));
    }
    Ok(())
}

/// A raw `(category, identifier) -> blob` store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn store(
        &self,
        category: &str,
        identifier: &str,
        blob: String,
    ) -> Result<(), StorageError>;
    async fn load(&self, category: &str, identifier: &str) -> Result<Option<String>, StorageError>;
    async fn list(&self, category: &str) -> Result<Vec<String>, StorageError>;
    async fn delete(&self, category: &str, identifier: &str) -> Result<(), StorageError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    File,
    Remote,
}

/// Storage settings resolved from configuration.
#[derive(Clone, Debug)]
pub struct StorageSettings {
    /// Root directory for the file backend (also the fallback target)
    pub data_dir: PathBuf,
    /// Connection string for the remote backend; empty selects files
    pub redis_url: String,
    pub connect_timeout: Duration,
    /// Upper bound for any single store operation
    pub operation_timeout: Duration,
}

/// Typed, bounded facade over the selected backend. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
    kind: BackendKind,
    operation_timeout: Duration,
}

impl Store {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        kind: BackendKind,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            kind,
            operation_timeout,
        }
    }

    pub fn file(data_dir: impl Into<PathBuf>, operation_timeout: Duration) -> Self {
        Self::new(
            Arc::new(FileStore::new(data_dir)),
            BackendKind::File,
            operation_timeout,
        )
    }

    /// Select the process-wide backend.
    ///
    /// A non-empty `redis_url` selects the remote backend. If it cannot be
    /// reached within `connect_timeout` the daemon keeps running on local
    /// files for the rest of the run.
    pub async fn connect(settings: &StorageSettings) -> Self {
        if settings.redis_url.is_empty() {
            info!(
                "Using file storage at {}",
                settings.data_dir.display()
            );
            return Self::file(&settings.data_dir, settings.operation_timeout);
        }

        info!("Remote store configured, connecting...");
        let connect = RedisClient::connect(&settings.redis_url);
        match tokio::time::timeout(settings.connect_timeout, connect).await {
            Ok(Ok(client)) => {
                info!("Connected to remote store");
                Self::new(
                    Arc::new(RemoteStore::new(Arc::new(client))),
                    BackendKind::Remote,
                    settings.operation_timeout,
                )
            }
            Ok(Err(e)) => {
                warn!(
                    "Failed to connect to remote store ({}); falling back to file storage at {}",
                    e,
                    settings.data_dir.display()
                );
                Self::file(&settings.data_dir, settings.operation_timeout)
            }
            Err(_) => {
                warn!(
                    "Remote store did not answer within {:?}; falling back to file storage at {}",
                    settings.connect_timeout,
                    settings.data_dir.display()
                );
                Self::file(&settings.data_dir, settings.operation_timeout)
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub async fn store<T: Serialize + ?Sized>(
        &self,
        category: &str,
        identifier: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let blob = serde_json::to_string_pretty(value)?;
        self.bounded("store", self.backend.store(category, identifier, blob))
            .await
    }

    /// Load a record. `Ok(None)` means there is no such record.
    ///
    /// Fields missing from older records are filled in by `T`'s own
    /// deserialization defaults.
    pub async fn load<T: DeserializeOwned>(
        &self,
        category: &str,
        identifier: &str,
    ) -> Result<Option<T>, StorageError> {
        let blob = self
            .bounded("load", self.backend.load(category, identifier))
            .await?;
        match blob {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, category: &str) -> Result<Vec<String>, StorageError> {
        self.bounded("list", self.backend.list(category)).await
    }

    pub async fn delete(&self, category: &str, identifier: &str) -> Result<(), StorageError> {
        self.bounded("delete", self.backend.delete(category, identifier))
            .await
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.operation_timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout {
                operation,
                after: self.operation_timeout,
            })?
    }
}
