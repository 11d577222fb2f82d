use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::debug;

use super::{StorageBackend, StorageError, validate_identifier};

/// The handful of key/value commands the remote backend needs.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;
    async fn del(&self, key: &str) -> Result<(), StorageError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StorageError>;
}

/// Redis-compatible client backed by a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(remote_error)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(remote_error)?;
        Ok(Self { manager })
    }
}

fn remote_error(err: redis::RedisError) -> StorageError {
    StorageError::Remote(err.to_string())
}

#[async_trait]
impl KvClient for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(remote_error)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut conn = self.manager.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(remote_error)
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await.map_err(remote_error)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.manager.clone();
        conn.keys(pattern).await.map_err(remote_error)
    }
}

/// Records stored under `category:identifier` keys.
pub struct RemoteStore {
    client: Arc<dyn KvClient>,
}

impl RemoteStore {
    pub fn new(client: Arc<dyn KvClient>) -> Self {
        Self { client }
    }

    fn key(category: &str, identifier: &str) -> Result<String, StorageError> {
        validate_identifier(category)?;
        validate_identifier(identifier)?;
        Ok(format!("{}:{}", category, identifier))
    }
}

#[async_trait]
impl StorageBackend for RemoteStore {
    async fn store(
        &self,
        category: &str,
        identifier: &str,
        blob: String,
    ) -> Result<(), StorageError> {
        let key = Self::key(category, identifier)?;
        self.client.set(&key, blob).await?;
        debug!("Stored {}", key);
        Ok(())
    }

    async fn load(&self, category: &str, identifier: &str) -> Result<Option<String>, StorageError> {
        let key = Self::key(category, identifier)?;
        self.client.get(&key).await
    }

    async fn list(&self, category: &str) -> Result<Vec<String>, StorageError> {
        validate_identifier(category)?;
        let prefix = format!("{}:", category);
        let mut identifiers: Vec<String> = self
            .client
            .keys(&format!("{}*", prefix))
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        identifiers.sort();
        Ok(identifiers)
    }

    async fn delete(&self, category: &str, identifier: &str) -> Result<(), StorageError> {
        let key = Self::key(category, identifier)?;
        self.client.del(&key).await?;
        debug!("Deleted {}", key);
        Ok(())
    }
}
