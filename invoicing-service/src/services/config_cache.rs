//! Read-through cache for invoicing configs, keyed by source integration.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::models::InvoicingConfig;

#[async_trait]
pub trait ConfigCache: Send + Sync {
    async fn get(&self, integration_id: Uuid) -> Result<Option<InvoicingConfig>, anyhow::Error>;
    async fn put(&self, config: &InvoicingConfig) -> Result<(), anyhow::Error>;
    async fn invalidate(&self, integration_id: Uuid) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisConfigCache {
    manager: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl RedisConfigCache {
    pub async fn connect(config: &RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, prefix = %config.cache_prefix, "Connecting config cache to Redis");
        let client = Client::open(config.url.clone())?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))?;

        Ok(Self {
            manager,
            prefix: config.cache_prefix.clone(),
            ttl: config.cache_ttl,
        })
    }

    fn key(&self, integration_id: Uuid) -> String {
        format!("{}:{}", self.prefix, integration_id)
    }
}

#[async_trait]
impl ConfigCache for RedisConfigCache {
    async fn get(&self, integration_id: Uuid) -> Result<Option<InvoicingConfig>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(integration_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read config cache: {}", e))?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, config: &InvoicingConfig) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(config)?;
        redis::cmd("SET")
            .arg(self.key(config.source_integration_id))
            .arg(json)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write config cache: {}", e))
    }

    async fn invalidate(&self, integration_id: Uuid) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(integration_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to invalidate config cache: {}", e))?;
        Ok(())
    }
}

/// Used when Redis is unreachable; every read falls through to the store.
pub struct NoopConfigCache;

#[async_trait]
impl ConfigCache for NoopConfigCache {
    async fn get(&self, _integration_id: Uuid) -> Result<Option<InvoicingConfig>, anyhow::Error> {
        Ok(None)
    }

    async fn put(&self, _config: &InvoicingConfig) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn invalidate(&self, _integration_id: Uuid) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryConfigCache {
    entries: Arc<Mutex<HashMap<Uuid, InvoicingConfig>>>,
}

impl MemoryConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, integration_id: Uuid) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&integration_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConfigCache for MemoryConfigCache {
    async fn get(&self, integration_id: Uuid) -> Result<Option<InvoicingConfig>, anyhow::Error> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&integration_id)
            .cloned())
    }

    async fn put(&self, config: &InvoicingConfig) -> Result<(), anyhow::Error> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(config.source_integration_id, config.clone());
        Ok(())
    }

    async fn invalidate(&self, integration_id: Uuid) -> Result<(), anyhow::Error> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&integration_id);
        Ok(())
    }
}
