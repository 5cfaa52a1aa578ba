//! Read-through reference cache
//!
//! Key/value JSON cache in front of the reference services. The cache is
//! advisory: a backend error on read degrades to a miss, an undecodable
//! value degrades to a miss (the caller re-fetches and overwrites), and
//! writes are fire-and-forget. Nothing in the pipeline fails because of
//! the cache.
//!
//! Keys: `product:{id}` and `customer:{id}`. NotFound is never cached.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Cache key for a product record.
pub fn product_key(id: &str) -> String {
    format!("product:{id}")
}

/// Cache key for a customer record.
pub fn customer_key(id: &str) -> String {
    format!("customer:{id}")
}

/// Raw string-valued cache operations. JSON encoding lives in the
/// [`get_json`]/[`put_json`] helpers so the trait stays object-safe.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
}

/// Typed read with full degradation: backend errors and undecodable values
/// both come back as a miss.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let raw = match cache.get_raw(key).await {
        Ok(raw) => raw?,
        Err(e) => {
            warn!("[cache] get {} failed, treating as miss: {}", key, e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => {
            debug!("[cache] hit {}", key);
            Some(value)
        }
        Err(e) => {
            warn!("[cache] undecodable value at {}, treating as miss: {}", key, e);
            None
        }
    }
}

/// Typed write, errors logged and swallowed.
pub async fn put_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("[cache] failed to encode value for {}: {}", key, e);
            return;
        }
    };
    if let Err(e) = cache.set_raw(key, raw, ttl).await {
        warn!("[cache] set {} failed: {}", key, e);
    }
}

/// Redis-backed cache over a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let applied: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(applied)
    }
}

/// In-process cache for tests and single-node dev runs. TTLs are accepted
/// and ignored; `failing()` builds an instance whose reads error to exercise
/// the degrade-to-miss path.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    fail_reads: bool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fail_reads: true,
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        if self.fail_reads {
            return Err(CacheError::Backend("connection refused".into()));
        }
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: String, _ttl: Duration) -> Result<(), CacheError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.lock().unwrap().contains_key(key))
    }

    async fn expire(&self, key: &str, _ttl: Duration) -> Result<bool, CacheError> {
        Ok(self.entries.lock().unwrap().contains_key(key))
    }
}
