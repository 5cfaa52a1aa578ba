//! Distributed per-order lease
//!
//! `acquire` is an atomic set-if-absent with TTL (`SET key token NX EX n`).
//! Release and extend are token-checked via Lua, so a worker that has slept
//! past its TTL cannot free or stretch a lease another worker now holds. The
//! order store's unique index remains the last line of defense either way.
//!
//! Lock keys: `order:lock:{orderId}`, default TTL 30 s.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Lease key for one order.
pub fn order_lock_name(order_id: &str) -> String {
    format!("order:lock:{order_id}")
}

/// Remaining-TTL probe results: seconds left, [`TTL_ABSENT`] when the lease
/// does not exist, [`TTL_NO_EXPIRY`] when it exists without a TTL.
pub const TTL_ABSENT: i64 = -1;
pub const TTL_NO_EXPIRY: i64 = -2;

/// Named-lease operations. Backend failures surface as "not acquired" /
/// no-ops rather than errors; callers only branch on the boolean.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Atomically claim `name` for `ttl`. False when already held or the
    /// backend is unreachable.
    async fn acquire(&self, name: &str, ttl: Duration) -> bool;

    /// Drop the lease if this instance still holds it.
    async fn release(&self, name: &str);

    async fn is_held(&self, name: &str) -> bool;

    /// Remaining seconds; see [`TTL_ABSENT`] / [`TTL_NO_EXPIRY`].
    async fn ttl(&self, name: &str) -> i64;

    /// Push the expiry out to `ttl` from now if this instance holds the
    /// lease.
    async fn extend(&self, name: &str, ttl: Duration) -> bool;
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
else
    return 0
end"#;

/// Redis lease implementation. Holder tokens are per-acquire UUIDs kept in
/// process memory; only the instance that set a lease can release or extend
/// it.
pub struct RedisLock {
    conn: ConnectionManager,
    tokens: DashMap<String, String>,
    release: redis::Script,
    extend: redis::Script,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            tokens: DashMap::new(),
            release: redis::Script::new(RELEASE_SCRIPT),
            extend: redis::Script::new(EXTEND_SCRIPT),
        }
    }
}

#[async_trait]
impl LockProvider for RedisLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> bool {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let result: Result<bool, _> = redis::cmd("SET")
            .arg(name)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;

        match result {
            Ok(true) => {
                debug!("[lock] acquired {}", name);
                self.tokens.insert(name.to_string(), token);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("[lock] acquire {} failed: {}", name, e);
                false
            }
        }
    }

    async fn release(&self, name: &str) {
        let Some((_, token)) = self.tokens.remove(name) else {
            return;
        };
        let mut conn = self.conn.clone();
        let result: Result<i64, _> = self
            .release
            .key(name)
            .arg(&token)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(1) => debug!("[lock] released {}", name),
            Ok(_) => debug!("[lock] {} already expired or taken over", name),
            Err(e) => warn!("[lock] release {} failed: {}", name, e),
        }
    }

    async fn is_held(&self, name: &str) -> bool {
        let mut conn = self.conn.clone();
        let exists: Result<bool, _> = redis::cmd("EXISTS").arg(name).query_async(&mut conn).await;
        exists.unwrap_or(false)
    }

    async fn ttl(&self, name: &str) -> i64 {
        let mut conn = self.conn.clone();
        let remaining: Result<i64, _> = redis::cmd("TTL").arg(name).query_async(&mut conn).await;
        match remaining {
            // Redis reports -2 = missing key, -1 = no expiry; the lease
            // contract is the other way around.
            Ok(-2) => TTL_ABSENT,
            Ok(-1) => TTL_NO_EXPIRY,
            Ok(secs) => secs,
            Err(e) => {
                warn!("[lock] ttl {} failed: {}", name, e);
                TTL_ABSENT
            }
        }
    }

    async fn extend(&self, name: &str, ttl: Duration) -> bool {
        let Some(token) = self.tokens.get(name).map(|t| t.value().clone()) else {
            return false;
        };
        let mut conn = self.conn.clone();
        let result: Result<i64, _> = self
            .extend
            .key(name)
            .arg(&token)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await;
        matches!(result, Ok(1))
    }
}

/// In-process lease table for tests and single-node dev runs. Expiry is
/// tracked against `Instant` so TTL semantics match the redis backend.
#[derive(Default)]
pub struct MemoryLock {
    leases: Mutex<HashMap<String, Instant>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockProvider for MemoryLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> bool {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();
        match leases.get(name) {
            Some(deadline) if *deadline > now => false,
            _ => {
                leases.insert(name.to_string(), now + ttl);
                true
            }
        }
    }

    async fn release(&self, name: &str) {
        self.leases.lock().unwrap().remove(name);
    }

    async fn is_held(&self, name: &str) -> bool {
        let leases = self.leases.lock().unwrap();
        leases
            .get(name)
            .map(|deadline| *deadline > Instant::now())
            .unwrap_or(false)
    }

    async fn ttl(&self, name: &str) -> i64 {
        let leases = self.leases.lock().unwrap();
        match leases.get(name) {
            Some(deadline) => {
                let now = Instant::now();
                if *deadline > now {
                    (*deadline - now).as_secs() as i64
                } else {
                    TTL_ABSENT
                }
            }
            None => TTL_ABSENT,
        }
    }

    async fn extend(&self, name: &str, ttl: Duration) -> bool {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();
        match leases.get_mut(name) {
            Some(deadline) if *deadline > now => {
                *deadline = now + ttl;
                true
            }
            _ => false,
        }
    }
}
