//! Failure ledger
//!
//! Advisory record of what failed and how often, kept in redis with a TTL.
//! Transient failures advance a per-key retry counter until `max_retries`,
//! after which the record escalates into the dead-letter namespace.
//! Permanent failures skip the counter and dead-letter immediately.
//!
//! The ledger never re-injects messages onto the bus; re-injection is an
//! operator action. The consumer acknowledges every record after the ledger
//! write so bus-level redelivery never fires.
//!
//! Keys: `failed:message:{key}`, `failed:retry:{key}`, `dead:letter:{key}`.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::models::{DEAD_LETTER_STATUS, FailureRecord};
use std::time::Duration;

pub fn failed_message_key(key: &str) -> String {
    format!("failed:message:{key}")
}

pub fn failed_retry_key(key: &str) -> String {
    format!("failed:retry:{key}")
}

pub fn dead_letter_key(key: &str) -> String {
    format!("dead:letter:{key}")
}

/// Retry budget exhausted: the next failure dead-letters instead of
/// re-recording.
pub fn should_dead_letter(retry_count: u32, max_retries: u32) -> bool {
    retry_count >= max_retries
}

/// Outcome of recording a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// Failure recorded; counter now at the contained value.
    Recorded(u32),
    /// Retry budget was already spent; record escalated to dead-letter.
    DeadLettered,
}

/// Failure bookkeeping seam.
#[async_trait]
pub trait FailureLedger: Send + Sync {
    /// Record a retryable failure, advancing the retry counter or
    /// escalating once the budget is spent.
    async fn record(
        &self,
        key: &str,
        message: &str,
        error: &str,
    ) -> Result<LedgerOutcome, LedgerError>;

    /// Record a terminal failure directly in the dead-letter namespace.
    async fn record_dead_letter(
        &self,
        key: &str,
        message: &str,
        error: &str,
    ) -> Result<(), LedgerError>;

    async fn get(&self, key: &str) -> Result<Option<FailureRecord>, LedgerError>;

    async fn get_dead_letter(&self, key: &str) -> Result<Option<FailureRecord>, LedgerError>;

    async fn retry_count(&self, key: &str) -> Result<u32, LedgerError>;
}

/// Redis implementation.
pub struct RedisFailureLedger {
    conn: ConnectionManager,
    max_retries: u32,
    ttl: Duration,
}

impl RedisFailureLedger {
    pub fn new(conn: ConnectionManager, max_retries: u32, ttl: Duration) -> Self {
        Self {
            conn,
            max_retries,
            ttl,
        }
    }

    async fn write_record(
        &self,
        redis_key: &str,
        record: &FailureRecord,
    ) -> Result<(), LedgerError> {
        let raw = serde_json::to_string(record)
            .map_err(|e| LedgerError::Backend(format!("unencodable failure record: {e}")))?;
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(redis_key)
            .arg(raw)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_record(&self, redis_key: &str) -> Result<Option<FailureRecord>, LedgerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(redis_key)
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else { return Ok(None) };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("[ledger] undecodable record at {}: {}", redis_key, e);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl FailureLedger for RedisFailureLedger {
    async fn record(
        &self,
        key: &str,
        message: &str,
        error: &str,
    ) -> Result<LedgerOutcome, LedgerError> {
        let count = self.retry_count(key).await?;
        if should_dead_letter(count, self.max_retries) {
            info!(
                "[ledger] retry budget spent for {} ({}/{}), dead-lettering",
                key, count, self.max_retries
            );
            self.record_dead_letter(key, message, error).await?;
            return Ok(LedgerOutcome::DeadLettered);
        }

        let mut conn = self.conn.clone();
        let next: u32 = redis::cmd("INCR")
            .arg(failed_retry_key(key))
            .query_async(&mut conn)
            .await?;
        redis::cmd("EXPIRE")
            .arg(failed_retry_key(key))
            .arg(self.ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;

        let record = FailureRecord {
            key: key.to_string(),
            message: message.to_string(),
            error: error.to_string(),
            retry_count: next,
            max_retries: self.max_retries,
            timestamp: Utc::now(),
            status: None,
        };
        self.write_record(&failed_message_key(key), &record).await?;

        info!(
            "[ledger] recorded failure for {} (retry {}/{})",
            key, next, self.max_retries
        );
        Ok(LedgerOutcome::Recorded(next))
    }

    async fn record_dead_letter(
        &self,
        key: &str,
        message: &str,
        error: &str,
    ) -> Result<(), LedgerError> {
        let count = self.retry_count(key).await?;
        let record = FailureRecord {
            key: key.to_string(),
            message: message.to_string(),
            error: error.to_string(),
            retry_count: count,
            max_retries: self.max_retries,
            timestamp: Utc::now(),
            status: Some(DEAD_LETTER_STATUS.to_string()),
        };
        self.write_record(&dead_letter_key(key), &record).await?;
        warn!("[ledger] dead-lettered {}: {}", key, error);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<FailureRecord>, LedgerError> {
        self.read_record(&failed_message_key(key)).await
    }

    async fn get_dead_letter(&self, key: &str) -> Result<Option<FailureRecord>, LedgerError> {
        self.read_record(&dead_letter_key(key)).await
    }

    async fn retry_count(&self, key: &str) -> Result<u32, LedgerError> {
        let mut conn = self.conn.clone();
        let count: Option<u32> = redis::cmd("GET")
            .arg(failed_retry_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(0))
    }
}

/// In-process ledger for tests and single-node dev runs; same escalation
/// algorithm as the redis backend, without TTLs.
pub struct MemoryFailureLedger {
    max_retries: u32,
    inner: std::sync::Mutex<MemoryLedgerInner>,
}

#[derive(Default)]
struct MemoryLedgerInner {
    counters: std::collections::HashMap<String, u32>,
    records: std::collections::HashMap<String, FailureRecord>,
    dead_letters: std::collections::HashMap<String, FailureRecord>,
}

impl MemoryFailureLedger {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            inner: std::sync::Mutex::new(MemoryLedgerInner::default()),
        }
    }

    fn make_record(&self, key: &str, message: &str, error: &str, count: u32, dead: bool) -> FailureRecord {
        FailureRecord {
            key: key.to_string(),
            message: message.to_string(),
            error: error.to_string(),
            retry_count: count,
            max_retries: self.max_retries,
            timestamp: Utc::now(),
            status: dead.then(|| DEAD_LETTER_STATUS.to_string()),
        }
    }
}

#[async_trait]
impl FailureLedger for MemoryFailureLedger {
    async fn record(
        &self,
        key: &str,
        message: &str,
        error: &str,
    ) -> Result<LedgerOutcome, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.counters.get(key).copied().unwrap_or(0);
        if should_dead_letter(count, self.max_retries) {
            let record = self.make_record(key, message, error, count, true);
            inner.dead_letters.insert(key.to_string(), record);
            return Ok(LedgerOutcome::DeadLettered);
        }
        let next = count + 1;
        inner.counters.insert(key.to_string(), next);
        let record = self.make_record(key, message, error, next, false);
        inner.records.insert(key.to_string(), record);
        Ok(LedgerOutcome::Recorded(next))
    }

    async fn record_dead_letter(
        &self,
        key: &str,
        message: &str,
        error: &str,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.counters.get(key).copied().unwrap_or(0);
        let record = self.make_record(key, message, error, count, true);
        inner.dead_letters.insert(key.to_string(), record);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<FailureRecord>, LedgerError> {
        Ok(self.inner.lock().unwrap().records.get(key).cloned())
    }

    async fn get_dead_letter(&self, key: &str) -> Result<Option<FailureRecord>, LedgerError> {
        Ok(self.inner.lock().unwrap().dead_letters.get(key).cloned())
    }

    async fn retry_count(&self, key: &str) -> Result<u32, LedgerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .counters
            .get(key)
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespaces() {
        assert_eq!(failed_message_key("order-1"), "failed:message:order-1");
        assert_eq!(failed_retry_key("order-1"), "failed:retry:order-1");
        assert_eq!(dead_letter_key("order-1"), "dead:letter:order-1");
    }

    #[test]
    fn test_escalation_boundary() {
        assert!(!should_dead_letter(0, 5));
        assert!(!should_dead_letter(4, 5));
        assert!(should_dead_letter(5, 5));
        assert!(should_dead_letter(6, 5));
    }

    // After max_retries recorded failures, the next one dead-letters.
    #[tokio::test]
    async fn test_retry_budget_then_dead_letter() {
        let ledger = MemoryFailureLedger::new(5);

        for expected in 1..=5 {
            let outcome = ledger.record("order-XYZ", "{}", "timeout").await.unwrap();
            assert_eq!(outcome, LedgerOutcome::Recorded(expected));
        }
        assert_eq!(ledger.retry_count("order-XYZ").await.unwrap(), 5);
        assert!(ledger.get_dead_letter("order-XYZ").await.unwrap().is_none());

        let outcome = ledger.record("order-XYZ", "{}", "timeout").await.unwrap();
        assert_eq!(outcome, LedgerOutcome::DeadLettered);

        let dead = ledger
            .get_dead_letter("order-XYZ")
            .await
            .unwrap()
            .expect("dead letter written");
        assert!(dead.is_dead_letter());
        assert_eq!(dead.retry_count, 5);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_immediately() {
        let ledger = MemoryFailureLedger::new(5);
        ledger
            .record_dead_letter("order-404", "{}", "product product-999 not found")
            .await
            .unwrap();

        assert_eq!(ledger.retry_count("order-404").await.unwrap(), 0);
        let dead = ledger.get_dead_letter("order-404").await.unwrap().unwrap();
        assert!(dead.is_dead_letter());
        assert_eq!(dead.error, "product product-999 not found");
    }

    #[tokio::test]
    async fn test_counters_are_per_key() {
        let ledger = MemoryFailureLedger::new(5);
        ledger.record("order-a", "{}", "boom").await.unwrap();
        ledger.record("order-a", "{}", "boom").await.unwrap();
        ledger.record("order-b", "{}", "boom").await.unwrap();

        assert_eq!(ledger.retry_count("order-a").await.unwrap(), 2);
        assert_eq!(ledger.retry_count("order-b").await.unwrap(), 1);

        let record = ledger.get("order-a").await.unwrap().unwrap();
        assert_eq!(record.retry_count, 2);
        assert!(!record.is_dead_letter());
    }
}
