//! Error taxonomy for the order worker
//!
//! Every failure a pipeline run can hit is classified here as either
//! retryable (transient) or terminal (permanent). The classification decides
//! whether the failure ledger advances a retry counter or escalates straight
//! to the dead-letter namespace.

use thiserror::Error;

/// Result of calling a reference service (products, customers).
///
/// The caller-side retry policy only re-attempts `Transient`; `NotFound` and
/// `Permanent` abort enrichment immediately.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("resource not found")]
    NotFound,

    /// 5xx responses, timeouts, connection failures, open circuit.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Non-404 4xx responses and undecodable bodies.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl FetchError {
    /// Whether the retry policy may re-attempt this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Enrichment stage failure, already collapsed to the retryability split the
/// pipeline cares about.
#[derive(Debug, Error)]
pub enum EnrichmentError {
    /// Retries exhausted or stage deadline exceeded.
    #[error("enrichment failed: {0}")]
    Transient(String),

    /// A reference lookup came back NotFound/Permanent. No retry will help.
    #[error("enrichment denied: {0}")]
    Denied(String),
}

/// Inbound message that could not be turned into a valid `OrderIntent`.
#[derive(Debug, Error)]
pub enum IntentError {
    #[error("malformed order intent: {0}")]
    Malformed(String),

    #[error("invalid order intent: {0}")]
    Invalid(&'static str),
}

/// Order store backend failure. Always treated as transient by the pipeline;
/// duplicate writes are surfaced as `SaveOutcome::Conflict`, not as errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Cache backend failure. Callers degrade these to a miss; the pipeline never
/// fails because of the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Failure ledger backend failure. The consumer logs these and still
/// acknowledges the record so bus-level redelivery never fires.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LedgerError {
    fn from(err: redis::RedisError) -> Self {
        LedgerError::Backend(err.to_string())
    }
}
