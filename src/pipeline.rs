//! Order pipeline - drives one intent end to end
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌────────────┐   ┌──────────┐   ┌─────────┐
//! │   Lock   │──▶│  Dedup  │──▶│ Enrichment │──▶│ Validate │──▶│ Persist │
//! │ (lease)  │   │ (store) │   │ (parallel) │   │ (rules)  │   │ (upsert)│
//! └──────────┘   └─────────┘   └────────────┘   └──────────┘   └─────────┘
//! ```
//!
//! # Key Design
//!
//! - **Per-order exclusion**: the lease guarantees at most one pipeline
//!   in-flight per orderId across the deployment; contention is a silent
//!   skip, not an error.
//! - **Idempotency twice over**: an existence check up front, and the
//!   store's unique index at the end. A conflict on save means someone else
//!   already persisted this order; that is success.
//! - **Guaranteed release**: the lease is released on every exit path.
//! - **Every run ends in exactly one terminal outcome**, and the consumer
//!   acknowledges on all of them.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::enrichment::EnrichmentService;
use crate::error::EnrichmentError;
use crate::lock::{LockProvider, order_lock_name};
use crate::models::{Order, OrderIntent};
use crate::store::{OrderStore, SaveOutcome};
use crate::validator;

/// Terminal outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Order enriched, validated and written.
    Persisted,
    /// Order already in the store; nothing written.
    SkippedExisting,
    /// Another worker holds the lease for this orderId.
    SkippedLocked,
    /// The unique index rejected the write; treated as already processed.
    StoreConflict,
    /// Business validation rejected the order; nothing written.
    DroppedValidation(String),
    /// Transient failure (retries exhausted, deadline, store connectivity).
    EnrichmentFailed(String),
    /// Permanent failure (reference record missing or invalid).
    EnrichmentDenied(String),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Persisted => "persisted",
            Outcome::SkippedExisting => "skipped_existing",
            Outcome::SkippedLocked => "skipped_locked",
            Outcome::StoreConflict => "store_conflict",
            Outcome::DroppedValidation(_) => "dropped_validation",
            Outcome::EnrichmentFailed(_) => "enrichment_failed",
            Outcome::EnrichmentDenied(_) => "enrichment_denied",
        }
    }
}

/// Orchestrator for single intents. Cheap to share; all state lives in the
/// injected collaborators.
pub struct OrderPipeline {
    lock: Arc<dyn LockProvider>,
    store: Arc<dyn OrderStore>,
    enrichment: Arc<EnrichmentService>,
    lock_ttl: Duration,
}

impl OrderPipeline {
    pub fn new(
        lock: Arc<dyn LockProvider>,
        store: Arc<dyn OrderStore>,
        enrichment: Arc<EnrichmentService>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            lock,
            store,
            enrichment,
            lock_ttl,
        }
    }

    /// Process one intent to a terminal outcome.
    pub async fn process(&self, intent: &OrderIntent) -> Outcome {
        let lock_name = order_lock_name(&intent.order_id);

        if !self.lock.acquire(&lock_name, self.lock_ttl).await {
            info!("Order {} is locked by another worker, skipping", intent.order_id);
            return Outcome::SkippedLocked;
        }

        let outcome = self.process_locked(intent).await;

        self.lock.release(&lock_name).await;

        info!("Order {} finished: {}", intent.order_id, outcome.as_str());
        outcome
    }

    /// Everything between acquire and release.
    async fn process_locked(&self, intent: &OrderIntent) -> Outcome {
        // 1. Dedup against the store.
        match self.store.exists_by_order_id(&intent.order_id).await {
            Ok(true) => return Outcome::SkippedExisting,
            Ok(false) => {}
            Err(e) => return Outcome::EnrichmentFailed(format!("store: {e}")),
        }

        // 2. Enrich customer and products in parallel.
        let (customer, lines) = match self
            .enrichment
            .enrich(&intent.customer_id, &intent.product_ids)
            .await
        {
            Ok(enriched) => enriched,
            Err(EnrichmentError::Transient(reason)) => {
                warn!("Order {} enrichment failed: {}", intent.order_id, reason);
                return Outcome::EnrichmentFailed(reason);
            }
            Err(EnrichmentError::Denied(reason)) => {
                warn!("Order {} enrichment denied: {}", intent.order_id, reason);
                return Outcome::EnrichmentDenied(reason);
            }
        };

        // 3. The intent schema forbids empty productIds; belt-and-braces
        //    before computing a zero total.
        if lines.is_empty() {
            return Outcome::DroppedValidation("no products resolved".to_string());
        }

        // 4. Business rules.
        if let Err(reason) = validator::validate(&customer, &lines) {
            warn!("Order {} rejected: {}", intent.order_id, reason);
            return Outcome::DroppedValidation(reason.to_string());
        }

        // 5. Persist the terminal-success document.
        let order = Order::completed(intent, lines, &customer);
        match self.store.save(&order).await {
            Ok(SaveOutcome::Saved) => Outcome::Persisted,
            Ok(SaveOutcome::Conflict) => {
                info!("Order {} already persisted elsewhere", intent.order_id);
                Outcome::StoreConflict
            }
            Err(e) => Outcome::EnrichmentFailed(format!("store: {e}")),
        }
    }
}
