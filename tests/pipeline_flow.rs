//! End-to-end pipeline scenarios over in-memory collaborators.
//!
//! The bus and the real backends stay out of the picture; these tests drive
//! `OrderPipeline` directly and route outcomes the way the consumer does,
//! asserting the terminal-outcome and ledger contracts.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use orderflow::breaker::{BreakerPolicy, CircuitBreaker};
use orderflow::cache::MemoryCache;
use orderflow::consumer::{FailureRoute, failure_route};
use orderflow::enrichment::{EnrichmentConfig, EnrichmentService};
use orderflow::error::{FetchError, StoreError};
use orderflow::ledger::{FailureLedger, LedgerOutcome, MemoryFailureLedger};
use orderflow::lock::MemoryLock;
use orderflow::models::{Customer, CustomerStatus, Order, OrderIntent, Product};
use orderflow::pipeline::{OrderPipeline, Outcome};
use orderflow::refclient::{CustomerFetch, ProductFetch};
use orderflow::retry::RetryPolicy;
use orderflow::store::{MemoryOrderStore, OrderStore, SaveOutcome};

// ============================================================
// FIXTURES
// ============================================================

fn product(id: &str, price: Decimal, active: bool) -> Product {
    let now = Utc::now();
    Product {
        id: id.to_string(),
        name: format!("{id} name"),
        description: format!("{id} description"),
        price,
        active,
        created_at: now,
        updated_at: now,
    }
}

fn customer(id: &str, status: CustomerStatus, limit: Decimal, balance: Decimal) -> Customer {
    let now = Utc::now();
    Customer {
        id: id.to_string(),
        name: "Ada".to_string(),
        email: "ada@example.com".to_string(),
        status,
        credit_limit: limit,
        current_balance: balance,
        created_at: now,
        updated_at: now,
    }
}

fn intent(order_id: &str, customer_id: &str, product_ids: &[&str]) -> OrderIntent {
    OrderIntent {
        order_id: order_id.to_string(),
        customer_id: customer_id.to_string(),
        product_ids: product_ids.iter().map(|id| id.to_string()).collect(),
        timestamp: None,
    }
}

/// Scripted product source: optional per-call latency, a budget of transient
/// failures, and missing ids surfacing as NotFound.
struct Products {
    records: HashMap<String, Product>,
    transient_failures: u32,
    latency: Duration,
    calls: AtomicU32,
}

impl Products {
    fn with(records: Vec<Product>) -> Self {
        Self {
            records: records.into_iter().map(|p| (p.id.clone(), p)).collect(),
            transient_failures: 0,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    fn always_failing() -> Self {
        Self {
            records: HashMap::new(),
            transient_failures: u32::MAX,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    fn slow(records: Vec<Product>, latency: Duration) -> Self {
        let mut products = Self::with(records);
        products.latency = latency;
        products
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProductFetch for Products {
    async fn fetch(&self, id: &str) -> Result<Product, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if n < self.transient_failures {
            return Err(FetchError::Transient("scripted timeout".into()));
        }
        self.records.get(id).cloned().ok_or(FetchError::NotFound)
    }
}

struct Customers {
    records: HashMap<String, Customer>,
}

impl Customers {
    fn with(records: Vec<Customer>) -> Self {
        Self {
            records: records.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }
}

#[async_trait]
impl CustomerFetch for Customers {
    async fn fetch(&self, id: &str) -> Result<Customer, FetchError> {
        self.records.get(id).cloned().ok_or(FetchError::NotFound)
    }
}

/// Store whose existence check misses a concurrent writer, so only the
/// unique index catches the duplicate.
struct RacingStore {
    inner: MemoryOrderStore,
}

#[async_trait]
impl OrderStore for RacingStore {
    async fn save(&self, order: &Order) -> Result<SaveOutcome, StoreError> {
        self.inner.save(order).await
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        self.inner.find_by_order_id(order_id).await
    }

    async fn exists_by_order_id(&self, _order_id: &str) -> Result<bool, StoreError> {
        Ok(false)
    }
}

/// Store with a dead backend.
struct DownStore;

#[async_trait]
impl OrderStore for DownStore {
    async fn save(&self, _order: &Order) -> Result<SaveOutcome, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }

    async fn find_by_order_id(&self, _order_id: &str) -> Result<Option<Order>, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }

    async fn exists_by_order_id(&self, _order_id: &str) -> Result<bool, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
}

fn build_pipeline(
    products: Arc<Products>,
    customers: Arc<Customers>,
    store: Arc<dyn OrderStore>,
    lock: Arc<MemoryLock>,
) -> OrderPipeline {
    let policy = BreakerPolicy {
        // Keep the breaker out of the way unless a test wants it.
        window_size: 1000,
        ..BreakerPolicy::default()
    };
    let enrichment = EnrichmentService::new(
        products,
        customers,
        Arc::new(MemoryCache::new()),
        Arc::new(CircuitBreaker::new("products", policy.clone())),
        Arc::new(CircuitBreaker::new("customers", policy)),
        EnrichmentConfig {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
            ..EnrichmentConfig::default()
        },
    );
    OrderPipeline::new(lock, store, Arc::new(enrichment), Duration::from_secs(30))
}

fn happy_products() -> Vec<Product> {
    vec![
        product("product-001", Decimal::new(2499_99, 2), true),
        product("product-002", Decimal::new(999_99, 2), true),
    ]
}

fn active_customer() -> Customer {
    customer(
        "customer-001",
        CustomerStatus::Active,
        Decimal::new(5000_00, 2),
        Decimal::ZERO,
    )
}

/// Mirror of the consumer's outcome routing against an in-memory ledger.
async fn route_outcome(ledger: &MemoryFailureLedger, key: &str, outcome: &Outcome) {
    match failure_route(outcome) {
        FailureRoute::None => {}
        FailureRoute::Retryable(reason) => {
            ledger.record(key, "{}", &reason).await.unwrap();
        }
        FailureRoute::DeadLetter(reason) => {
            ledger.record_dead_letter(key, "{}", &reason).await.unwrap();
        }
    }
}

// ============================================================
// SCENARIOS
// ============================================================

// S1: clean run persists a completed order with exact totals, lines in
// input order.
#[tokio::test]
async fn persists_enriched_order() {
    let store = Arc::new(MemoryOrderStore::new());
    let pipeline = build_pipeline(
        Arc::new(Products::with(happy_products())),
        Arc::new(Customers::with(vec![active_customer()])),
        store.clone(),
        Arc::new(MemoryLock::new()),
    );

    let intent = intent("order-123", "customer-001", &["product-001", "product-002"]);
    let outcome = pipeline.process(&intent).await;

    assert_eq!(outcome, Outcome::Persisted);
    let order = store
        .find_by_order_id("order-123")
        .await
        .unwrap()
        .expect("order persisted");
    assert_eq!(order.total_amount, Decimal::new(3499_98, 2));
    assert_eq!(order.status.as_str(), "completed");
    assert_eq!(order.products.len(), 2);
    assert_eq!(order.products[0].product_id, "product-001");
    assert_eq!(order.products[1].product_id, "product-002");
    assert_eq!(order.customer_details.customer_id, "customer-001");
    assert!(order.updated_at >= order.created_at);
}

// S2: redelivery of an already-persisted order is a silent skip with no
// second write.
#[tokio::test]
async fn redelivery_skips_existing_order() {
    let store = Arc::new(MemoryOrderStore::new());
    let lock = Arc::new(MemoryLock::new());
    let products = Arc::new(Products::with(happy_products()));
    let customers = Arc::new(Customers::with(vec![active_customer()]));

    let pipeline = build_pipeline(products, customers, store.clone(), lock);
    let intent = intent("order-123", "customer-001", &["product-001", "product-002"]);

    assert_eq!(pipeline.process(&intent).await, Outcome::Persisted);
    assert_eq!(pipeline.process(&intent).await, Outcome::SkippedExisting);
    assert_eq!(store.len(), 1);
}

// S3: inactive customer is rejected without a write, and the rejection
// dead-letters with its reason.
#[tokio::test]
async fn inactive_customer_drops_order() {
    let store = Arc::new(MemoryOrderStore::new());
    let pipeline = build_pipeline(
        Arc::new(Products::with(happy_products())),
        Arc::new(Customers::with(vec![customer(
            "customer-004",
            CustomerStatus::Inactive,
            Decimal::new(5000_00, 2),
            Decimal::ZERO,
        )])),
        store.clone(),
        Arc::new(MemoryLock::new()),
    );

    let intent = intent("order-301", "customer-004", &["product-001"]);
    let outcome = pipeline.process(&intent).await;

    let Outcome::DroppedValidation(reason) = &outcome else {
        panic!("expected dropped_validation, got {outcome:?}");
    };
    assert!(reason.contains("not active"));
    assert!(store.is_empty());

    let ledger = MemoryFailureLedger::new(5);
    route_outcome(&ledger, "order-301", &outcome).await;
    let dead = ledger.get_dead_letter("order-301").await.unwrap().unwrap();
    assert!(dead.error.contains("validation rejected"));
    assert_eq!(ledger.retry_count("order-301").await.unwrap(), 0);
}

// S4: available credit 2500 cannot cover 3499.98.
#[tokio::test]
async fn insufficient_credit_drops_order() {
    let store = Arc::new(MemoryOrderStore::new());
    let pipeline = build_pipeline(
        Arc::new(Products::with(happy_products())),
        Arc::new(Customers::with(vec![customer(
            "customer-001",
            CustomerStatus::Active,
            Decimal::new(3000_00, 2),
            Decimal::new(500_00, 2),
        )])),
        store.clone(),
        Arc::new(MemoryLock::new()),
    );

    let intent = intent("order-302", "customer-001", &["product-001", "product-002"]);
    let outcome = pipeline.process(&intent).await;

    let Outcome::DroppedValidation(reason) = outcome else {
        panic!("expected dropped_validation");
    };
    assert!(reason.contains("insufficient credit"));
    assert!(store.is_empty());
}

// S5: a 404 on any product denies enrichment and dead-letters immediately,
// without consuming retry budget.
#[tokio::test]
async fn missing_product_denies_and_dead_letters() {
    let store = Arc::new(MemoryOrderStore::new());
    let pipeline = build_pipeline(
        Arc::new(Products::with(happy_products())),
        Arc::new(Customers::with(vec![active_customer()])),
        store.clone(),
        Arc::new(MemoryLock::new()),
    );

    let intent = intent("order-XYZ", "customer-001", &["product-001", "product-999"]);
    let outcome = pipeline.process(&intent).await;

    let Outcome::EnrichmentDenied(reason) = &outcome else {
        panic!("expected enrichment_denied, got {outcome:?}");
    };
    assert!(reason.contains("product-999"));
    assert!(store.is_empty());

    let ledger = MemoryFailureLedger::new(5);
    route_outcome(&ledger, "order-XYZ", &outcome).await;
    assert!(ledger.get_dead_letter("order-XYZ").await.unwrap().is_some());
    assert_eq!(ledger.retry_count("order-XYZ").await.unwrap(), 0);
}

// S6: every call times out; one run burns exactly the 3-attempt retry
// policy, the counter advances per delivery, and delivery 6 dead-letters.
#[tokio::test]
async fn exhausted_retries_advance_counter_then_dead_letter() {
    let ledger = MemoryFailureLedger::new(5);

    for delivery in 1..=5u32 {
        let products = Arc::new(Products::always_failing());
        let pipeline = build_pipeline(
            products.clone(),
            Arc::new(Customers::with(vec![active_customer()])),
            Arc::new(MemoryOrderStore::new()),
            Arc::new(MemoryLock::new()),
        );
        let intent = intent("order-XYZ", "customer-001", &["product-001"]);
        let outcome = pipeline.process(&intent).await;

        assert!(matches!(outcome, Outcome::EnrichmentFailed(_)));
        assert_eq!(products.calls(), 3, "retry policy is 3 attempts");

        route_outcome(&ledger, "order-XYZ", &outcome).await;
        assert_eq!(ledger.retry_count("order-XYZ").await.unwrap(), delivery);
    }

    assert!(ledger.get_dead_letter("order-XYZ").await.unwrap().is_none());

    // Sixth delivery: budget spent, escalate.
    let outcome = ledger.record("order-XYZ", "{}", "scripted timeout").await.unwrap();
    assert_eq!(outcome, LedgerOutcome::DeadLettered);
    assert!(ledger.get_dead_letter("order-XYZ").await.unwrap().is_some());
}

// S7: two workers race on the same intent; exactly one persists.
#[tokio::test]
async fn concurrent_workers_persist_exactly_once() {
    let store = Arc::new(MemoryOrderStore::new());
    let lock = Arc::new(MemoryLock::new());
    let latency = Duration::from_millis(50);

    let worker_a = build_pipeline(
        Arc::new(Products::slow(happy_products(), latency)),
        Arc::new(Customers::with(vec![active_customer()])),
        store.clone(),
        lock.clone(),
    );
    let worker_b = build_pipeline(
        Arc::new(Products::slow(happy_products(), latency)),
        Arc::new(Customers::with(vec![active_customer()])),
        store.clone(),
        lock.clone(),
    );

    let intent = intent("order-123", "customer-001", &["product-001", "product-002"]);
    let (a, b) = tokio::join!(worker_a.process(&intent), worker_b.process(&intent));

    let outcomes = [a.clone(), b.clone()];
    assert_eq!(
        outcomes.iter().filter(|o| **o == Outcome::Persisted).count(),
        1,
        "exactly one worker persists: {a:?} / {b:?}"
    );
    assert!(
        outcomes
            .iter()
            .any(|o| matches!(o, Outcome::SkippedLocked | Outcome::SkippedExisting)),
        "the other worker skips: {a:?} / {b:?}"
    );
    assert_eq!(store.len(), 1);
}

// ============================================================
// EDGE CASES
// ============================================================

// Defensive check: an intent that somehow carries no productIds resolves to
// zero lines and is dropped before validation.
#[tokio::test]
async fn empty_product_list_is_dropped() {
    let pipeline = build_pipeline(
        Arc::new(Products::with(vec![])),
        Arc::new(Customers::with(vec![active_customer()])),
        Arc::new(MemoryOrderStore::new()),
        Arc::new(MemoryLock::new()),
    );

    let intent = intent("order-400", "customer-001", &[]);
    let outcome = pipeline.process(&intent).await;
    assert_eq!(
        outcome,
        Outcome::DroppedValidation("no products resolved".to_string())
    );
}

// The lock is released on failure paths too: a failed run must not wedge
// later deliveries of the same order.
#[tokio::test]
async fn lock_released_after_failure() {
    let lock = Arc::new(MemoryLock::new());
    let store = Arc::new(MemoryOrderStore::new());

    let failing = build_pipeline(
        Arc::new(Products::always_failing()),
        Arc::new(Customers::with(vec![active_customer()])),
        store.clone(),
        lock.clone(),
    );
    let intent_a = intent("order-500", "customer-001", &["product-001"]);
    assert!(matches!(
        failing.process(&intent_a).await,
        Outcome::EnrichmentFailed(_)
    ));

    let healthy = build_pipeline(
        Arc::new(Products::with(happy_products())),
        Arc::new(Customers::with(vec![active_customer()])),
        store,
        lock,
    );
    assert_eq!(healthy.process(&intent_a).await, Outcome::Persisted);
}

// Dedup missed the duplicate (raced past the existence check): the unique
// index still wins and the conflict reads as already-processed.
#[tokio::test]
async fn unique_index_catches_racing_duplicate() {
    let inner = MemoryOrderStore::new();
    let first = Order::completed(
        &intent("order-123", "customer-001", &["product-001"]),
        vec![(&product("product-001", Decimal::new(2499_99, 2), true)).into()],
        &active_customer(),
    );
    inner.save(&first).await.unwrap();

    let pipeline = build_pipeline(
        Arc::new(Products::with(happy_products())),
        Arc::new(Customers::with(vec![active_customer()])),
        Arc::new(RacingStore { inner }),
        Arc::new(MemoryLock::new()),
    );

    let intent = intent("order-123", "customer-001", &["product-001"]);
    let outcome = pipeline.process(&intent).await;
    assert_eq!(outcome, Outcome::StoreConflict);
    assert_eq!(failure_route(&outcome), FailureRoute::None);
}

// Store connectivity failure classifies into the retryable bucket.
#[tokio::test]
async fn store_outage_is_retryable() {
    let pipeline = build_pipeline(
        Arc::new(Products::with(happy_products())),
        Arc::new(Customers::with(vec![active_customer()])),
        Arc::new(DownStore),
        Arc::new(MemoryLock::new()),
    );

    let intent = intent("order-600", "customer-001", &["product-001"]);
    let outcome = pipeline.process(&intent).await;

    let Outcome::EnrichmentFailed(reason) = &outcome else {
        panic!("expected enrichment_failed, got {outcome:?}");
    };
    assert!(reason.contains("store"));
    assert!(matches!(failure_route(&outcome), FailureRoute::Retryable(_)));
}

// Unparseable payloads route straight to the dead-letter namespace, keyed
// by partition/offset when the record has no key.
#[tokio::test]
async fn unparseable_payload_dead_letters() {
    use orderflow::consumer::ledger_key;

    let err = OrderIntent::parse(b"{ this is not json").unwrap_err();
    let key = ledger_key(None, None, 2, 77);
    assert_eq!(key, "unparsed:2:77");

    let ledger = MemoryFailureLedger::new(5);
    ledger
        .record_dead_letter(&key, "{ this is not json", &err.to_string())
        .await
        .unwrap();
    let dead = ledger.get_dead_letter(&key).await.unwrap().unwrap();
    assert!(dead.is_dead_letter());
    assert!(dead.error.contains("malformed"));
}
