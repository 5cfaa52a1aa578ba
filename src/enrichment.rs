//! Enrichment stage
//!
//! Resolves an intent's `customerId` and every `productId` into snapshots.
//! The customer lookup and the product fan-out run concurrently and the
//! whole stage fails fast on the first error; product results come back in
//! input order, duplicates fetched per occurrence.
//!
//! Each lookup is cache-first. On a miss the reference client is called
//! under the retry policy and circuit breaker, and the fresh record is
//! written back to the cache without blocking the pipeline.
//!
//! The stage carries a 60 s overall deadline on top of the per-attempt 10 s
//! client timeout; deadline expiry classifies as transient.

use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::cache::{self, Cache, customer_key, product_key};
use crate::error::{EnrichmentError, FetchError};
use crate::models::{Customer, OrderLine, Product};
use crate::refclient::{CustomerFetch, ProductFetch};
use crate::retry::{RetryPolicy, retry_fetch};

/// Stage-wide deadline covering both subtasks.
pub const ENRICHMENT_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub product_ttl: Duration,
    pub customer_ttl: Duration,
    pub deadline: Duration,
    pub retry: RetryPolicy,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            product_ttl: Duration::from_secs(3600),
            customer_ttl: Duration::from_secs(1800),
            deadline: ENRICHMENT_DEADLINE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Concurrent customer + product resolution with a read-through cache.
pub struct EnrichmentService {
    products: Arc<dyn ProductFetch>,
    customers: Arc<dyn CustomerFetch>,
    cache: Arc<dyn Cache>,
    product_breaker: Arc<CircuitBreaker>,
    customer_breaker: Arc<CircuitBreaker>,
    config: EnrichmentConfig,
}

impl EnrichmentService {
    pub fn new(
        products: Arc<dyn ProductFetch>,
        customers: Arc<dyn CustomerFetch>,
        cache: Arc<dyn Cache>,
        product_breaker: Arc<CircuitBreaker>,
        customer_breaker: Arc<CircuitBreaker>,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            products,
            customers,
            cache,
            product_breaker,
            customer_breaker,
            config,
        }
    }

    /// Resolve the customer and all product lines for one intent.
    pub async fn enrich(
        &self,
        customer_id: &str,
        product_ids: &[String],
    ) -> Result<(Customer, Vec<OrderLine>), EnrichmentError> {
        match timeout(
            self.config.deadline,
            self.enrich_inner(customer_id, product_ids),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EnrichmentError::Transient(format!(
                "enrichment deadline of {:?} exceeded",
                self.config.deadline
            ))),
        }
    }

    async fn enrich_inner(
        &self,
        customer_id: &str,
        product_ids: &[String],
    ) -> Result<(Customer, Vec<OrderLine>), EnrichmentError> {
        tokio::try_join!(
            self.enrich_customer(customer_id),
            self.enrich_products(product_ids)
        )
    }

    async fn enrich_customer(&self, id: &str) -> Result<Customer, EnrichmentError> {
        let key = customer_key(id);
        if let Some(customer) = cache::get_json::<Customer>(self.cache.as_ref(), &key).await {
            return Ok(customer);
        }

        let customer = retry_fetch(
            "customers",
            &self.config.retry,
            &self.customer_breaker,
            || self.customers.fetch(id),
        )
        .await
        .map_err(|e| classify(e, &format!("customer {id}")))?;

        debug!("Enriched customer {}", id);
        self.spawn_cache_fill(key, customer.clone(), self.config.customer_ttl);
        Ok(customer)
    }

    async fn enrich_products(&self, ids: &[String]) -> Result<Vec<OrderLine>, EnrichmentError> {
        // try_join_all keeps input order and cancels the rest on first error.
        try_join_all(ids.iter().map(|id| self.enrich_product(id))).await
    }

    async fn enrich_product(&self, id: &str) -> Result<OrderLine, EnrichmentError> {
        let key = product_key(id);
        if let Some(product) = cache::get_json::<Product>(self.cache.as_ref(), &key).await {
            return Ok(OrderLine::from(&product));
        }

        let product = retry_fetch(
            "products",
            &self.config.retry,
            &self.product_breaker,
            || self.products.fetch(id),
        )
        .await
        .map_err(|e| classify(e, &format!("product {id}")))?;

        debug!("Enriched product {}", id);
        let line = OrderLine::from(&product);
        self.spawn_cache_fill(key, product, self.config.product_ttl);
        Ok(line)
    }

    /// Cache write-back that never blocks or fails the stage.
    fn spawn_cache_fill<T>(&self, key: String, value: T, ttl: Duration)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            cache::put_json(cache.as_ref(), &key, &value, ttl).await;
        });
    }
}

fn classify(err: FetchError, what: &str) -> EnrichmentError {
    match err {
        FetchError::NotFound => EnrichmentError::Denied(format!("{what} not found")),
        FetchError::Permanent(reason) => EnrichmentError::Denied(format!("{what}: {reason}")),
        FetchError::Transient(reason) => EnrichmentError::Transient(format!("{what}: {reason}")),
    }
}
