//! orderflow worker entry point
//!
//! Startup is staged: config, logging, backing connections, then the
//! consumer pool. Shutdown is a ctrl-c watch; workers finish their
//! in-flight record before exiting.
//!
//! ```text
//! ┌────────┐   ┌───────────┐   ┌──────────────────┐   ┌───────────────┐
//! │ Config │──▶│ Redis/PG  │──▶│ Enrichment +     │──▶│ Consumer pool │
//! │ (env)  │   │ connects  │   │ pipeline wiring  │   │ (N workers)   │
//! └────────┘   └───────────┘   └──────────────────┘   └───────────────┘
//! ```

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use orderflow::breaker::{BreakerPolicy, BreakerRegistry};
use orderflow::cache::RedisCache;
use orderflow::config::AppConfig;
use orderflow::consumer::spawn_workers;
use orderflow::enrichment::{EnrichmentConfig, EnrichmentService};
use orderflow::ledger::RedisFailureLedger;
use orderflow::lock::RedisLock;
use orderflow::logging::init_logging;
use orderflow::pipeline::OrderPipeline;
use orderflow::refclient::{CustomerClient, ProductClient};
use orderflow::retry::RetryPolicy;
use orderflow::store::PgOrderStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let _log_guard = init_logging(&config);

    info!(
        "orderflow {} starting (topic={}, group={}, workers={})",
        env!("CARGO_PKG_VERSION"),
        config.topic,
        config.consumer_group,
        config.consumer_concurrency
    );

    // Redis backs the cache, the lease, and the failure ledger.
    let redis_client = redis::Client::open(config.cache_url())
        .with_context(|| format!("invalid redis url {}", config.cache_url()))?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to redis")?;
    info!("Connected to redis at {}", config.cache_url());

    let store = PgOrderStore::connect(&config.store_uri)
        .await
        .context("failed to connect to order store")?;
    store
        .init_schema()
        .await
        .context("failed to initialize order store schema")?;
    info!("Connected to order store");

    let breakers = BreakerRegistry::new(BreakerPolicy::default());
    let enrichment = EnrichmentService::new(
        Arc::new(ProductClient::new(&config.product_api_url)?),
        Arc::new(CustomerClient::new(&config.customer_api_url)?),
        Arc::new(RedisCache::new(redis_conn.clone())),
        breakers.breaker("products"),
        breakers.breaker("customers"),
        EnrichmentConfig {
            product_ttl: config.product_ttl(),
            customer_ttl: config.customer_ttl(),
            retry: RetryPolicy::default(),
            ..EnrichmentConfig::default()
        },
    );

    let pipeline = Arc::new(OrderPipeline::new(
        Arc::new(RedisLock::new(redis_conn.clone())),
        Arc::new(store),
        Arc::new(enrichment),
        config.lock_ttl(),
    ));
    let ledger = Arc::new(RedisFailureLedger::new(
        redis_conn,
        config.max_retries,
        config.failure_ttl(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&config, pipeline, ledger, shutdown_rx)
        .context("failed to start consumer pool")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested, draining {} workers", workers.len());
    let _ = shutdown_tx.send(true);

    for worker in workers {
        let _ = worker.await;
    }
    info!("orderflow stopped");
    Ok(())
}
