//! orderflow - stream-driven order enrichment and persistence worker
//!
//! Consumes order intents from the bus, resolves each against the product
//! and customer reference services, validates, and writes a denormalized
//! order document - idempotently, with bounded concurrency, and resilient
//! to transient upstream failures.
//!
//! # Modules
//!
//! - [`config`] - environment-driven configuration
//! - [`logging`] - tracing setup
//! - [`error`] - failure taxonomy (transient vs permanent)
//! - [`models`] - intents, reference records, order documents
//! - [`refclient`] - HTTP clients for the reference services
//! - [`breaker`] - per-client circuit breaker
//! - [`retry`] - backoff retry policy
//! - [`cache`] - read-through reference cache
//! - [`lock`] - distributed per-order lease
//! - [`store`] - order document store
//! - [`ledger`] - failure ledger with dead-letter escalation
//! - [`enrichment`] - parallel customer + product resolution
//! - [`validator`] - business rules
//! - [`pipeline`] - per-intent orchestrator
//! - [`consumer`] - bus consumer pool

pub mod breaker;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod enrichment;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod refclient;
pub mod retry;
pub mod store;
pub mod validator;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use enrichment::{EnrichmentConfig, EnrichmentService};
pub use error::{EnrichmentError, FetchError, IntentError};
pub use models::{Customer, CustomerStatus, Order, OrderIntent, OrderLine, OrderStatus};
pub use pipeline::{OrderPipeline, Outcome};
pub use store::{OrderStore, SaveOutcome};
