//! HTTP clients for the product and customer reference services
//!
//! Thin wrappers over one shared `reqwest::Client`. Each call is a single
//! `GET /api/{resource}/{id}` attempt with a 10 s deadline; the retry policy
//! and circuit breaker live in the caller (enrichment stage), not here.
//!
//! Status mapping:
//! - 200        → decode body into the domain record
//! - 404        → `FetchError::NotFound`
//! - other 4xx  → `FetchError::Permanent`
//! - 5xx        → `FetchError::Transient`
//! - timeout / connection error → `FetchError::Transient`

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::error::FetchError;
use crate::models::{Customer, Product};

/// Per-attempt deadline for reference calls.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Lookup seam the enrichment stage depends on; HTTP in production,
/// scripted fakes in tests.
#[async_trait]
pub trait ProductFetch: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Product, FetchError>;
}

#[async_trait]
pub trait CustomerFetch: Send + Sync {
    async fn fetch(&self, id: &str) -> Result<Customer, FetchError>;
}

/// Shared GET-by-id plumbing for both reference services.
#[derive(Debug, Clone)]
pub struct ReferenceClient {
    name: &'static str,
    base_url: String,
    http: reqwest::Client,
}

impl ReferenceClient {
    pub fn new(name: &'static str, base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("[{}] GET {}", self.name, url);

        let response = self.http.get(&url).send().await.map_err(|e| {
            // Timeouts, DNS and connection failures are all retryable.
            FetchError::Transient(format!("{}: {e}", self.name))
        })?;

        let status = response.status();
        match status {
            s if s.is_success() => response
                .json::<T>()
                .await
                .map_err(|e| FetchError::Permanent(format!("{}: undecodable body: {e}", self.name))),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            s if s.is_server_error() => Err(FetchError::Transient(format!(
                "{}: upstream returned {status}",
                self.name
            ))),
            _ => Err(FetchError::Permanent(format!(
                "{}: upstream returned {status}",
                self.name
            ))),
        }
    }
}

/// Product reference service client (`GET /api/products/{id}`).
#[derive(Debug, Clone)]
pub struct ProductClient {
    client: ReferenceClient,
}

impl ProductClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: ReferenceClient::new("products", base_url)?,
        })
    }
}

#[async_trait]
impl ProductFetch for ProductClient {
    async fn fetch(&self, id: &str) -> Result<Product, FetchError> {
        self.client.get_json(&format!("/api/products/{id}")).await
    }
}

/// Customer reference service client (`GET /api/customers/{id}`).
#[derive(Debug, Clone)]
pub struct CustomerClient {
    client: ReferenceClient,
}

impl CustomerClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: ReferenceClient::new("customers", base_url)?,
        })
    }
}

#[async_trait]
impl CustomerFetch for CustomerClient {
    async fn fetch(&self, id: &str) -> Result<Customer, FetchError> {
        self.client.get_json(&format!("/api/customers/{id}")).await
    }
}
