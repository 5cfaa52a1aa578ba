//! Domain records for the order worker
//!
//! # Data Flow
//!
//! ```text
//! Bus JSON ──▶ OrderIntent ──▶ (Product, Customer) ──▶ OrderLine ──▶ Order
//!                                  reference lookups      snapshots    persisted
//! ```
//!
//! Everything on the wire is camelCase JSON; internal code uses snake_case.
//! Money fields are `rust_decimal::Decimal` end to end so line totals are
//! exact to the cent.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::IntentError;

// ============================================================
// ORDER INTENT (inbound message)
// ============================================================

/// Inbound order intent as published on the bus.
///
/// Unknown fields are ignored on decode: an earlier producer version leaked
/// polymorphic type-tag fields (`"@class"`) into the payload, and a fixed
/// schema decode must not trip over them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderIntent {
    pub order_id: String,
    pub customer_id: String,
    /// Duplicates permitted and preserved; output lines keep this order.
    pub product_ids: Vec<String>,
    #[serde(default, with = "intent_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderIntent {
    /// Decode and validate a raw bus payload.
    pub fn parse(payload: &[u8]) -> Result<Self, IntentError> {
        let intent: OrderIntent =
            serde_json::from_slice(payload).map_err(|e| IntentError::Malformed(e.to_string()))?;
        intent.validate()?;
        Ok(intent)
    }

    /// Schema-level validation of required fields.
    pub fn validate(&self) -> Result<(), IntentError> {
        if self.order_id.is_empty() {
            return Err(IntentError::Invalid("orderId must be non-empty"));
        }
        if self.customer_id.is_empty() {
            return Err(IntentError::Invalid("customerId must be non-empty"));
        }
        if self.product_ids.is_empty() {
            return Err(IntentError::Invalid("productIds must be non-empty"));
        }
        if self.product_ids.iter().any(|id| id.is_empty()) {
            return Err(IntentError::Invalid("productIds must not contain empty ids"));
        }
        Ok(())
    }
}

/// Bus timestamps come as `yyyy-MM-ddTHH:mm:ss` with no offset (treated as
/// UTC); RFC3339 inputs are accepted too.
mod intent_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const WIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => ser.serialize_str(&ts.format(WIRE_FORMAT).to_string()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(de)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(&raw, WIRE_FORMAT)
            .map(|naive| Some(naive.and_utc()))
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================
// REFERENCE RECORDS (products, customers)
// ============================================================

/// Product reference record, immutable from the worker's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Customer account standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomerStatus {
    Active,
    Inactive,
    Suspended,
    Blocked,
}

impl CustomerStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, CustomerStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerStatus::Active => "active",
            CustomerStatus::Inactive => "inactive",
            CustomerStatus::Suspended => "suspended",
            CustomerStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for CustomerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Customer reference record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: String,
    pub status: CustomerStatus,
    pub credit_limit: Decimal,
    pub current_balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// Credit headroom. Expected non-negative upstream, but not enforced
    /// here; a negative value simply fails the credit check.
    pub fn available_credit(&self) -> Decimal {
        self.credit_limit - self.current_balance
    }
}

// ============================================================
// PERSISTED ORDER
// ============================================================

/// Snapshot of a product at enrichment time, embedded in the order document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: String,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub active: bool,
}

impl From<&Product> for OrderLine {
    fn from(product: &Product) -> Self {
        Self {
            product_id: product.id.clone(),
            name: product.name.clone(),
            description: product.description.clone(),
            price: product.price,
            active: product.active,
        }
    }
}

/// Snapshot of the customer embedded in the order document. Derived fields
/// (available credit) are not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSnapshot {
    pub customer_id: String,
    pub name: String,
    pub email: String,
    pub status: CustomerStatus,
    pub credit_limit: Decimal,
    pub current_balance: Decimal,
}

impl From<&Customer> for CustomerSnapshot {
    fn from(customer: &Customer) -> Self {
        Self {
            customer_id: customer.id.clone(),
            name: customer.name.clone(),
            email: customer.email.clone(),
            status: customer.status,
            credit_limit: customer.credit_limit,
            current_balance: customer.current_balance,
        }
    }
}

/// Order lifecycle status. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Failed)
    }

    /// Allowed transitions: pending → processing → {completed, failed}.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match self {
            OrderStatus::Pending => next == OrderStatus::Processing,
            OrderStatus::Processing => next.is_terminal(),
            OrderStatus::Completed | OrderStatus::Failed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "processing" => Some(OrderStatus::Processing),
            "completed" => Some(OrderStatus::Completed),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

/// Fully-denormalized order document, written once with `status=completed`
/// and never mutated afterwards by this worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub customer_id: String,
    /// Same length and order as the intent's productIds.
    pub products: Vec<OrderLine>,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub customer_details: CustomerSnapshot,
}

impl Order {
    /// Build the terminal-success document from a validated enrichment run.
    pub fn completed(intent: &OrderIntent, products: Vec<OrderLine>, customer: &Customer) -> Self {
        let total_amount: Decimal = products.iter().map(|line| line.price).sum();
        let now = Utc::now();
        Self {
            order_id: intent.order_id.clone(),
            customer_id: intent.customer_id.clone(),
            products,
            total_amount,
            status: OrderStatus::Completed,
            created_at: now,
            updated_at: now,
            customer_details: CustomerSnapshot::from(customer),
        }
    }
}

// ============================================================
// FAILURE LEDGER RECORD
// ============================================================

/// Dead-letter marker value for `FailureRecord::status`.
pub const DEAD_LETTER_STATUS: &str = "dead_letter";

/// Failure ledger entry for one message key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub key: String,
    /// Original message payload, verbatim.
    pub message: String,
    pub error: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl FailureRecord {
    pub fn is_dead_letter(&self) -> bool {
        self.status.as_deref() == Some(DEAD_LETTER_STATUS)
    }
}
