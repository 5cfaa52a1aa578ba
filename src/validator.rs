//! Business validation
//!
//! Rules run in order and short-circuit on the first failure:
//! 1. customer must be active
//! 2. every product line must be active
//! 3. line total must fit within the customer's available credit
//!
//! A rejected order is dropped without persisting; the consumer dead-letters
//! the rejection reason for operator visibility.

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;

use crate::models::{Customer, CustomerStatus, OrderLine};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("customer is not active (status {0})")]
    CustomerInactive(CustomerStatus),

    #[error("product {0} is not active")]
    ProductInactive(String),

    #[error("insufficient credit: total {total} exceeds available {available}")]
    InsufficientCredit { total: Decimal, available: Decimal },
}

/// Validate one enriched order.
pub fn validate(customer: &Customer, products: &[OrderLine]) -> Result<(), ValidationError> {
    if !customer.status.is_active() {
        return Err(ValidationError::CustomerInactive(customer.status));
    }

    if let Some(line) = products.iter().find(|line| !line.active) {
        return Err(ValidationError::ProductInactive(line.product_id.clone()));
    }

    let total: Decimal = products.iter().map(|line| line.price).sum();
    let available = customer.available_credit();
    if total > available {
        return Err(ValidationError::InsufficientCredit { total, available });
    }

    debug!(
        "Order for customer {} passed validation (total {})",
        customer.id, total
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn customer(status: CustomerStatus, limit: Decimal, balance: Decimal) -> Customer {
        let now = Utc::now();
        Customer {
            id: "customer-001".to_string(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            status,
            credit_limit: limit,
            current_balance: balance,
            created_at: now,
            updated_at: now,
        }
    }

    fn line(id: &str, price: Decimal, active: bool) -> OrderLine {
        OrderLine {
            product_id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            price,
            active,
        }
    }

    #[test]
    fn test_valid_order_passes() {
        let customer = customer(CustomerStatus::Active, Decimal::new(5000_00, 2), Decimal::ZERO);
        let lines = vec![
            line("product-001", Decimal::new(2499_99, 2), true),
            line("product-002", Decimal::new(999_99, 2), true),
        ];
        assert!(validate(&customer, &lines).is_ok());
    }

    #[test]
    fn test_inactive_customer_rejected() {
        let customer = customer(CustomerStatus::Inactive, Decimal::new(5000_00, 2), Decimal::ZERO);
        let lines = vec![line("product-001", Decimal::ONE, true)];
        assert_eq!(
            validate(&customer, &lines),
            Err(ValidationError::CustomerInactive(CustomerStatus::Inactive))
        );
    }

    #[test]
    fn test_suspended_and_blocked_rejected() {
        for status in [CustomerStatus::Suspended, CustomerStatus::Blocked] {
            let customer = customer(status, Decimal::new(5000_00, 2), Decimal::ZERO);
            let lines = vec![line("product-001", Decimal::ONE, true)];
            assert_eq!(
                validate(&customer, &lines),
                Err(ValidationError::CustomerInactive(status))
            );
        }
    }

    #[test]
    fn test_inactive_product_rejected_with_id() {
        let customer = customer(CustomerStatus::Active, Decimal::new(5000_00, 2), Decimal::ZERO);
        let lines = vec![
            line("product-001", Decimal::ONE, true),
            line("product-002", Decimal::ONE, false),
        ];
        assert_eq!(
            validate(&customer, &lines),
            Err(ValidationError::ProductInactive("product-002".to_string()))
        );
    }

    // 2499.99 + 999.99 = 3499.98 against available 3000 - 500 = 2500.
    #[test]
    fn test_insufficient_credit_rejected() {
        let customer = customer(
            CustomerStatus::Active,
            Decimal::new(3000_00, 2),
            Decimal::new(500_00, 2),
        );
        let lines = vec![
            line("product-001", Decimal::new(2499_99, 2), true),
            line("product-002", Decimal::new(999_99, 2), true),
        ];
        assert_eq!(
            validate(&customer, &lines),
            Err(ValidationError::InsufficientCredit {
                total: Decimal::new(3499_98, 2),
                available: Decimal::new(2500_00, 2),
            })
        );
    }

    #[test]
    fn test_total_exactly_at_limit_passes() {
        let customer = customer(CustomerStatus::Active, Decimal::new(3499_98, 2), Decimal::ZERO);
        let lines = vec![
            line("product-001", Decimal::new(2499_99, 2), true),
            line("product-002", Decimal::new(999_99, 2), true),
        ];
        assert!(validate(&customer, &lines).is_ok());
    }

    // Rule order: an inactive customer wins over an inactive product.
    #[test]
    fn test_customer_rule_checked_first() {
        let customer = customer(CustomerStatus::Blocked, Decimal::ZERO, Decimal::ZERO);
        let lines = vec![line("product-001", Decimal::new(1_000_000, 0), false)];
        assert_eq!(
            validate(&customer, &lines),
            Err(ValidationError::CustomerInactive(CustomerStatus::Blocked))
        );
    }
}
