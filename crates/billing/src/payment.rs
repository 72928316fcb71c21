//! Payment processor capability
//!
//! The core never talks to a gateway directly. Collection is driven by the
//! worker through this trait, and the core only reacts to the outcome via
//! the callbacks below (`mark_past_due` / `recover_from_past_due`).
//! Retry policy for transient network failures belongs to the processor
//! implementation, not to this crate.

use async_trait::async_trait;
use atende_shared::TenantId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::invoices::InvoiceGenerator;
use crate::subscriptions::SubscriptionService;

/// Result of a charge attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub success: bool,
    /// Processor-side transaction reference when the charge settled
    pub transaction_id: Option<String>,
    /// Processor-side failure description when it did not
    pub failure_reason: Option<String>,
}

impl PaymentOutcome {
    pub fn settled(transaction_id: impl Into<String>) -> Self {
        Self {
            success: true,
            transaction_id: Some(transaction_id.into()),
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_id: None,
            failure_reason: Some(reason.into()),
        }
    }
}

/// External payment processor (implemented outside this crate)
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Attempt to charge a tenant's payment method
    async fn charge(
        &self,
        tenant_id: TenantId,
        amount_cents: i64,
        method: &str,
    ) -> BillingResult<PaymentOutcome>;
}

/// Maps processor settlement/failure outcomes onto subscription state.
#[derive(Clone)]
pub struct PaymentCallbacks {
    subscriptions: SubscriptionService,
    invoices: InvoiceGenerator,
}

impl PaymentCallbacks {
    pub fn new(subscriptions: SubscriptionService, invoices: InvoiceGenerator) -> Self {
        Self {
            subscriptions,
            invoices,
        }
    }

    /// Settlement callback: mark the invoice paid and recover the
    /// subscription if it was past due.
    pub async fn on_payment_succeeded(
        &self,
        tenant_id: TenantId,
        invoice_id: Uuid,
        payment_method: &str,
        transaction_id: &str,
    ) -> BillingResult<()> {
        self.invoices.mark_paid(invoice_id, payment_method).await?;

        // Recovery only applies when the subscription actually fell behind
        match self.subscriptions.recover_from_past_due(tenant_id).await {
            Ok(()) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    transaction_id = %transaction_id,
                    "Subscription recovered after payment"
                );
            }
            Err(BillingError::InvalidTransition(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Failure callback: push the subscription into past_due.
    pub async fn on_payment_failed(
        &self,
        tenant_id: TenantId,
        invoice_id: Uuid,
        reason: &str,
    ) -> BillingResult<()> {
        tracing::warn!(
            tenant_id = %tenant_id,
            invoice_id = %invoice_id,
            reason = %reason,
            "Payment failed"
        );
        match self.subscriptions.mark_past_due(tenant_id).await {
            Ok(()) => Ok(()),
            // Already past due (repeat failure) or cancelled meanwhile
            Err(BillingError::InvalidTransition(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_constructors() {
        let ok = PaymentOutcome::settled("tx_123");
        assert!(ok.success);
        assert_eq!(ok.transaction_id.as_deref(), Some("tx_123"));
        assert!(ok.failure_reason.is_none());

        let failed = PaymentOutcome::failed("card_declined");
        assert!(!failed.success);
        assert!(failed.transaction_id.is_none());
        assert_eq!(failed.failure_reason.as_deref(), Some("card_declined"));
    }
}
