//! Payment gateway seam
//!
//! The processor calls [`PaymentGateway::attempt`] at most once per charge
//! row. Declines are normal responses; `Err` is reserved for transport-level
//! trouble (the processor records both as a FAILED charge).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BillingError, Result};

/// Gateway answer for one charge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayResponse {
    Approved { transaction_id: String },
    Declined { reason: String },
}

impl GatewayResponse {
    pub fn approved(transaction_id: impl Into<String>) -> Self {
        Self::Approved {
            transaction_id: transaction_id.into(),
        }
    }

    pub fn declined(reason: impl Into<String>) -> Self {
        Self::Declined {
            reason: reason.into(),
        }
    }
}

/// Trait for charging a stored payment method (allows mocking in tests)
#[async_trait::async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Attempt to collect `amount_cents` in `currency` from the method behind `token`
    async fn attempt(&self, token: &str, amount_cents: i64, currency: &str) -> Result<GatewayResponse>;
}

// ============================================================================
// Sandbox Gateway
// ============================================================================

/// Gateway used by the daemon outside production
///
/// Approves every token except those starting with `tok_decline`, which are
/// declined with a card-declined reason.
#[derive(Debug, Default)]
pub struct SandboxGateway;

#[async_trait::async_trait]
impl PaymentGateway for SandboxGateway {
    async fn attempt(&self, token: &str, amount_cents: i64, currency: &str) -> Result<GatewayResponse> {
        if token.starts_with("tok_decline") {
            info!(amount_cents, currency, "Sandbox gateway declined charge");
            return Ok(GatewayResponse::declined("Card declined"));
        }

        let transaction_id = format!("sandbox_{}", Uuid::new_v4().simple());
        info!(amount_cents, currency, %transaction_id, "Sandbox gateway approved charge");
        Ok(GatewayResponse::approved(transaction_id))
    }
}

// ============================================================================
// Mock Gateway
// ============================================================================

/// A recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub token: String,
    pub amount_cents: i64,
    pub currency: String,
}

/// Scripted outcome for one mock call
#[derive(Debug, Clone)]
pub enum MockStep {
    Respond(GatewayResponse),
    Error(String),
    /// Sleep before approving, to exercise the attempt timeout
    Delay(Duration),
    /// Panic inside the call, as a faulty gateway client would
    Panic(String),
}

/// Scripted in-memory gateway
///
/// Pops one [`MockStep`] per call; once the script is exhausted every call
/// is approved with a generated transaction id.
#[derive(Debug, Default)]
pub struct MockGateway {
    script: Mutex<VecDeque<MockStep>>,
    calls: Mutex<Vec<GatewayCall>>,
    approved: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway that declines every call with `reason`
    pub fn always_declining(reason: &str, times: usize) -> Self {
        let gateway = Self::new();
        for _ in 0..times {
            gateway.push(MockStep::Respond(GatewayResponse::declined(reason)));
        }
        gateway
    }

    pub fn push(&self, step: MockStep) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(step);
        }
    }

    pub fn push_decline(&self, reason: &str) {
        self.push(MockStep::Respond(GatewayResponse::declined(reason)));
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl PaymentGateway for MockGateway {
    async fn attempt(&self, token: &str, amount_cents: i64, currency: &str) -> Result<GatewayResponse> {
        self.calls
            .lock()
            .map_err(|e| BillingError::Internal(format!("Lock poisoned: {}", e)))?
            .push(GatewayCall {
                token: token.to_string(),
                amount_cents,
                currency: currency.to_string(),
            });

        let step = self
            .script
            .lock()
            .map_err(|e| BillingError::Internal(format!("Lock poisoned: {}", e)))?
            .pop_front();
        debug!(?step, "Mock gateway step");

        match step {
            Some(MockStep::Respond(response)) => Ok(response),
            Some(MockStep::Error(message)) => Err(BillingError::Gateway(message)),
            Some(MockStep::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.next_approval())
            }
            Some(MockStep::Panic(message)) => panic!("{}", message),
            None => Ok(self.next_approval()),
        }
    }
}

impl MockGateway {
    fn next_approval(&self) -> GatewayResponse {
        let n = self.approved.fetch_add(1, Ordering::SeqCst) + 1;
        GatewayResponse::approved(format!("txn_mock_{}", n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_gateway_follows_script_then_approves() {
        let gateway = MockGateway::new();
        gateway.push_decline("Insufficient funds");
        gateway.push(MockStep::Error("connection reset".into()));

        let first = gateway.attempt("tok_a", 1000, "USD").await.unwrap();
        assert_eq!(first, GatewayResponse::declined("Insufficient funds"));

        let second = gateway.attempt("tok_a", 1000, "USD").await;
        assert!(matches!(second, Err(BillingError::Gateway(_))));

        let third = gateway.attempt("tok_b", 2000, "EUR").await.unwrap();
        assert_eq!(third, GatewayResponse::approved("txn_mock_1"));

        assert_eq!(gateway.call_count(), 3);
        assert_eq!(gateway.calls()[2].currency, "EUR");
    }

    #[tokio::test]
    async fn test_sandbox_declines_decline_tokens() {
        let gateway = SandboxGateway;
        let declined = gateway.attempt("tok_decline_insufficient", 500, "USD").await.unwrap();
        assert_eq!(declined, GatewayResponse::declined("Card declined"));

        match gateway.attempt("tok_visa", 500, "USD").await.unwrap() {
            GatewayResponse::Approved { transaction_id } => assert!(transaction_id.starts_with("sandbox_")),
            other => panic!("expected approval, got {:?}", other),
        }
    }
}
