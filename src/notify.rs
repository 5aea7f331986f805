//! Donor notification seam
//!
//! Receipts and failure notices are best-effort: the processor logs a
//! [`Notifier::send`] error and moves on, it never unwinds a charge.

use std::sync::Mutex;

use tracing::info;

use crate::db::models::{format_amount, Charge, Pledge};
use crate::error::{BillingError, Result};

/// Trait for delivering a message to a donor (allows mocking in tests)
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, text_body: &str, html_body: &str) -> Result<()>;
}

/// A rendered donor message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// Receipt for a successful charge
pub fn receipt_message(pledge: &Pledge, charge: &Charge) -> Message {
    let amount = format!("{} {}", format_amount(charge.amount_cents), charge.currency);
    let subject = format!("Thank you for your gift of {}", amount);

    let mut text_body = format!(
        "Hi {},\n\nWe received your recurring gift of {} to {}.",
        pledge.display_name(),
        amount,
        pledge.fund_id
    );
    if let Some(txn) = &charge.transaction_id {
        text_body.push_str(&format!("\nTransaction: {}", txn));
    }
    if let Some(label) = pledge.payment_method_label() {
        text_body.push_str(&format!("\nCharged to: {}", label));
    }
    if let Some(note) = &pledge.dedication_note {
        text_body.push_str(&format!("\nDedication: {}", note));
    }
    text_body.push_str("\n\nThank you for your generosity.");

    let html_body = to_html(&text_body);
    Message {
        subject,
        text_body,
        html_body,
    }
}

/// Notice for a failed charge; the text says whether the pledge is now paused
pub fn failure_message(pledge: &Pledge, reason: &str, paused: bool) -> Message {
    let amount = format!("{} {}", format_amount(pledge.amount_cents), pledge.currency);
    let subject = if paused {
        "Your recurring gift has been paused".to_string()
    } else {
        "We couldn't process your recurring gift".to_string()
    };

    let mut text_body = format!(
        "Hi {},\n\nWe were unable to charge your recurring gift of {} to {}.\nReason: {}",
        pledge.display_name(),
        amount,
        pledge.fund_id,
        reason
    );
    if paused {
        text_body.push_str(
            "\n\nAfter repeated failures your pledge is now paused. \
             Please update your payment method to resume giving.",
        );
    } else {
        text_body.push_str("\n\nYour pledge is still active and we will try again.");
    }

    let html_body = to_html(&text_body);
    Message {
        subject,
        text_body,
        html_body,
    }
}

fn to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    let paragraphs: Vec<String> = escaped
        .split("\n\n")
        .map(|p| format!("<p>{}</p>", p.replace('\n', "<br>")))
        .collect();
    paragraphs.join("\n")
}

// ============================================================================
// Implementations
// ============================================================================

/// Notifier that writes messages to the log instead of delivering them
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, subject: &str, _text_body: &str, _html_body: &str) -> Result<()> {
        info!(%recipient, %subject, "Donor notification");
        Ok(())
    }
}

/// A message captured by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub subject: String,
    pub text_body: String,
}

/// In-memory notifier for tests; can be switched to fail every send
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentMessage>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &str, subject: &str, text_body: &str, _html_body: &str) -> Result<()> {
        if self.failing {
            return Err(BillingError::Notification(format!("Mail relay refused {}", recipient)));
        }
        self.sent
            .lock()
            .map_err(|e| BillingError::Internal(format!("Lock poisoned: {}", e)))?
            .push(SentMessage {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                text_body: text_body.to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pledge() -> Pledge {
        Pledge {
            id: "p-1".into(),
            tenant_id: "chapel".into(),
            donor_id: "donor-1".into(),
            donor_name: Some("Ruth".into()),
            donor_email: Some("ruth@example.org".into()),
            fund_id: "building".into(),
            amount_cents: 5000,
            currency: "USD".into(),
            frequency: "MONTHLY".into(),
            start_date: "2025-01-01".into(),
            end_date: None,
            next_charge_at: "2025-02-01T00:00:00.000Z".into(),
            last_charged_at: None,
            last_failed_at: None,
            last_failure_reason: None,
            status: "ACTIVE".into(),
            failure_count: 0,
            total_charges_count: 0,
            total_amount_cents: 0,
            payment_method_token: Some("tok_visa".into()),
            payment_method_last4: Some("4242".into()),
            payment_method_brand: Some("Visa".into()),
            is_anonymous: false,
            dedication_note: Some("In memory of <Naomi>".into()),
            claim_token: None,
            claimed_at: None,
            created_at: "2025-01-01T00:00:00.000Z".into(),
            updated_at: "2025-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn test_failure_message_states_pause() {
        let paused = failure_message(&pledge(), "Card declined", true);
        assert!(paused.subject.contains("paused"));
        assert!(paused.text_body.contains("now paused"));

        let active = failure_message(&pledge(), "Card declined", false);
        assert!(active.text_body.contains("still active"));
        assert!(active.text_body.contains("Reason: Card declined"));
    }

    #[test]
    fn test_receipt_escapes_html() {
        let p = pledge();
        let charge = Charge {
            id: "c-1".into(),
            tenant_id: "chapel".into(),
            pledge_id: "p-1".into(),
            ledger_seq: 1,
            amount_cents: 5000,
            currency: "USD".into(),
            status: "SUCCESS".into(),
            transaction_id: Some("txn_1".into()),
            failure_reason: None,
            attempt_count: 0,
            cycle_start: p.next_charge_at.clone(),
            charged_at: None,
            failed_at: None,
            created_at: p.created_at.clone(),
            updated_at: p.created_at.clone(),
        };
        let receipt = receipt_message(&p, &charge);
        assert_eq!(receipt.subject, "Thank you for your gift of 50.00 USD");
        assert!(receipt.text_body.contains("Visa ending in 4242"));
        assert!(receipt.html_body.contains("&lt;Naomi&gt;"));
    }

    #[tokio::test]
    async fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.send("a@example.org", "Hi", "body", "<p>body</p>").await.unwrap();
        assert_eq!(notifier.sent().len(), 1);

        let failing = RecordingNotifier::failing();
        assert!(failing.send("a@example.org", "Hi", "body", "").await.is_err());
        assert!(failing.sent().is_empty());
    }
}
