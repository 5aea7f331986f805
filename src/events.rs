//! Event system for billing operations
//!
//! The processor emits a [`BillingEvent`] for every charge it finalizes and
//! every pledge state change it makes. Useful for:
//! - Audit logging
//! - Dashboards and fund totals
//! - Downstream sync

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Billing events emitted by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    ChargeSucceeded {
        tenant_id: String,
        pledge_id: String,
        charge_id: String,
        transaction_id: String,
        amount_cents: i64,
        currency: String,
    },
    ChargeFailed {
        tenant_id: String,
        pledge_id: String,
        charge_id: String,
        reason: String,
        failure_count: i32,
    },
    /// Failure threshold reached, pledge is now FAILED
    PledgePaused {
        tenant_id: String,
        pledge_id: String,
        failure_count: i32,
    },
    PledgeCompleted {
        tenant_id: String,
        pledge_id: String,
    },
    /// Selected but not charged (claimed elsewhere or a PENDING charge is unresolved)
    PledgeSkipped {
        tenant_id: String,
        pledge_id: String,
        reason: String,
    },
}

impl BillingEvent {
    pub fn pledge_id(&self) -> &str {
        match self {
            Self::ChargeSucceeded { pledge_id, .. }
            | Self::ChargeFailed { pledge_id, .. }
            | Self::PledgePaused { pledge_id, .. }
            | Self::PledgeCompleted { pledge_id, .. }
            | Self::PledgeSkipped { pledge_id, .. } => pledge_id,
        }
    }
}

/// Event bus for broadcasting billing events
pub struct EventBus {
    sender: broadcast::Sender<BillingEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: BillingEvent) {
        trace!(event = ?event, "Emitting billing event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BillingEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that writes an audit line per event
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

fn log_event(event: &BillingEvent) {
    match event {
        BillingEvent::ChargeSucceeded {
            tenant_id,
            pledge_id,
            transaction_id,
            amount_cents,
            ..
        } => {
            info!(%tenant_id, %pledge_id, %transaction_id, amount_cents, "Charge succeeded");
        }
        BillingEvent::PledgePaused {
            tenant_id,
            pledge_id,
            failure_count,
        } => {
            warn!(%tenant_id, %pledge_id, failure_count, "Pledge paused after repeated failures");
        }
        _ => {
            debug!(event = ?event, "Billing event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(BillingEvent::PledgeCompleted {
            tenant_id: "chapel".into(),
            pledge_id: "p-1".into(),
        });

        let event = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("timed out")
            .expect("recv failed");
        assert_eq!(event.pledge_id(), "p-1");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(BillingEvent::PledgeSkipped {
            tenant_id: "chapel".into(),
            pledge_id: "p-1".into(),
            reason: "claimed".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
