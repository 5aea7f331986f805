//! Per-pledge results and batch aggregation

use serde::Serialize;

/// Result of processing one pledge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeOutcome {
    pub pledge_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChargeOutcome {
    pub fn succeeded(pledge_id: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self {
            pledge_id: pledge_id.into(),
            success: true,
            transaction_id: Some(transaction_id.into()),
            error: None,
        }
    }

    pub fn failed(pledge_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            pledge_id: pledge_id.into(),
            success: false,
            transaction_id: None,
            error: Some(error.into()),
        }
    }
}

/// Counts for one sweep, logged when the batch finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[ChargeOutcome]) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        Self {
            processed: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
        }
    }
}
