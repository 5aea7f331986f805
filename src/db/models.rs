//! Diesel model definitions for database tables
//!
//! All models include `tenant_id` for multi-tenant scoping.
//! - Queryable structs: for SELECT queries (reading data)
//! - Insertable structs: for INSERT queries (writing data)
//!
//! Timestamps are stored as fixed-width ISO 8601 TEXT so that string
//! comparison in SQL matches chronological order.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::diesel_schema::*;
use crate::calendar::Frequency;
use crate::error::{BillingError, Result};

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Format a UTC timestamp for a TEXT column
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Get current UTC timestamp for a TEXT column
pub fn current_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parse a timestamp read back from a TEXT column
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| BillingError::InvalidData(format!("Bad timestamp '{}': {}", value, e)))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| BillingError::InvalidData(format!("Bad date '{}': {}", value, e)))
}

/// Render minor currency units as a decimal amount ("5000" → "50.00")
pub fn format_amount(amount_cents: i64) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let abs = amount_cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

// ============================================================================
// Status Values
// ============================================================================

/// Pledge status values
pub mod pledge_statuses {
    pub const ACTIVE: &str = "ACTIVE";
    pub const PAUSED: &str = "PAUSED";
    pub const CANCELLED: &str = "CANCELLED";
    /// Paused by the failure threshold, pending donor action
    pub const FAILED: &str = "FAILED";
    pub const COMPLETED: &str = "COMPLETED";

    /// Terminal statuses are never left by this crate
    pub fn is_terminal(status: &str) -> bool {
        status == CANCELLED || status == COMPLETED
    }
}

/// Charge status values
pub mod charge_statuses {
    pub const PENDING: &str = "PENDING";
    pub const SUCCESS: &str = "SUCCESS";
    pub const FAILED: &str = "FAILED";
}

// ============================================================================
// Pledge Models
// ============================================================================

/// Pledge row from SELECT query
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = pledges)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Pledge {
    pub id: String,
    pub tenant_id: String,
    pub donor_id: String,
    pub donor_name: Option<String>,
    pub donor_email: Option<String>,
    pub fund_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub frequency: String,
    pub start_date: String,
    pub end_date: Option<String>,
    pub next_charge_at: String,
    pub last_charged_at: Option<String>,
    pub last_failed_at: Option<String>,
    pub last_failure_reason: Option<String>,
    pub status: String,
    pub failure_count: i32,
    pub total_charges_count: i32,
    pub total_amount_cents: i64,
    pub payment_method_token: Option<String>,
    pub payment_method_last4: Option<String>,
    pub payment_method_brand: Option<String>,
    pub is_anonymous: bool,
    pub dedication_note: Option<String>,
    pub claim_token: Option<String>,
    pub claimed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Pledge {
    pub fn frequency(&self) -> Result<Frequency> {
        self.frequency.parse()
    }

    pub fn end_date(&self) -> Result<Option<NaiveDate>> {
        self.end_date.as_deref().map(parse_date).transpose()
    }

    pub fn next_charge_at(&self) -> Result<DateTime<Utc>> {
        parse_timestamp(&self.next_charge_at)
    }

    /// Name shown on the donation record and receipt
    pub fn display_name(&self) -> String {
        if self.is_anonymous {
            return "Anonymous".to_string();
        }
        self.donor_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Anonymous".to_string())
    }

    /// "Visa ending in 4242" style label, when the UI metadata is present
    pub fn payment_method_label(&self) -> Option<String> {
        match (&self.payment_method_brand, &self.payment_method_last4) {
            (Some(brand), Some(last4)) => Some(format!("{} ending in {}", brand, last4)),
            (None, Some(last4)) => Some(format!("card ending in {}", last4)),
            _ => None,
        }
    }
}

/// New pledge for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = pledges)]
pub struct NewPledge<'a> {
    pub id: &'a str,
    pub tenant_id: &'a str,
    pub donor_id: &'a str,
    pub donor_name: Option<&'a str>,
    pub donor_email: Option<&'a str>,
    pub fund_id: &'a str,
    pub amount_cents: i64,
    pub currency: &'a str,
    pub frequency: &'a str,
    pub start_date: &'a str,
    pub end_date: Option<&'a str>,
    pub next_charge_at: &'a str,
    pub status: &'a str,
    pub payment_method_token: Option<&'a str>,
    pub payment_method_last4: Option<&'a str>,
    pub payment_method_brand: Option<&'a str>,
    pub is_anonymous: bool,
    pub dedication_note: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

// ============================================================================
// Charge Models
// ============================================================================

/// Charge ledger row
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = charges)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Charge {
    pub id: String,
    pub tenant_id: String,
    pub pledge_id: String,
    /// Position in the pledge's own ledger, starting at 1
    pub ledger_seq: i32,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    /// 1-based attempt number within the billing cycle once finalized
    pub attempt_count: i32,
    /// `next_charge_at` of the pledge when this attempt was made
    pub cycle_start: String,
    pub charged_at: Option<String>,
    pub failed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Charge {
    pub fn is_pending(&self) -> bool {
        self.status == charge_statuses::PENDING
    }
}

/// New charge for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = charges)]
pub struct NewCharge<'a> {
    pub id: &'a str,
    pub tenant_id: &'a str,
    pub pledge_id: &'a str,
    pub ledger_seq: i32,
    pub amount_cents: i64,
    pub currency: &'a str,
    pub status: &'a str,
    pub attempt_count: i32,
    pub cycle_start: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

// ============================================================================
// Donation Models
// ============================================================================

/// Donor-facing donation row
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = donation_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DonationRecord {
    pub id: String,
    pub tenant_id: String,
    pub pledge_id: String,
    pub charge_id: String,
    pub donor_id: String,
    pub fund_id: String,
    pub display_name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub is_anonymous: bool,
    pub dedication_note: Option<String>,
    pub created_at: String,
}

impl DonationRecord {
    /// Decimal amount, e.g. "50.00"
    pub fn amount(&self) -> String {
        format_amount(self.amount_cents)
    }
}

/// New donation record for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = donation_records)]
pub struct NewDonationRecord<'a> {
    pub id: &'a str,
    pub tenant_id: &'a str,
    pub pledge_id: &'a str,
    pub charge_id: &'a str,
    pub donor_id: &'a str,
    pub fund_id: &'a str,
    pub display_name: &'a str,
    pub amount_cents: i64,
    pub currency: &'a str,
    pub is_anonymous: bool,
    pub dedication_note: Option<&'a str>,
    pub created_at: &'a str,
}

// ============================================================================
// Tenant Settings Models
// ============================================================================

/// Tenant pledge policy row
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = tenant_pledge_settings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TenantSettingsRow {
    pub tenant_id: String,
    pub max_failures_before_pause: i32,
    pub retry_interval_hours: i32,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_round_trip_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2025, 2, 9, 23, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 2, 10, 1, 0, 0).unwrap();
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert!(a < b);
        assert_eq!(parse_timestamp(&a).unwrap(), early);
        assert_eq!(a, "2025-02-09T23:00:00.000Z");
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(5000), "50.00");
        assert_eq!(format_amount(2505), "25.05");
        assert_eq!(format_amount(7), "0.07");
    }

    #[test]
    fn test_pledge_statuses() {
        assert!(pledge_statuses::is_terminal(pledge_statuses::COMPLETED));
        assert!(pledge_statuses::is_terminal(pledge_statuses::CANCELLED));
        assert!(!pledge_statuses::is_terminal(pledge_statuses::FAILED));
    }
}
