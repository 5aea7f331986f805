//! Pledge CRUD and state transitions using Diesel with tenant scoping
//!
//! The scheduler only writes scheduling and health columns here. Pledge
//! terms are owned by the donor/admin handlers that call [`create_pledge`].

use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

use super::context::TenantContext;
use super::diesel_schema::pledges;
use super::models::{format_date, format_timestamp, pledge_statuses, NewPledge, Pledge};
use crate::calendar::Frequency;
use crate::error::{BillingError, Result};

// ============================================================================
// Query Types
// ============================================================================

/// Input for creating a pledge
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePledgeInput {
    #[serde(default)]
    pub id: Option<String>,
    pub donor_id: String,
    #[serde(default)]
    pub donor_name: Option<String>,
    #[serde(default)]
    pub donor_email: Option<String>,
    pub fund_id: String,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// First charge time; defaults to midnight UTC on `start_date`
    #[serde(default)]
    pub next_charge_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub payment_method_token: Option<String>,
    #[serde(default)]
    pub payment_method_last4: Option<String>,
    #[serde(default)]
    pub payment_method_brand: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub dedication_note: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Scheduling columns written after a successful charge
#[derive(Debug, Clone)]
pub struct SuccessUpdate<'a> {
    pub charged_at: &'a str,
    /// New `next_charge_at`; the current value when the pledge completes
    pub next_charge_at: &'a str,
    /// ACTIVE, or COMPLETED when the next cycle would fall past `end_date`
    pub status: &'a str,
    pub amount_cents: i64,
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get pledge by ID - scoped by tenant
pub fn get_pledge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
) -> Result<Option<Pledge>> {
    pledges::table
        .filter(pledges::tenant_id.eq(&ctx.tenant_id))
        .filter(pledges::id.eq(id))
        .select(Pledge::as_select())
        .first(conn)
        .optional()
        .map_err(BillingError::from)
}

/// ACTIVE pledges whose `next_charge_at` has arrived, oldest-due first
///
/// `tenant = None` selects across every tenant.
pub fn list_due_pledges(
    conn: &mut SqliteConnection,
    tenant: Option<&TenantContext>,
    now: &str,
) -> Result<Vec<Pledge>> {
    let mut base_query = pledges::table
        .filter(pledges::status.eq(pledge_statuses::ACTIVE))
        .filter(pledges::next_charge_at.le(now))
        .select(Pledge::as_select())
        .into_boxed();

    if let Some(ctx) = tenant {
        base_query = base_query.filter(pledges::tenant_id.eq(&ctx.tenant_id));
    }

    base_query
        .order((pledges::next_charge_at.asc(), pledges::id.asc()))
        .load(conn)
        .map_err(|e| BillingError::Internal(format!("Due pledge query failed: {}", e)))
}

/// ACTIVE pledges carrying at least one unresolved failure, oldest-due first
///
/// The per-tenant cooldown is applied by the caller, which knows each
/// tenant's retry interval.
pub fn list_retry_candidates(
    conn: &mut SqliteConnection,
    tenant: Option<&TenantContext>,
) -> Result<Vec<Pledge>> {
    let mut base_query = pledges::table
        .filter(pledges::status.eq(pledge_statuses::ACTIVE))
        .filter(pledges::failure_count.gt(0))
        .filter(pledges::last_failed_at.is_not_null())
        .select(Pledge::as_select())
        .into_boxed();

    if let Some(ctx) = tenant {
        base_query = base_query.filter(pledges::tenant_id.eq(&ctx.tenant_id));
    }

    base_query
        .order((pledges::next_charge_at.asc(), pledges::id.asc()))
        .load(conn)
        .map_err(|e| BillingError::Internal(format!("Retry candidate query failed: {}", e)))
}

// ============================================================================
// Write Operations
// ============================================================================

/// Create a pledge - scoped by tenant
pub fn create_pledge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    input: CreatePledgeInput,
) -> Result<Pledge> {
    if input.amount_cents <= 0 {
        return Err(BillingError::InvalidInput(format!(
            "amount_cents must be positive, got {}",
            input.amount_cents
        )));
    }
    if input.currency.len() != 3 || !input.currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(BillingError::InvalidInput(format!(
            "Invalid currency code: {}",
            input.currency
        )));
    }
    if let Some(end) = input.end_date {
        if end <= input.start_date {
            return Err(BillingError::InvalidInput(format!(
                "end_date {} must be after start_date {}",
                end, input.start_date
            )));
        }
    }

    let id = input.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let currency = input.currency.to_ascii_uppercase();
    let start_date = format_date(input.start_date);
    let end_date = input.end_date.map(format_date);
    let next_charge_at = format_timestamp(input.next_charge_at.unwrap_or_else(|| {
        input.start_date.and_time(chrono::NaiveTime::MIN).and_utc()
    }));
    let now = format_timestamp(Utc::now());

    let new_pledge = NewPledge {
        id: &id,
        tenant_id: &ctx.tenant_id,
        donor_id: &input.donor_id,
        donor_name: input.donor_name.as_deref(),
        donor_email: input.donor_email.as_deref(),
        fund_id: &input.fund_id,
        amount_cents: input.amount_cents,
        currency: &currency,
        frequency: input.frequency.as_str(),
        start_date: &start_date,
        end_date: end_date.as_deref(),
        next_charge_at: &next_charge_at,
        status: pledge_statuses::ACTIVE,
        payment_method_token: input.payment_method_token.as_deref(),
        payment_method_last4: input.payment_method_last4.as_deref(),
        payment_method_brand: input.payment_method_brand.as_deref(),
        is_anonymous: input.is_anonymous,
        dedication_note: input.dedication_note.as_deref(),
        created_at: &now,
        updated_at: &now,
    };

    diesel::insert_into(pledges::table)
        .values(&new_pledge)
        .execute(conn)
        .map_err(|e| BillingError::Internal(format!("Insert failed: {}", e)))?;

    get_pledge(conn, ctx, &id)?
        .ok_or_else(|| BillingError::Internal("Failed to retrieve created pledge".into()))
}

/// Claim a pledge for one processing run
///
/// Compare-and-swap on the claim columns: succeeds only if the pledge is
/// still ACTIVE, unchanged since it was selected (`expected_updated_at`),
/// and either unclaimed or holding a claim older than `stale_before`.
pub fn claim_pledge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
    expected_updated_at: &str,
    token: &str,
    now: &str,
    stale_before: &str,
) -> Result<bool> {
    let updated = diesel::update(
        pledges::table
            .filter(pledges::tenant_id.eq(&ctx.tenant_id))
            .filter(pledges::id.eq(id))
            .filter(pledges::status.eq(pledge_statuses::ACTIVE))
            .filter(pledges::updated_at.eq(expected_updated_at))
            .filter(
                pledges::claim_token
                    .is_null()
                    .or(pledges::claimed_at.lt(stale_before)),
            ),
    )
    .set((
        pledges::claim_token.eq(Some(token)),
        pledges::claimed_at.eq(Some(now)),
    ))
    .execute(conn)
    .map_err(|e| BillingError::Internal(format!("Claim failed: {}", e)))?;

    Ok(updated == 1)
}

/// Release a claim held by `token`; a claim taken over by another run is left alone
pub fn release_claim(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
    token: &str,
) -> Result<()> {
    diesel::update(
        pledges::table
            .filter(pledges::tenant_id.eq(&ctx.tenant_id))
            .filter(pledges::id.eq(id))
            .filter(pledges::claim_token.eq(token)),
    )
    .set((
        pledges::claim_token.eq(None::<String>),
        pledges::claimed_at.eq(None::<String>),
    ))
    .execute(conn)
    .map_err(|e| BillingError::Internal(format!("Claim release failed: {}", e)))?;

    Ok(())
}

/// Apply a successful charge to the pledge's scheduling state and aggregates
pub fn record_success(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
    update: &SuccessUpdate<'_>,
) -> Result<Pledge> {
    diesel::update(
        pledges::table
            .filter(pledges::tenant_id.eq(&ctx.tenant_id))
            .filter(pledges::id.eq(id)),
    )
    .set((
        pledges::last_charged_at.eq(Some(update.charged_at)),
        pledges::failure_count.eq(0),
        pledges::next_charge_at.eq(update.next_charge_at),
        pledges::status.eq(update.status),
        pledges::total_charges_count.eq(pledges::total_charges_count + 1),
        pledges::total_amount_cents.eq(pledges::total_amount_cents + update.amount_cents),
        pledges::updated_at.eq(update.charged_at),
    ))
    .execute(conn)
    .map_err(|e| BillingError::Internal(format!("Update failed: {}", e)))?;

    get_pledge(conn, ctx, id)?
        .ok_or_else(|| BillingError::NotFound(format!("Pledge {}", id)))
}

/// Apply a failed charge; pauses the pledge once `max_failures` is reached
///
/// `next_charge_at` is left untouched in both outcomes, so a pledge below
/// the threshold stays due and is picked up again by the next due sweep.
pub fn record_failure(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
    failed_at: &str,
    reason: &str,
    max_failures: u32,
) -> Result<Pledge> {
    let pledge = get_pledge(conn, ctx, id)?
        .ok_or_else(|| BillingError::NotFound(format!("Pledge {}", id)))?;

    let failure_count = pledge.failure_count.saturating_add(1);
    let status = if i64::from(failure_count) >= i64::from(max_failures) {
        pledge_statuses::FAILED
    } else {
        pledge.status.as_str()
    };

    diesel::update(
        pledges::table
            .filter(pledges::tenant_id.eq(&ctx.tenant_id))
            .filter(pledges::id.eq(id)),
    )
    .set((
        pledges::last_failed_at.eq(Some(failed_at)),
        pledges::last_failure_reason.eq(Some(reason)),
        pledges::failure_count.eq(failure_count),
        pledges::status.eq(status),
        pledges::updated_at.eq(failed_at),
    ))
    .execute(conn)
    .map_err(|e| BillingError::Internal(format!("Update failed: {}", e)))?;

    get_pledge(conn, ctx, id)?
        .ok_or_else(|| BillingError::NotFound(format!("Pledge {}", id)))
}

/// Mark a pledge COMPLETED without charging (its end date has passed)
pub fn mark_completed(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
    now: &str,
) -> Result<Pledge> {
    set_status(conn, ctx, id, pledge_statuses::COMPLETED, now)
}

/// Return a paused or failed pledge to ACTIVE with a clean failure count
pub fn resume_pledge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
) -> Result<Pledge> {
    let pledge = get_pledge(conn, ctx, id)?
        .ok_or_else(|| BillingError::NotFound(format!("Pledge {}", id)))?;

    if pledge.status != pledge_statuses::FAILED && pledge.status != pledge_statuses::PAUSED {
        return Err(BillingError::InvalidInput(format!(
            "Cannot resume pledge {} in status {}",
            id, pledge.status
        )));
    }

    let now = format_timestamp(Utc::now());
    diesel::update(
        pledges::table
            .filter(pledges::tenant_id.eq(&ctx.tenant_id))
            .filter(pledges::id.eq(id)),
    )
    .set((
        pledges::status.eq(pledge_statuses::ACTIVE),
        pledges::failure_count.eq(0),
        pledges::updated_at.eq(&now),
    ))
    .execute(conn)
    .map_err(|e| BillingError::Internal(format!("Update failed: {}", e)))?;

    get_pledge(conn, ctx, id)?
        .ok_or_else(|| BillingError::Internal("Failed to retrieve resumed pledge".into()))
}

/// Cancel a pledge; terminal pledges refuse
pub fn cancel_pledge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
) -> Result<Pledge> {
    let pledge = get_pledge(conn, ctx, id)?
        .ok_or_else(|| BillingError::NotFound(format!("Pledge {}", id)))?;

    if pledge_statuses::is_terminal(&pledge.status) {
        return Err(BillingError::InvalidInput(format!(
            "Pledge {} is already {}",
            id, pledge.status
        )));
    }

    set_status(conn, ctx, id, pledge_statuses::CANCELLED, &format_timestamp(Utc::now()))
}

fn set_status(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
    status: &str,
    now: &str,
) -> Result<Pledge> {
    diesel::update(
        pledges::table
            .filter(pledges::tenant_id.eq(&ctx.tenant_id))
            .filter(pledges::id.eq(id)),
    )
    .set((pledges::status.eq(status), pledges::updated_at.eq(now)))
    .execute(conn)
    .map_err(|e| BillingError::Internal(format!("Update failed: {}", e)))?;

    get_pledge(conn, ctx, id)?
        .ok_or_else(|| BillingError::NotFound(format!("Pledge {}", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use chrono::{Duration, TimeZone};

    fn setup_test_db() -> SqliteConnection {
        let mut conn = SqliteConnection::establish(":memory:")
            .expect("Failed to create in-memory database");
        init_schema(&mut conn).expect("Failed to create schema");
        conn
    }

    fn pledge_input(id: &str, next_charge_at: chrono::DateTime<Utc>) -> CreatePledgeInput {
        CreatePledgeInput {
            id: Some(id.to_string()),
            donor_id: "donor-1".to_string(),
            donor_name: Some("Ruth".to_string()),
            donor_email: Some("ruth@example.org".to_string()),
            fund_id: "general".to_string(),
            amount_cents: 2500,
            currency: "usd".to_string(),
            frequency: Frequency::Monthly,
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            end_date: None,
            next_charge_at: Some(next_charge_at),
            payment_method_token: Some("tok_visa".to_string()),
            payment_method_last4: Some("4242".to_string()),
            payment_method_brand: Some("Visa".to_string()),
            is_anonymous: false,
            dedication_note: None,
        }
    }

    #[test]
    fn test_create_pledge_validates_terms() {
        let mut conn = setup_test_db();
        let ctx = TenantContext::new("chapel");
        let now = Utc::now();

        let mut bad_amount = pledge_input("p-bad", now);
        bad_amount.amount_cents = 0;
        assert!(matches!(
            create_pledge(&mut conn, &ctx, bad_amount),
            Err(BillingError::InvalidInput(_))
        ));

        let created = create_pledge(&mut conn, &ctx, pledge_input("p-1", now)).unwrap();
        assert_eq!(created.currency, "USD");
        assert_eq!(created.status, pledge_statuses::ACTIVE);
        assert_eq!(created.failure_count, 0);
    }

    #[test]
    fn test_due_selection_orders_oldest_first_and_scopes_tenant() {
        let mut conn = setup_test_db();
        let chapel = TenantContext::new("chapel");
        let abbey = TenantContext::new("abbey");
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();

        create_pledge(&mut conn, &chapel, pledge_input("late", now - Duration::hours(1))).unwrap();
        create_pledge(&mut conn, &chapel, pledge_input("early", now - Duration::days(3))).unwrap();
        create_pledge(&mut conn, &chapel, pledge_input("future", now + Duration::hours(1))).unwrap();
        create_pledge(&mut conn, &abbey, pledge_input("abbey-due", now - Duration::days(1))).unwrap();

        let now_str = format_timestamp(now);
        let all: Vec<String> = list_due_pledges(&mut conn, None, &now_str)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(all, vec!["early", "abbey-due", "late"]);

        let chapel_only: Vec<String> = list_due_pledges(&mut conn, Some(&chapel), &now_str)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(chapel_only, vec!["early", "late"]);
    }

    #[test]
    fn test_claim_is_exclusive_until_released_or_stale() {
        let mut conn = setup_test_db();
        let ctx = TenantContext::new("chapel");
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let pledge = create_pledge(&mut conn, &ctx, pledge_input("p-1", now)).unwrap();

        let now_str = format_timestamp(now);
        let stale = format_timestamp(now - Duration::minutes(15));
        assert!(claim_pledge(&mut conn, &ctx, "p-1", &pledge.updated_at, "run-a", &now_str, &stale).unwrap());
        assert!(!claim_pledge(&mut conn, &ctx, "p-1", &pledge.updated_at, "run-b", &now_str, &stale).unwrap());

        // A claim older than the stale cutoff can be taken over
        let later_stale = format_timestamp(now + Duration::minutes(1));
        assert!(claim_pledge(&mut conn, &ctx, "p-1", &pledge.updated_at, "run-b", &now_str, &later_stale).unwrap());

        // run-a no longer owns the claim, so its release is a no-op
        release_claim(&mut conn, &ctx, "p-1", "run-a").unwrap();
        let held = get_pledge(&mut conn, &ctx, "p-1").unwrap().unwrap();
        assert_eq!(held.claim_token.as_deref(), Some("run-b"));

        release_claim(&mut conn, &ctx, "p-1", "run-b").unwrap();
        let released = get_pledge(&mut conn, &ctx, "p-1").unwrap().unwrap();
        assert!(released.claim_token.is_none());
    }

    #[test]
    fn test_record_failure_pauses_at_threshold() {
        let mut conn = setup_test_db();
        let ctx = TenantContext::new("chapel");
        let now = Utc::now();
        let created = create_pledge(&mut conn, &ctx, pledge_input("p-1", now)).unwrap();
        let ts = format_timestamp(now);

        let first = record_failure(&mut conn, &ctx, "p-1", &ts, "Card declined", 3).unwrap();
        let second = record_failure(&mut conn, &ctx, "p-1", &ts, "Card declined", 3).unwrap();
        assert_eq!(second.failure_count, 2);
        assert_eq!(second.status, pledge_statuses::ACTIVE);
        assert_eq!(first.next_charge_at, created.next_charge_at);

        let third = record_failure(&mut conn, &ctx, "p-1", &ts, "Card expired", 3).unwrap();
        assert_eq!(third.failure_count, 3);
        assert_eq!(third.status, pledge_statuses::FAILED);
        assert_eq!(third.last_failure_reason.as_deref(), Some("Card expired"));
        assert_eq!(third.next_charge_at, created.next_charge_at);
    }

    #[test]
    fn test_resume_and_cancel_transitions() {
        let mut conn = setup_test_db();
        let ctx = TenantContext::new("chapel");
        let now = Utc::now();
        create_pledge(&mut conn, &ctx, pledge_input("p-1", now)).unwrap();

        // Active pledges cannot be resumed
        assert!(resume_pledge(&mut conn, &ctx, "p-1").is_err());

        let ts = format_timestamp(now);
        record_failure(&mut conn, &ctx, "p-1", &ts, "declined", 1).unwrap();
        let resumed = resume_pledge(&mut conn, &ctx, "p-1").unwrap();
        assert_eq!(resumed.status, pledge_statuses::ACTIVE);
        assert_eq!(resumed.failure_count, 0);

        let cancelled = cancel_pledge(&mut conn, &ctx, "p-1").unwrap();
        assert_eq!(cancelled.status, pledge_statuses::CANCELLED);
        assert!(cancel_pledge(&mut conn, &ctx, "p-1").is_err());
        assert!(resume_pledge(&mut conn, &ctx, "p-1").is_err());
    }
}
