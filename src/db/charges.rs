//! Charge ledger operations using Diesel with tenant scoping
//!
//! Charges are append-only: a row is inserted PENDING before the gateway is
//! called and finalized exactly once. Finalizing filters on
//! `status = PENDING`, so a second finalize of the same row is rejected.

use diesel::prelude::*;
use uuid::Uuid;

use super::context::TenantContext;
use super::diesel_schema::charges;
use super::models::{charge_statuses, Charge, NewCharge};
use crate::error::{BillingError, Result};

// ============================================================================
// Query Types
// ============================================================================

/// Input for opening a PENDING charge
#[derive(Debug, Clone)]
pub struct CreateChargeInput<'a> {
    pub pledge_id: &'a str,
    pub amount_cents: i64,
    pub currency: &'a str,
    /// Pledge `next_charge_at` identifying the billing cycle
    pub cycle_start: &'a str,
    pub created_at: &'a str,
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get charge by ID - scoped by tenant
pub fn get_charge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
) -> Result<Option<Charge>> {
    charges::table
        .filter(charges::tenant_id.eq(&ctx.tenant_id))
        .filter(charges::id.eq(id))
        .select(Charge::as_select())
        .first(conn)
        .optional()
        .map_err(BillingError::from)
}

/// A pledge's charge history in creation order
pub fn list_charges_for_pledge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    pledge_id: &str,
) -> Result<Vec<Charge>> {
    charges::table
        .filter(charges::tenant_id.eq(&ctx.tenant_id))
        .filter(charges::pledge_id.eq(pledge_id))
        .order(charges::ledger_seq.asc())
        .select(Charge::as_select())
        .load(conn)
        .map_err(BillingError::from)
}

/// Oldest unresolved PENDING charge for a pledge, if any
pub fn find_pending_charge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    pledge_id: &str,
) -> Result<Option<Charge>> {
    charges::table
        .filter(charges::tenant_id.eq(&ctx.tenant_id))
        .filter(charges::pledge_id.eq(pledge_id))
        .filter(charges::status.eq(charge_statuses::PENDING))
        .order(charges::ledger_seq.asc())
        .select(Charge::as_select())
        .first(conn)
        .optional()
        .map_err(BillingError::from)
}

// ============================================================================
// Write Operations
// ============================================================================

/// Insert a PENDING charge ahead of the gateway call
///
/// `attempt_count` starts at the number of failed attempts already recorded
/// for the same cycle; finalizing adds this attempt, so a finalized charge
/// carries its 1-based attempt number within the cycle.
pub fn create_pending_charge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    input: CreateChargeInput<'_>,
) -> Result<Charge> {
    let prior_failures: i64 = charges::table
        .filter(charges::tenant_id.eq(&ctx.tenant_id))
        .filter(charges::pledge_id.eq(input.pledge_id))
        .filter(charges::cycle_start.eq(input.cycle_start))
        .filter(charges::status.eq(charge_statuses::FAILED))
        .count()
        .get_result(conn)
        .map_err(|e| BillingError::Internal(format!("Count query failed: {}", e)))?;

    let last_seq: Option<i32> = charges::table
        .filter(charges::pledge_id.eq(input.pledge_id))
        .select(diesel::dsl::max(charges::ledger_seq))
        .first(conn)
        .map_err(BillingError::from)?;

    let id = Uuid::new_v4().to_string();
    let new_charge = NewCharge {
        id: &id,
        tenant_id: &ctx.tenant_id,
        pledge_id: input.pledge_id,
        ledger_seq: last_seq.unwrap_or(0) + 1,
        amount_cents: input.amount_cents,
        currency: input.currency,
        status: charge_statuses::PENDING,
        attempt_count: i32::try_from(prior_failures).unwrap_or(i32::MAX),
        cycle_start: input.cycle_start,
        created_at: input.created_at,
        updated_at: input.created_at,
    };

    diesel::insert_into(charges::table)
        .values(&new_charge)
        .execute(conn)
        .map_err(|e| BillingError::Internal(format!("Insert failed: {}", e)))?;

    get_charge(conn, ctx, &id)?
        .ok_or_else(|| BillingError::Internal("Failed to retrieve created charge".into()))
}

/// Finalize a PENDING charge as SUCCESS and count the attempt
pub fn mark_succeeded(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
    transaction_id: &str,
    charged_at: &str,
) -> Result<Charge> {
    let updated = diesel::update(
        charges::table
            .filter(charges::tenant_id.eq(&ctx.tenant_id))
            .filter(charges::id.eq(id))
            .filter(charges::status.eq(charge_statuses::PENDING)),
    )
    .set((
        charges::status.eq(charge_statuses::SUCCESS),
        charges::transaction_id.eq(Some(transaction_id)),
        charges::attempt_count.eq(charges::attempt_count + 1),
        charges::charged_at.eq(Some(charged_at)),
        charges::updated_at.eq(charged_at),
    ))
    .execute(conn)
    .map_err(|e| BillingError::Internal(format!("Update failed: {}", e)))?;

    finalized(conn, ctx, id, updated)
}

/// Finalize a PENDING charge as FAILED and count the attempt
pub fn mark_failed(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
    reason: &str,
    failed_at: &str,
) -> Result<Charge> {
    let updated = diesel::update(
        charges::table
            .filter(charges::tenant_id.eq(&ctx.tenant_id))
            .filter(charges::id.eq(id))
            .filter(charges::status.eq(charge_statuses::PENDING)),
    )
    .set((
        charges::status.eq(charge_statuses::FAILED),
        charges::failure_reason.eq(Some(reason)),
        charges::attempt_count.eq(charges::attempt_count + 1),
        charges::failed_at.eq(Some(failed_at)),
        charges::updated_at.eq(failed_at),
    ))
    .execute(conn)
    .map_err(|e| BillingError::Internal(format!("Update failed: {}", e)))?;

    finalized(conn, ctx, id, updated)
}

fn finalized(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    id: &str,
    updated: usize,
) -> Result<Charge> {
    if updated == 0 {
        return match get_charge(conn, ctx, id)? {
            Some(charge) => Err(BillingError::InvalidInput(format!(
                "Charge {} is already finalized as {}",
                id, charge.status
            ))),
            None => Err(BillingError::NotFound(format!("Charge {}", id))),
        };
    }

    get_charge(conn, ctx, id)?
        .ok_or_else(|| BillingError::Internal("Failed to retrieve finalized charge".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Frequency;
    use crate::db::pledges::{create_pledge, CreatePledgeInput};
    use crate::db::schema::init_schema;
    use chrono::{NaiveDate, Utc};

    fn setup_test_db() -> (SqliteConnection, TenantContext, String) {
        let mut conn = SqliteConnection::establish(":memory:")
            .expect("Failed to create in-memory database");
        init_schema(&mut conn).expect("Failed to create schema");

        let ctx = TenantContext::new("chapel");
        let pledge = create_pledge(
            &mut conn,
            &ctx,
            CreatePledgeInput {
                id: Some("p-1".to_string()),
                donor_id: "donor-1".to_string(),
                donor_name: None,
                donor_email: None,
                fund_id: "general".to_string(),
                amount_cents: 2500,
                currency: "USD".to_string(),
                frequency: Frequency::Weekly,
                start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                end_date: None,
                next_charge_at: Some(Utc::now()),
                payment_method_token: Some("tok_visa".to_string()),
                payment_method_last4: None,
                payment_method_brand: None,
                is_anonymous: false,
                dedication_note: None,
            },
        )
        .unwrap();

        (conn, ctx, pledge.next_charge_at)
    }

    fn open(conn: &mut SqliteConnection, ctx: &TenantContext, cycle: &str) -> Charge {
        create_pending_charge(
            conn,
            ctx,
            CreateChargeInput {
                pledge_id: "p-1",
                amount_cents: 2500,
                currency: "USD",
                cycle_start: cycle,
                created_at: "2025-05-01T12:00:00.000Z",
            },
        )
        .unwrap()
    }

    #[test]
    fn test_charge_is_finalized_exactly_once() {
        let (mut conn, ctx, cycle) = setup_test_db();
        let charge = open(&mut conn, &ctx, &cycle);
        assert!(charge.is_pending());
        assert_eq!(charge.ledger_seq, 1);

        let done = mark_succeeded(&mut conn, &ctx, &charge.id, "txn_1", "2025-05-01T12:00:01.000Z").unwrap();
        assert_eq!(done.status, charge_statuses::SUCCESS);
        assert_eq!(done.transaction_id.as_deref(), Some("txn_1"));
        assert_eq!(done.attempt_count, 1);

        let again = mark_failed(&mut conn, &ctx, &charge.id, "late failure", "2025-05-01T12:00:02.000Z");
        assert!(matches!(again, Err(BillingError::InvalidInput(_))));
    }

    #[test]
    fn test_attempt_count_tracks_failures_within_a_cycle() {
        let (mut conn, ctx, cycle) = setup_test_db();

        let first = open(&mut conn, &ctx, &cycle);
        let first = mark_failed(&mut conn, &ctx, &first.id, "declined", "2025-05-01T12:00:01.000Z").unwrap();
        assert_eq!(first.attempt_count, 1);

        let second = open(&mut conn, &ctx, &cycle);
        assert_eq!(second.attempt_count, 1);
        assert_eq!(second.ledger_seq, 2);
        let second = mark_failed(&mut conn, &ctx, &second.id, "declined", "2025-05-02T12:00:01.000Z").unwrap();
        assert_eq!(second.attempt_count, 2);

        // A new cycle starts counting again
        let next_cycle = open(&mut conn, &ctx, "2099-01-01T00:00:00.000Z");
        assert_eq!(next_cycle.attempt_count, 0);

        // Third attempt in the first cycle succeeds as attempt 3
        let third = open(&mut conn, &ctx, &cycle);
        let third = mark_succeeded(&mut conn, &ctx, &third.id, "txn_3", "2025-05-03T12:00:01.000Z").unwrap();
        assert_eq!(third.attempt_count, 3);

        let history = list_charges_for_pledge(&mut conn, &ctx, "p-1").unwrap();
        let seqs: Vec<i32> = history.iter().map(|c| c.ledger_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        let pending = find_pending_charge(&mut conn, &ctx, "p-1").unwrap().unwrap();
        assert_eq!(pending.id, next_cycle.id);
    }

    #[test]
    fn test_plain_read_errors_surface_as_database_errors() {
        // No schema: the table lookup itself fails inside diesel
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        let ctx = TenantContext::new("chapel");

        let result = get_charge(&mut conn, &ctx, "missing");
        assert!(matches!(result, Err(BillingError::Database(_))));

        let result = find_pending_charge(&mut conn, &ctx, "p-1");
        assert!(matches!(result, Err(BillingError::Database(_))));
    }
}
