//! Donation record operations using Diesel with tenant scoping
//!
//! One row per SUCCESS charge; the unique `charge_id` column rejects a
//! second record for the same charge.

use diesel::prelude::*;
use uuid::Uuid;

use super::context::TenantContext;
use super::diesel_schema::donation_records;
use super::models::{DonationRecord, NewDonationRecord, Pledge};
use crate::error::{BillingError, Result};

/// Input for recording a donation from a successful charge
#[derive(Debug, Clone)]
pub struct CreateDonationInput<'a> {
    pub pledge: &'a Pledge,
    pub charge_id: &'a str,
    pub amount_cents: i64,
    pub currency: &'a str,
    pub created_at: &'a str,
}

/// Record the donor-facing gift for a successful charge
pub fn record_donation(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    input: CreateDonationInput<'_>,
) -> Result<DonationRecord> {
    let id = Uuid::new_v4().to_string();
    let display_name = input.pledge.display_name();

    let new_record = NewDonationRecord {
        id: &id,
        tenant_id: &ctx.tenant_id,
        pledge_id: &input.pledge.id,
        charge_id: input.charge_id,
        donor_id: &input.pledge.donor_id,
        fund_id: &input.pledge.fund_id,
        display_name: &display_name,
        amount_cents: input.amount_cents,
        currency: input.currency,
        is_anonymous: input.pledge.is_anonymous,
        dedication_note: input.pledge.dedication_note.as_deref(),
        created_at: input.created_at,
    };

    diesel::insert_into(donation_records::table)
        .values(&new_record)
        .execute(conn)
        .map_err(|e| BillingError::Internal(format!("Insert failed: {}", e)))?;

    donation_records::table
        .filter(donation_records::id.eq(&id))
        .select(DonationRecord::as_select())
        .first(conn)
        .map_err(|e| BillingError::Internal(format!("Failed to retrieve donation: {}", e)))
}

/// Donations produced by a pledge, oldest first
pub fn list_donations_for_pledge(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    pledge_id: &str,
) -> Result<Vec<DonationRecord>> {
    donation_records::table
        .filter(donation_records::tenant_id.eq(&ctx.tenant_id))
        .filter(donation_records::pledge_id.eq(pledge_id))
        .order(donation_records::created_at.asc())
        .select(DonationRecord::as_select())
        .load(conn)
        .map_err(BillingError::from)
}

/// Sum of donations to a fund for a tenant, in minor units
pub fn fund_total_cents(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    fund_id: &str,
) -> Result<i64> {
    let amounts: Vec<i64> = donation_records::table
        .filter(donation_records::tenant_id.eq(&ctx.tenant_id))
        .filter(donation_records::fund_id.eq(fund_id))
        .select(donation_records::amount_cents)
        .load(conn)
        .map_err(BillingError::from)?;

    Ok(amounts.into_iter().sum())
}
