//! Database schema definitions

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use tracing::info;

use crate::error::{BillingError, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

#[derive(QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = Integer)]
    version: i32,
}

/// Initialize the database schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new pledge schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating pledge schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Pledge schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .map_err(|e| BillingError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let row = diesel::sql_query("SELECT version FROM schema_version LIMIT 1")
        .get_result::<VersionRow>(conn)
        .optional()
        .map_err(|e| BillingError::Internal(format!("Failed to read schema_version: {}", e)))?;

    Ok(row.map(|r| r.version).unwrap_or(0))
}

fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<()> {
    conn.batch_execute(&format!(
        "DELETE FROM schema_version; INSERT INTO schema_version (version) VALUES ({});",
        version
    ))
    .map_err(|e| BillingError::Internal(format!("Failed to set schema_version: {}", e)))
}

fn create_tables(conn: &mut SqliteConnection) -> Result<()> {
    conn.batch_execute(PLEDGES_SCHEMA)
        .map_err(|e| BillingError::Internal(format!("Failed to create pledge tables: {}", e)))?;

    conn.batch_execute(LEDGER_SCHEMA)
        .map_err(|e| BillingError::Internal(format!("Failed to create ledger tables: {}", e)))?;

    conn.batch_execute(INDEXES_SCHEMA)
        .map_err(|e| BillingError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Pledge and tenant policy tables
const PLEDGES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pledges (
    id TEXT PRIMARY KEY NOT NULL,
    tenant_id TEXT NOT NULL,
    donor_id TEXT NOT NULL,
    donor_name TEXT,
    donor_email TEXT,
    fund_id TEXT NOT NULL,
    amount_cents INTEGER NOT NULL CHECK (amount_cents > 0),
    currency TEXT NOT NULL,
    frequency TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT,
    next_charge_at TEXT NOT NULL,
    last_charged_at TEXT,
    last_failed_at TEXT,
    last_failure_reason TEXT,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    failure_count INTEGER NOT NULL DEFAULT 0 CHECK (failure_count >= 0),
    total_charges_count INTEGER NOT NULL DEFAULT 0,
    total_amount_cents INTEGER NOT NULL DEFAULT 0,
    payment_method_token TEXT,
    payment_method_last4 TEXT,
    payment_method_brand TEXT,
    is_anonymous INTEGER NOT NULL DEFAULT 0,
    dedication_note TEXT,
    claim_token TEXT,
    claimed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tenant_pledge_settings (
    tenant_id TEXT PRIMARY KEY NOT NULL,
    max_failures_before_pause INTEGER NOT NULL DEFAULT 3,
    retry_interval_hours INTEGER NOT NULL DEFAULT 24,
    updated_at TEXT NOT NULL
);
"#;

/// Append-only ledger tables
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS charges (
    id TEXT PRIMARY KEY NOT NULL,
    tenant_id TEXT NOT NULL,
    pledge_id TEXT NOT NULL REFERENCES pledges(id),
    ledger_seq INTEGER NOT NULL,
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    transaction_id TEXT,
    failure_reason TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    cycle_start TEXT NOT NULL,
    charged_at TEXT,
    failed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (pledge_id, ledger_seq)
);

CREATE TABLE IF NOT EXISTS donation_records (
    id TEXT PRIMARY KEY NOT NULL,
    tenant_id TEXT NOT NULL,
    pledge_id TEXT NOT NULL REFERENCES pledges(id),
    charge_id TEXT NOT NULL UNIQUE REFERENCES charges(id),
    donor_id TEXT NOT NULL,
    fund_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL,
    is_anonymous INTEGER NOT NULL DEFAULT 0,
    dedication_note TEXT,
    created_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pledges_due ON pledges(status, next_charge_at);
CREATE INDEX IF NOT EXISTS idx_pledges_tenant_due ON pledges(tenant_id, status, next_charge_at);
CREATE INDEX IF NOT EXISTS idx_pledges_retry ON pledges(status, failure_count, last_failed_at);
CREATE INDEX IF NOT EXISTS idx_charges_pledge ON charges(pledge_id, ledger_seq);
CREATE INDEX IF NOT EXISTS idx_charges_pending ON charges(pledge_id, status);
CREATE INDEX IF NOT EXISTS idx_donations_pledge ON donation_records(pledge_id);
"#;
