//! SQLite database module for pledge billing state
//!
//! Diesel over SQLite with an r2d2 pool. Repository modules expose plain
//! functions taking `&mut SqliteConnection` and a `TenantContext`; services
//! reach them through [`PledgeDb::with_conn`].
//!
//! ## Tables
//!
//! - `pledges` - Standing donor commitments and their scheduling/health state
//! - `charges` - Append-only ledger of charge attempts
//! - `donation_records` - Donor-facing gift entries (successful charges only)
//! - `tenant_pledge_settings` - Per-tenant failure/retry policy

pub mod charges;
pub mod context;
pub mod diesel_schema;
pub mod donations;
pub mod models;
pub mod pledges;
pub mod schema;
pub mod tenant_settings;

use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use tracing::{debug, info};

use crate::error::{BillingError, Result};

pub use context::TenantContext;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection SQLite settings applied when the pool hands out a connection
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout_ms: u32,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Pooled SQLite database for pledges, charges and donations
pub struct PledgeDb {
    pool: DbPool,
}

impl PledgeDb {
    /// Open or create the pledge database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("Opening pledge database at {:?}", db_path);

        let manager = ConnectionManager::<SqliteConnection>::new(db_path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(8)
            .connection_customizer(Box::new(ConnectionOptions { busy_timeout_ms: 5000 }))
            .build(manager)
            .map_err(|e| BillingError::Pool(format!("Failed to open SQLite pool: {}", e)))?;

        let db = Self { pool };

        // Enable WAL mode for concurrent readers during a sweep
        db.with_conn(|conn| {
            conn.batch_execute("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
                .map_err(|e| BillingError::Internal(format!("Failed to set PRAGMA: {}", e)))
        })?;

        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    ///
    /// A single pooled connection keeps every caller on the same in-memory
    /// database, so it must never be recycled.
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory pledge database");

        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_customizer(Box::new(ConnectionOptions { busy_timeout_ms: 0 }))
            .build(manager)
            .map_err(|e| BillingError::Pool(format!("Failed to open in-memory SQLite: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(schema::init_schema)
    }

    /// Get a pooled connection
    pub fn conn(&self) -> Result<DbConn> {
        self.pool
            .get()
            .map_err(|e| BillingError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// Run `f` with a pooled connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T>,
    {
        let mut conn = self.conn()?;
        f(&mut conn)
    }

    /// Run `f` inside a transaction; any error rolls the whole unit back
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T>,
    {
        let mut pooled = self.conn()?;
        let conn: &mut SqliteConnection = &mut pooled;
        conn.transaction(f)
    }

    /// Get database statistics across all tenants
    pub fn stats(&self) -> Result<DbStats> {
        use diesel_schema::{charges, donation_records, pledges};

        self.with_conn(|conn| {
            let pledge_count: i64 = pledges::table.count().get_result(conn)?;
            let active_pledges: i64 = pledges::table
                .filter(pledges::status.eq(models::pledge_statuses::ACTIVE))
                .count()
                .get_result(conn)?;
            let charge_count: i64 = charges::table.count().get_result(conn)?;
            let pending_charges: i64 = charges::table
                .filter(charges::status.eq(models::charge_statuses::PENDING))
                .count()
                .get_result(conn)?;
            let donation_count: i64 = donation_records::table.count().get_result(conn)?;

            Ok(DbStats {
                pledge_count: pledge_count as u64,
                active_pledges: active_pledges as u64,
                charge_count: charge_count as u64,
                pending_charges: pending_charges as u64,
                donation_count: donation_count as u64,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub pledge_count: u64,
    pub active_pledges: u64,
    pub charge_count: u64,
    pub pending_charges: u64,
    pub donation_count: u64,
}

// Re-exports
pub use charges::CreateChargeInput;
pub use donations::CreateDonationInput;
pub use models::{Charge, DonationRecord, Pledge, TenantSettingsRow};
pub use pledges::CreatePledgeInput;
