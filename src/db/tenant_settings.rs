//! Tenant pledge policy persistence

use diesel::prelude::*;

use super::context::TenantContext;
use super::diesel_schema::tenant_pledge_settings;
use super::models::{current_timestamp, TenantSettingsRow};
use crate::error::{BillingError, Result};
use crate::settings::TenantPledgeSettings;

/// Stored policy for a tenant, `None` when the tenant never configured one
pub fn get_tenant_settings(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
) -> Result<Option<TenantPledgeSettings>> {
    let row = tenant_pledge_settings::table
        .filter(tenant_pledge_settings::tenant_id.eq(&ctx.tenant_id))
        .select(TenantSettingsRow::as_select())
        .first(conn)
        .optional()
        .map_err(BillingError::from)?;

    row.map(TenantPledgeSettings::try_from).transpose()
}

/// Insert or replace a tenant's validated policy
pub fn upsert_tenant_settings(
    conn: &mut SqliteConnection,
    ctx: &TenantContext,
    settings: &TenantPledgeSettings,
) -> Result<()> {
    settings.validate()?;

    let row = TenantSettingsRow {
        tenant_id: ctx.tenant_id.clone(),
        max_failures_before_pause: settings.max_failures_before_pause as i32,
        retry_interval_hours: settings.retry_interval_hours as i32,
        updated_at: current_timestamp(),
    };

    diesel::insert_into(tenant_pledge_settings::table)
        .values(&row)
        .on_conflict(tenant_pledge_settings::tenant_id)
        .do_update()
        .set((
            tenant_pledge_settings::max_failures_before_pause.eq(row.max_failures_before_pause),
            tenant_pledge_settings::retry_interval_hours.eq(row.retry_interval_hours),
            tenant_pledge_settings::updated_at.eq(&row.updated_at),
        ))
        .execute(conn)
        .map_err(|e| BillingError::Internal(format!("Upsert failed: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    #[test]
    fn test_upsert_replaces_existing_policy() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        let ctx = TenantContext::new("chapel");

        assert!(get_tenant_settings(&mut conn, &ctx).unwrap().is_none());

        let strict = TenantPledgeSettings { max_failures_before_pause: 1, retry_interval_hours: 6 };
        upsert_tenant_settings(&mut conn, &ctx, &strict).unwrap();
        assert_eq!(get_tenant_settings(&mut conn, &ctx).unwrap(), Some(strict));

        let relaxed = TenantPledgeSettings { max_failures_before_pause: 5, retry_interval_hours: 48 };
        upsert_tenant_settings(&mut conn, &ctx, &relaxed).unwrap();
        assert_eq!(get_tenant_settings(&mut conn, &ctx).unwrap(), Some(relaxed));

        let other = TenantContext::new("abbey");
        assert!(get_tenant_settings(&mut conn, &other).unwrap().is_none());
    }

    #[test]
    fn test_upsert_rejects_invalid_policy() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        let ctx = TenantContext::new("chapel");

        let invalid = TenantPledgeSettings { max_failures_before_pause: 0, retry_interval_hours: 24 };
        assert!(upsert_tenant_settings(&mut conn, &ctx, &invalid).is_err());
    }
}
