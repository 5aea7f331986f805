//! Tenant pledge policy and its TTL cache
//!
//! Tenants store their settings as loosely typed JSON. [`TenantPledgeSettings::from_json`]
//! validates that payload once; everything downstream works with the typed struct.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::models::TenantSettingsRow;
use crate::db::{tenant_settings, PledgeDb, TenantContext};
use crate::error::{BillingError, Result};

pub const DEFAULT_MAX_FAILURES_BEFORE_PAUSE: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL_HOURS: u32 = 24;

const MAX_RETRY_INTERVAL_HOURS: u32 = 24 * 365;

/// Per-tenant failure and retry policy, read-only to the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantPledgeSettings {
    /// Consecutive failures after which a pledge is paused (status FAILED)
    pub max_failures_before_pause: u32,
    /// Cooldown before the retry sweep re-attempts a failed pledge
    pub retry_interval_hours: u32,
}

impl Default for TenantPledgeSettings {
    fn default() -> Self {
        Self {
            max_failures_before_pause: DEFAULT_MAX_FAILURES_BEFORE_PAUSE,
            retry_interval_hours: DEFAULT_RETRY_INTERVAL_HOURS,
        }
    }
}

/// Shape of the pledge section of a tenant settings document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPledgeSettings {
    #[serde(default, alias = "max_failures_before_pause")]
    max_failures_before_pause: Option<u32>,
    #[serde(default, alias = "retry_interval_hours")]
    retry_interval_hours: Option<u32>,
}

impl TenantPledgeSettings {
    /// Validate a tenant settings JSON payload
    ///
    /// Accepts the keys at the top level or under a `pledges` object. Missing
    /// keys take the defaults, unknown keys are ignored, wrong types and
    /// out-of-range values are rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let section = match value.get("pledges") {
            Some(nested) => nested,
            None => value,
        };

        if !section.is_object() {
            return Err(BillingError::Config(format!(
                "Tenant pledge settings must be a JSON object, got {}",
                section
            )));
        }

        let raw: RawPledgeSettings = serde_json::from_value(section.clone())
            .map_err(|e| BillingError::Config(format!("Invalid tenant pledge settings: {}", e)))?;

        let defaults = Self::default();
        let settings = Self {
            max_failures_before_pause: raw
                .max_failures_before_pause
                .unwrap_or(defaults.max_failures_before_pause),
            retry_interval_hours: raw
                .retry_interval_hours
                .unwrap_or(defaults.retry_interval_hours),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_failures_before_pause == 0 {
            return Err(BillingError::Config(
                "maxFailuresBeforePause must be at least 1".into(),
            ));
        }
        if self.max_failures_before_pause > i32::MAX as u32 {
            return Err(BillingError::Config(format!(
                "maxFailuresBeforePause too large: {}",
                self.max_failures_before_pause
            )));
        }
        if self.retry_interval_hours == 0 || self.retry_interval_hours > MAX_RETRY_INTERVAL_HOURS {
            return Err(BillingError::Config(format!(
                "retryIntervalHours must be between 1 and {}, got {}",
                MAX_RETRY_INTERVAL_HOURS, self.retry_interval_hours
            )));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.retry_interval_hours))
    }
}

impl TryFrom<TenantSettingsRow> for TenantPledgeSettings {
    type Error = BillingError;

    fn try_from(row: TenantSettingsRow) -> Result<Self> {
        let settings = Self {
            max_failures_before_pause: u32::try_from(row.max_failures_before_pause).map_err(|_| {
                BillingError::InvalidData(format!(
                    "Tenant {} has negative max_failures_before_pause",
                    row.tenant_id
                ))
            })?,
            retry_interval_hours: u32::try_from(row.retry_interval_hours).map_err(|_| {
                BillingError::InvalidData(format!(
                    "Tenant {} has negative retry_interval_hours",
                    row.tenant_id
                ))
            })?,
        };
        settings
            .validate()
            .map_err(|e| BillingError::InvalidData(format!("Tenant {}: {}", row.tenant_id, e)))?;
        Ok(settings)
    }
}

// ============================================================================
// Settings Cache
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct CachedSettings {
    settings: TenantPledgeSettings,
    fetched_at: Instant,
}

/// TTL cache of tenant policies, constructed once per process
///
/// Tenants without a stored policy resolve to `defaults`, and that
/// resolution is cached too.
pub struct SettingsCache {
    entries: DashMap<String, CachedSettings>,
    ttl: Duration,
    defaults: TenantPledgeSettings,
}

impl SettingsCache {
    pub fn new(ttl: Duration, defaults: TenantPledgeSettings) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            defaults,
        }
    }

    /// Resolve a tenant's policy, reading the database on a miss or expiry
    pub fn get(&self, db: &PledgeDb, ctx: &TenantContext) -> Result<TenantPledgeSettings> {
        if let Some(entry) = self.entries.get(ctx.tenant_id()) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.settings);
            }
        }

        let settings = db
            .with_conn(|conn| tenant_settings::get_tenant_settings(conn, ctx))?
            .unwrap_or(self.defaults);

        debug!(tenant_id = %ctx.tenant_id, ?settings, "Loaded tenant pledge settings");
        self.entries.insert(
            ctx.tenant_id.clone(),
            CachedSettings {
                settings,
                fetched_at: Instant::now(),
            },
        );
        Ok(settings)
    }

    /// Drop a tenant's cached policy after it changes
    pub fn invalidate(&self, tenant_id: &str) {
        self.entries.remove(tenant_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_defaults_and_nesting() {
        let empty = TenantPledgeSettings::from_json(&json!({})).unwrap();
        assert_eq!(empty, TenantPledgeSettings::default());

        let nested = TenantPledgeSettings::from_json(&json!({
            "theme": "dark",
            "pledges": { "maxFailuresBeforePause": 5 }
        }))
        .unwrap();
        assert_eq!(nested.max_failures_before_pause, 5);
        assert_eq!(nested.retry_interval_hours, 24);

        let snake = TenantPledgeSettings::from_json(&json!({ "retry_interval_hours": 12 })).unwrap();
        assert_eq!(snake.retry_interval_hours, 12);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(TenantPledgeSettings::from_json(&json!({ "maxFailuresBeforePause": 0 })).is_err());
        assert!(TenantPledgeSettings::from_json(&json!({ "maxFailuresBeforePause": "3" })).is_err());
        assert!(TenantPledgeSettings::from_json(&json!({ "retryIntervalHours": -1 })).is_err());
        assert!(TenantPledgeSettings::from_json(&json!({ "pledges": [1, 2] })).is_err());
        assert!(TenantPledgeSettings::from_json(&json!("strict")).is_err());
    }

    #[test]
    fn test_cache_serves_until_invalidated() {
        let db = PledgeDb::open_in_memory().unwrap();
        let cache = SettingsCache::new(Duration::from_secs(300), TenantPledgeSettings::default());
        let ctx = TenantContext::new("chapel");

        assert_eq!(cache.get(&db, &ctx).unwrap(), TenantPledgeSettings::default());
        assert_eq!(cache.len(), 1);

        let strict = TenantPledgeSettings { max_failures_before_pause: 1, retry_interval_hours: 2 };
        db.with_conn(|conn| tenant_settings::upsert_tenant_settings(conn, &ctx, &strict))
            .unwrap();

        // Still cached
        assert_eq!(cache.get(&db, &ctx).unwrap(), TenantPledgeSettings::default());

        cache.invalidate("chapel");
        assert_eq!(cache.get(&db, &ctx).unwrap(), strict);
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let db = PledgeDb::open_in_memory().unwrap();
        let cache = SettingsCache::new(Duration::ZERO, TenantPledgeSettings::default());
        let ctx = TenantContext::new("chapel");

        cache.get(&db, &ctx).unwrap();
        let strict = TenantPledgeSettings { max_failures_before_pause: 2, retry_interval_hours: 2 };
        db.with_conn(|conn| tenant_settings::upsert_tenant_settings(conn, &ctx, &strict))
            .unwrap();
        assert_eq!(cache.get(&db, &ctx).unwrap(), strict);
    }
}
