//! Tenant context for multi-tenant database operations
//!
//! Every pledge, charge and donation row carries a `tenant_id`; repository
//! functions filter on it so one community never reads another's ledger.

/// Tenant context passed to all scoped database operations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantContext {
    /// Tenant (community) identifier
    pub tenant_id: String,
}

impl TenantContext {
    /// Create a new tenant context
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }

    /// Get the tenant_id as a string reference
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TenantContext({})", self.tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_context() {
        let ctx = TenantContext::new("grace-chapel");
        assert_eq!(ctx.tenant_id(), "grace-chapel");
        assert_eq!(ctx.to_string(), "TenantContext(grace-chapel)");
    }
}
