//! Tenant catalog and device-to-tenant resolution.
//!
//! Built once from config at startup and immutable afterwards, so it is
//! shared across tasks without locking.  A missing tenant is a first-class
//! outcome, never a panic.

use crate::config::{BridgeConfig, UpstreamAuth};
use std::collections::HashMap;
use std::sync::Arc;

/// One tenant's delivery endpoint.
#[derive(Debug)]
pub struct Tenant {
    pub name: String,
    pub upstream_url: String,
    pub auth: UpstreamAuth,
    pub object_id: Option<String>,
}

/// Read-only tenant catalog with a MAC-keyed device index.
#[derive(Debug)]
pub struct TenantDirectory {
    by_name: HashMap<String, Arc<Tenant>>,
    /// Uppercased device MAC -> tenant name.
    by_mac: HashMap<String, String>,
}

impl TenantDirectory {
    pub fn from_config(cfg: &BridgeConfig) -> TenantDirectory {
        let mut by_name = HashMap::new();
        for t in &cfg.tenants {
            by_name.insert(
                t.name.clone(),
                Arc::new(Tenant {
                    name: t.name.clone(),
                    upstream_url: t.upstream_url.clone(),
                    auth: t.auth.clone(),
                    object_id: t.object_id.clone(),
                }),
            );
        }

        let mut by_mac = HashMap::new();
        for term in &cfg.terminals {
            by_mac.insert(term.mac.to_uppercase(), term.tenant.clone());
        }

        TenantDirectory { by_name, by_mac }
    }

    /// Look up a tenant by name.
    pub fn tenant(&self, name: &str) -> Option<Arc<Tenant>> {
        self.by_name.get(name).cloned()
    }

    /// Resolve a device identity (MAC expected) to its tenant.
    pub fn find_tenant(&self, device_key: &str) -> Option<Arc<Tenant>> {
        let tenant_name = self.by_mac.get(&device_key.to_uppercase())?;
        self.by_name.get(tenant_name).cloned()
    }

    pub fn tenant_count(&self) -> usize {
        self.by_name.len()
    }

    pub fn device_count(&self) -> usize {
        self.by_mac.len()
    }
}
