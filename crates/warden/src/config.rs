//! Security-manager configuration.

use uuid::Uuid;

/// Static configuration of a [`crate::SecurityManager`].
#[derive(Debug, Clone)]
pub struct SecurityManagerConfig {
    /// Object path the permission-management interface lives at on peers.
    pub object_path: String,
    /// Interface name of the permission-management interface.
    pub interface: String,
    /// Validity window of certificates this manager issues.
    pub certificate_validity_days: i64,
    /// GUID of the administrative group installed during claiming. Must be
    /// stable across restarts — persist the configuration, not just the
    /// signing key.
    pub admin_group_guid: Uuid,
}

impl Default for SecurityManagerConfig {
    fn default() -> Self {
        Self {
            object_path: "/net/warden/PermissionMgmt".to_string(),
            interface: "net.warden.PermissionMgmt".to_string(),
            certificate_validity_days: 365 * 10,
            admin_group_guid: Uuid::new_v4(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SecurityManagerConfig::default();
        assert!(config.interface.starts_with("net.warden"));
        assert!(config.certificate_validity_days > 0);
    }
}
