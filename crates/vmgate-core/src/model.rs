//! VM records and authenticated principals as seen by the console and
//! broadcast paths. Both are snapshots owned by external collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a virtual machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmStatus {
    Running,
    #[default]
    Stopped,
    Creating,
    Deleting,
    Error,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Running => "Running",
            VmStatus::Stopped => "Stopped",
            VmStatus::Creating => "Creating",
            VmStatus::Deleting => "Deleting",
            VmStatus::Error => "Error",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, VmStatus::Running)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a persisted VM, serialized verbatim into broadcast messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: u64,
    pub uuid: String,
    pub name: String,
    /// Number of virtual CPUs.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory: u32,
    #[serde(default)]
    pub status: VmStatus,
}

/// Role name that bypasses the approval requirement.
pub const ADMIN_ROLE: &str = "admin";

/// The authenticated user behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: u64,
    pub username: String,
    pub role: String,
    pub approved: bool,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }

    /// Approved accounts and admins may open consoles.
    pub fn may_open_console(&self) -> bool {
        self.approved || self.is_admin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_capitalized() {
        let json = serde_json::to_string(&VmStatus::Running).unwrap();
        assert_eq!(json, "\"Running\"");
        let back: VmStatus = serde_json::from_str("\"Stopped\"").unwrap();
        assert_eq!(back, VmStatus::Stopped);
    }

    #[test]
    fn record_defaults_to_stopped() {
        let vm: VmRecord = serde_json::from_str(
            r#"{"id":1,"uuid":"u-1","name":"alpha","cpu":2,"memory":2048}"#,
        )
        .unwrap();
        assert_eq!(vm.status, VmStatus::Stopped);
    }

    #[test]
    fn console_access_rules() {
        let mut p = Principal {
            user_id: 7,
            username: "kim".into(),
            role: "user".into(),
            approved: false,
        };
        assert!(!p.may_open_console());
        p.role = ADMIN_ROLE.into();
        assert!(p.may_open_console());
        p.role = "user".into();
        p.approved = true;
        assert!(p.may_open_console());
    }
}
