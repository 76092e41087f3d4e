//! JSON messages exchanged over the duplex connection.
//!
//! Two families share the `type` tag:
//!
//! - [`ControlEnvelope`]: `status` / `error` messages sent on a console
//!   connection while it is still negotiating. Once the tunnel starts, the
//!   connection carries raw binary frames only.
//! - [`BroadcastMessage`]: `vm_update` / `vm_list` messages pushed to
//!   status subscribers at any time.

use crate::error::GateResult;
use crate::model::{VmRecord, VmStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable machine-readable failure codes sent to console clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingVmUuid,
    VmNotFound,
    DbError,
    VmStartFailed,
    VmNotRunning,
    VncPortError,
    VncConnectionFailed,
    ReconnectLimitExceeded,
    SessionLimitExceeded,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingVmUuid => "MISSING_VM_UUID",
            ErrorCode::VmNotFound => "VM_NOT_FOUND",
            ErrorCode::DbError => "DB_ERROR",
            ErrorCode::VmStartFailed => "VM_START_FAILED",
            ErrorCode::VmNotRunning => "VM_NOT_RUNNING",
            ErrorCode::VncPortError => "VNC_PORT_ERROR",
            ErrorCode::VncConnectionFailed => "VNC_CONNECTION_FAILED",
            ErrorCode::ReconnectLimitExceeded => "RECONNECT_LIMIT_EXCEEDED",
            ErrorCode::SessionLimitExceeded => "SESSION_LIMIT_EXCEEDED",
        }
    }

    /// Short human text paired with the code.
    pub fn summary(&self) -> &'static str {
        match self {
            ErrorCode::MissingVmUuid => "VM UUID is required",
            ErrorCode::VmNotFound => "VM not found",
            ErrorCode::DbError => "Database error",
            ErrorCode::VmStartFailed => "Failed to start VM",
            ErrorCode::VmNotRunning => "VM is not running",
            ErrorCode::VncPortError => "Failed to get VNC port",
            ErrorCode::VncConnectionFailed => "Failed to connect to VNC server",
            ErrorCode::ReconnectLimitExceeded => "Too many reconnection attempts",
            ErrorCode::SessionLimitExceeded => "Too many concurrent console sessions",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an `error` control envelope.
///
/// Optional fields are omitted from the JSON when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VmStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorEnvelope {
    /// Build an envelope for `code` using its standard summary text.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            error: code.summary().to_string(),
            code,
            vm_uuid: None,
            address: None,
            details: None,
            status: None,
            message: None,
        }
    }

    pub fn with_vm_uuid(mut self, vm_uuid: impl Into<String>) -> Self {
        self.vm_uuid = Some(vm_uuid.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_status(mut self, status: VmStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

/// Out-of-band progress or failure message on a negotiating console connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlEnvelope {
    Status { message: String },
    Error(ErrorEnvelope),
}

impl ControlEnvelope {
    pub fn status(message: impl Into<String>) -> Self {
        ControlEnvelope::Status {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> GateResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> GateResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl From<ErrorEnvelope> for ControlEnvelope {
    fn from(e: ErrorEnvelope) -> Self {
        ControlEnvelope::Error(e)
    }
}

/// VM state change pushed to status subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    VmUpdate { vm: VmRecord },
    VmList { vms: Vec<VmRecord> },
}

impl BroadcastMessage {
    pub fn to_json(&self) -> GateResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> GateResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
