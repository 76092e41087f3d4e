//! vmgate-core: shared protocol library for the VM console gateway.
//!
//! Provides the JSON control envelopes and broadcast messages spoken over
//! the browser-facing WebSocket, the VM and principal model, HS256 token
//! validation, and the common error type.

pub mod envelope;
pub mod error;
pub mod model;
pub mod token;

// Re-export commonly used items at crate root.
pub use envelope::{BroadcastMessage, ControlEnvelope, ErrorCode, ErrorEnvelope};
pub use error::{GateError, GateResult};
pub use model::{Principal, VmRecord, VmStatus, ADMIN_ROLE};
pub use token::{Claims, JwtValidator};
