//! Seams over the collaborators this service consumes but does not own:
//! the VM record store and the hypervisor control layer.
//!
//! Both traits are object-safe so the HTTP layer can hold them as
//! `Arc<dyn ...>` built once at startup; tests substitute in-memory fakes.

pub mod inventory;
pub mod sync;
pub mod virsh;

use async_trait::async_trait;
use vmgate_core::{GateResult, VmRecord, VmStatus};

pub use inventory::VmInventory;
pub use sync::{spawn_periodic_sync, sync_all, sync_status};
pub use virsh::VirshHypervisor;

/// Persisted VM records.
#[async_trait]
pub trait VmStore: Send + Sync {
    /// `Ok(None)` when no VM has this uuid; `Err` only for store failures.
    async fn find_by_uuid(&self, uuid: &str) -> GateResult<Option<VmRecord>>;

    async fn list(&self) -> GateResult<Vec<VmRecord>>;

    async fn update_status(&self, uuid: &str, status: VmStatus) -> GateResult<()>;
}

/// Hypervisor control, addressed by VM name.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn live_status(&self, name: &str) -> GateResult<VmStatus>;

    async fn start(&self, name: &str) -> GateResult<()>;

    /// Console (VNC) TCP port. Implementations retry internally; an error
    /// here is final for the caller.
    async fn console_port(&self, name: &str) -> GateResult<u16>;
}
