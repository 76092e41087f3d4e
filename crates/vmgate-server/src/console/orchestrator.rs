//! VM Readiness Orchestrator.
//!
//! Resolves the requested VM, makes sure it is running and finds its console
//! port. Each stage announces itself with a `status` envelope before it runs;
//! a terminal failure becomes exactly one `error` envelope.

use super::StageError;
use crate::backend::{sync_status, Hypervisor, VmStore};
use crate::broadcast::StatusHub;
use crate::transport::NegotiationPhase;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vmgate_core::{ErrorCode, ErrorEnvelope, VmRecord, VmStatus};

/// Bounded poll after a start request.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    /// Give up waiting for `Running` after this long.
    pub start_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct ReadinessOrchestrator {
    store: Arc<dyn VmStore>,
    hypervisor: Arc<dyn Hypervisor>,
    hub: StatusHub,
    policy: ReadinessPolicy,
}

impl ReadinessOrchestrator {
    pub fn new(
        store: Arc<dyn VmStore>,
        hypervisor: Arc<dyn Hypervisor>,
        hub: StatusHub,
        policy: ReadinessPolicy,
    ) -> Self {
        Self {
            store,
            hypervisor,
            hub,
            policy,
        }
    }

    /// Look up the requested VM.
    pub async fn resolve(&self, vm_uuid: Option<&str>) -> Result<VmRecord, ErrorEnvelope> {
        let vm_uuid = match vm_uuid.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => return Err(ErrorEnvelope::new(ErrorCode::MissingVmUuid)),
        };

        match self.store.find_by_uuid(vm_uuid).await {
            Ok(Some(vm)) => Ok(vm),
            Ok(None) => {
                warn!(vm_uuid = %vm_uuid, "console requested for unknown vm");
                Err(ErrorEnvelope::new(ErrorCode::VmNotFound).with_vm_uuid(vm_uuid))
            }
            Err(e) => {
                error!(vm_uuid = %vm_uuid, error = %e, "vm lookup failed");
                Err(ErrorEnvelope::new(ErrorCode::DbError))
            }
        }
    }

    /// Sync status, start the VM if needed and return its console port.
    pub async fn prepare<S>(
        &self,
        conn: &mut NegotiationPhase<S>,
        vm: &mut VmRecord,
    ) -> Result<u16, StageError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = sync_status(self.store.as_ref(), self.hypervisor.as_ref(), &self.hub, vm).await {
            warn!(vm_uuid = %vm.uuid, vm_name = %vm.name, error = %e, "live status query failed, using stored status");
        }

        if !vm.status.is_running() {
            conn.send_status("Starting VM...").await?;
            self.ensure_running(vm).await?;
        }

        conn.send_status("Getting VNC port...").await?;
        match self.hypervisor.console_port(&vm.name).await {
            Ok(port) => Ok(port),
            Err(e) => {
                warn!(vm_uuid = %vm.uuid, vm_name = %vm.name, error = %e, stage = "port", "console port lookup failed");
                Err(ErrorEnvelope::new(ErrorCode::VncPortError)
                    .with_vm_uuid(vm.uuid.clone())
                    .with_details(e.to_string())
                    .with_message("VNC port not available yet. Please wait a moment and try again.")
                    .into())
            }
        }
    }

    /// Start the VM once, then poll until it reports running or the policy
    /// deadline passes.
    async fn ensure_running(&self, vm: &mut VmRecord) -> Result<(), ErrorEnvelope> {
        info!(vm_uuid = %vm.uuid, vm_name = %vm.name, "starting vm for console");
        if let Err(e) = self.hypervisor.start(&vm.name).await {
            warn!(vm_uuid = %vm.uuid, vm_name = %vm.name, error = %e, stage = "start", "vm start failed");
            return Err(ErrorEnvelope::new(ErrorCode::VmStartFailed)
                .with_vm_uuid(vm.uuid.clone())
                .with_status(vm.status)
                .with_details(e.to_string()));
        }

        let live = self.wait_until_running(&vm.name).await;
        if !live.is_running() {
            warn!(vm_uuid = %vm.uuid, vm_name = %vm.name, status = %live, stage = "start", "vm not running after start");
            return Err(ErrorEnvelope::new(ErrorCode::VmNotRunning)
                .with_vm_uuid(vm.uuid.clone())
                .with_status(live)
                .with_message("VM failed to start"));
        }

        vm.status = VmStatus::Running;
        match self.store.update_status(&vm.uuid, VmStatus::Running).await {
            Ok(()) => {
                self.hub.publish_vm_update(vm);
            }
            Err(e) => warn!(vm_uuid = %vm.uuid, error = %e, "failed to persist vm status"),
        }
        Ok(())
    }

    /// Last observed status; `Running` as soon as it is seen. Checks at
    /// least once, even with a zero deadline.
    async fn wait_until_running(&self, name: &str) -> VmStatus {
        let deadline = Instant::now() + self.policy.start_timeout;
        let mut last = VmStatus::Stopped;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.policy.poll_interval.min(remaining)).await;

            match self.hypervisor.live_status(name).await {
                Ok(status) if status.is_running() => return status,
                Ok(status) => last = status,
                Err(e) => debug!(vm_name = %name, error = %e, "status poll failed"),
            }

            if Instant::now() >= deadline {
                return last;
            }
        }
    }
}
