//! Reconcile persisted VM status with the hypervisor's live view.

use super::{Hypervisor, VmStore};
use crate::broadcast::StatusHub;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vmgate_core::{GateResult, VmRecord};

/// Live status queries in flight during a full sync.
const SYNC_CONCURRENCY: usize = 5;

/// Bring `vm.status` in line with the hypervisor.
///
/// Returns `Ok(true)` when the status changed. The in-memory record is always
/// corrected; persisting is best-effort and a successful correction is
/// published as `vm_update`. `Err` means the live query itself failed.
pub async fn sync_status(
    store: &dyn VmStore,
    hypervisor: &dyn Hypervisor,
    hub: &StatusHub,
    vm: &mut VmRecord,
) -> GateResult<bool> {
    let live = hypervisor.live_status(&vm.name).await?;
    if live == vm.status {
        return Ok(false);
    }

    info!(
        vm_uuid = %vm.uuid,
        vm_name = %vm.name,
        from = %vm.status,
        to = %live,
        "vm status corrected"
    );
    vm.status = live;

    match store.update_status(&vm.uuid, live).await {
        Ok(()) => {
            hub.publish_vm_update(vm);
        }
        Err(e) => warn!(vm_uuid = %vm.uuid, error = %e, "failed to persist vm status"),
    }
    Ok(true)
}

/// Sync every stored VM. Returns the number of corrected records.
pub async fn sync_all(store: &dyn VmStore, hypervisor: &dyn Hypervisor, hub: &StatusHub) -> usize {
    let vms = match store.list().await {
        Ok(vms) => vms,
        Err(e) => {
            warn!(error = %e, "status sync: failed to list vms");
            return 0;
        }
    };

    stream::iter(vms)
        .map(|mut vm| async move {
            match sync_status(store, hypervisor, hub, &mut vm).await {
                Ok(changed) => changed,
                Err(e) => {
                    debug!(vm_name = %vm.name, error = %e, "status sync: live query failed");
                    false
                }
            }
        })
        .buffer_unordered(SYNC_CONCURRENCY)
        .filter(|changed| std::future::ready(*changed))
        .count()
        .await
}

/// Run [`sync_all`] every `interval` until the task is aborted.
pub fn spawn_periodic_sync(
    store: Arc<dyn VmStore>,
    hypervisor: Arc<dyn Hypervisor>,
    hub: StatusHub,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let changed = sync_all(store.as_ref(), hypervisor.as_ref(), &hub).await;
            if changed > 0 {
                info!(changed, "status sync complete");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VmInventory;
    use crate::broadcast::{HubConfig, StatusHub};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use vmgate_core::{GateError, VmStatus};

    struct FixedHypervisor(HashMap<String, VmStatus>);

    #[async_trait]
    impl Hypervisor for FixedHypervisor {
        async fn live_status(&self, name: &str) -> GateResult<VmStatus> {
            self.0
                .get(name)
                .copied()
                .ok_or_else(|| GateError::Hypervisor("unreachable".into()))
        }
        async fn start(&self, _name: &str) -> GateResult<()> {
            Ok(())
        }
        async fn console_port(&self, _name: &str) -> GateResult<u16> {
            Err(GateError::Hypervisor("no console".into()))
        }
    }

    fn vm(id: u64, status: VmStatus) -> VmRecord {
        VmRecord {
            id,
            uuid: format!("uuid-{id}"),
            name: format!("vm-{id}"),
            cpu: 1,
            memory: 1024,
            status,
        }
    }

    #[tokio::test]
    async fn corrects_and_persists() {
        let store = VmInventory::new(vec![vm(1, VmStatus::Stopped)]);
        let hv = FixedHypervisor(HashMap::from([("vm-1".to_string(), VmStatus::Running)]));
        let (hub, _hub_loop) = StatusHub::new(HubConfig::default());

        let mut record = vm(1, VmStatus::Stopped);
        assert!(sync_status(&store, &hv, &hub, &mut record).await.unwrap());
        assert_eq!(record.status, VmStatus::Running);
        let stored = store.find_by_uuid("uuid-1").await.unwrap().unwrap();
        assert_eq!(stored.status, VmStatus::Running);

        // Second pass is a no-op.
        assert!(!sync_status(&store, &hv, &hub, &mut record).await.unwrap());
    }

    #[tokio::test]
    async fn persist_failure_still_corrects_record() {
        let store = VmInventory::new(vec![]);
        let hv = FixedHypervisor(HashMap::from([("vm-4".to_string(), VmStatus::Running)]));
        let (hub, _hub_loop) = StatusHub::new(HubConfig::default());

        let mut record = vm(4, VmStatus::Stopped);
        assert!(sync_status(&store, &hv, &hub, &mut record).await.unwrap());
        assert_eq!(record.status, VmStatus::Running);
    }

    #[tokio::test]
    async fn sync_all_counts_changes() {
        let store = VmInventory::new(vec![
            vm(1, VmStatus::Stopped),
            vm(2, VmStatus::Running),
            vm(3, VmStatus::Stopped),
        ]);
        let hv = FixedHypervisor(HashMap::from([
            ("vm-1".to_string(), VmStatus::Running),
            ("vm-2".to_string(), VmStatus::Running),
            // vm-3 query fails and is skipped
        ]));
        let (hub, _hub_loop) = StatusHub::new(HubConfig::default());

        assert_eq!(sync_all(&store, &hv, &hub).await, 1);
    }
}
