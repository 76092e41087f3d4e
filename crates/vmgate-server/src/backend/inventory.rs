//! In-memory VM store seeded from the `[[vm]]` config tables.

use super::VmStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use vmgate_core::{GateError, GateResult, VmRecord, VmStatus};

/// VM records keyed by uuid.
pub struct VmInventory {
    vms: RwLock<HashMap<String, VmRecord>>,
}

impl VmInventory {
    pub fn new(records: Vec<VmRecord>) -> Self {
        let vms = records.into_iter().map(|vm| (vm.uuid.clone(), vm)).collect();
        Self {
            vms: RwLock::new(vms),
        }
    }

    pub async fn len(&self) -> usize {
        self.vms.read().await.len()
    }
}

#[async_trait]
impl VmStore for VmInventory {
    async fn find_by_uuid(&self, uuid: &str) -> GateResult<Option<VmRecord>> {
        Ok(self.vms.read().await.get(uuid).cloned())
    }

    async fn list(&self) -> GateResult<Vec<VmRecord>> {
        let mut vms: Vec<VmRecord> = self.vms.read().await.values().cloned().collect();
        vms.sort_by_key(|vm| vm.id);
        Ok(vms)
    }

    async fn update_status(&self, uuid: &str, status: VmStatus) -> GateResult<()> {
        let mut vms = self.vms.write().await;
        let vm = vms
            .get_mut(uuid)
            .ok_or_else(|| GateError::NotFound(format!("vm {uuid}")))?;
        debug!(vm_uuid = %uuid, from = %vm.status, to = %status, "vm status updated");
        vm.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: u64, uuid: &str) -> VmRecord {
        VmRecord {
            id,
            uuid: uuid.into(),
            name: format!("vm-{id}"),
            cpu: 1,
            memory: 512,
            status: VmStatus::Stopped,
        }
    }

    #[tokio::test]
    async fn lookup_and_update() {
        let inv = VmInventory::new(vec![vm(2, "b"), vm(1, "a")]);
        assert!(inv.find_by_uuid("zzz").await.unwrap().is_none());

        inv.update_status("a", VmStatus::Running).await.unwrap();
        let a = inv.find_by_uuid("a").await.unwrap().unwrap();
        assert_eq!(a.status, VmStatus::Running);

        let ids: Vec<u64> = inv.list().await.unwrap().iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn update_unknown_vm() {
        let inv = VmInventory::new(vec![]);
        assert!(matches!(
            inv.update_status("nope", VmStatus::Running).await,
            Err(GateError::NotFound(_))
        ));
        assert_eq!(inv.len().await, 0);
    }
}
