//! Management-plane inventory lookups.
//!
//! Read-only views over the VM and host records the management database
//! keeps. The recovery state machine reloads records through this trait
//! at every decision point; the staleness barriers in
//! [`crate::recovery`] depend on these reads being current.

use crate::types::{Host, HostId, PodId, Vm, VmId, ZoneId};
use async_trait::async_trait;
use uuid::Uuid;

/// Inventory access consumed by the coordinator.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Look a VM up by internal id.
    async fn vm_by_id(&self, id: VmId) -> Option<Vm>;

    /// Look a VM up by external identity.
    async fn vm_by_uuid(&self, uuid: &Uuid) -> Option<Vm>;

    /// All VMs currently recorded on the host.
    async fn vms_on_host(&self, host_id: HostId) -> Vec<Vm>;

    /// Look a host up by id; `None` when unknown or removed.
    async fn host_by_id(&self, id: HostId) -> Option<Host>;

    /// Look a host up by id, returning removed hosts as well.
    async fn host_by_id_including_removed(&self, id: HostId) -> Option<Host>;

    /// Zone display name for alert texts.
    async fn zone_name(&self, zone_id: ZoneId) -> String;

    /// Pod display name for alert texts.
    async fn pod_name(&self, pod_id: PodId) -> String;

    /// Whether the VM's root volume sits on host-local storage, tying
    /// its fate to the host.
    async fn is_root_volume_on_local_storage(&self, vm_id: VmId) -> bool;
}
