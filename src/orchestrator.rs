//! Consumed orchestration contracts.
//!
//! The coordinator never talks to hypervisors, storage or networks
//! directly; it drives the VM orchestrator, volume orchestration and the
//! resource manager through the traits below. Calls may fail, time out
//! or race with user actions; the recovery state machine treats their
//! errors per the propagation policy in [`crate::error`].

use crate::error::Result;
use crate::planner::Planner;
use crate::types::{HostId, Vm, VmId, Volume};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Parameters carried into an HA start attempt.
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    /// Host tag requested for HA placements.
    pub ha_tag: Option<String>,
    /// Marks the start as an HA operation for accounting downstream.
    pub ha_operation: bool,
}

/// The VM orchestrator surface the coordinator consumes.
///
/// The four `*_for_ha` starters route system and user VMs through their
/// dedicated lifecycle managers; `advance_start` is the fallback for
/// anything else. A `planner` of `None` means "use the VM's original
/// planner".
#[async_trait]
pub trait VmLifecycle: Send + Sync {
    /// Stop the VM, forcibly when `force` is set. A forced stop is
    /// expected to handle its own cleanup errors.
    async fn advance_stop(&self, uuid: &Uuid, force: bool) -> Result<()>;

    /// Start a VM that is not routed through a type-specific starter.
    async fn advance_start(
        &self,
        uuid: &Uuid,
        params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> Result<()>;

    /// Move the VM off `source_host`, letting the orchestrator pick the
    /// destination.
    async fn migrate_away(&self, uuid: &Uuid, source_host: HostId) -> Result<()>;

    /// Destroy the VM, expunging it entirely when `expunge` is set.
    async fn destroy(&self, uuid: &Uuid, expunge: bool) -> Result<()>;

    /// Destroy a console proxy through its dedicated manager.
    async fn destroy_proxy(&self, vm_id: VmId) -> Result<()>;

    /// Destroy a secondary storage VM through its dedicated manager.
    async fn destroy_sec_storage_vm(&self, vm_id: VmId) -> Result<()>;

    /// HA start entry point for virtual routers.
    async fn start_router_for_ha(
        &self,
        vm: &Vm,
        params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> Result<()>;

    /// HA start entry point for console proxies.
    async fn start_proxy_for_ha(
        &self,
        vm: &Vm,
        params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> Result<()>;

    /// HA start entry point for secondary storage VMs.
    async fn start_sec_storage_vm_for_ha(
        &self,
        vm: &Vm,
        params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> Result<()>;

    /// HA start entry point for user VMs.
    async fn start_user_vm_for_ha(
        &self,
        vm: &Vm,
        params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> Result<()>;
}

/// Volume orchestration surface.
#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Whether the VM's storage allows restarting it on another host.
    /// False for VMs rooted on storage local to the failed host.
    async fn can_vm_restart_on_another_server(&self, vm_id: VmId) -> bool;

    /// Volumes attached to the VM.
    async fn volumes_for(&self, vm_id: VmId) -> Vec<Volume>;

    /// Tear down every node's export of the volume so a lingering
    /// attachment on the dead host cannot block the new one.
    async fn detach_volume_from_all_storage_nodes(&self, volume: &Volume) -> Result<()>;
}

/// Resource manager surface.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Record that migrating the VM away from the host failed for
    /// capacity reasons, so capacity planning can react.
    async fn migrate_away_failed(&self, host_id: HostId, vm_id: VmId);
}
