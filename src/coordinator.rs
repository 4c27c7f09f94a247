//! The HA coordinator: public scheduling surface and lifecycle.
//!
//! One [`HaCoordinator`] runs per management-server process. Scheduling
//! calls persist a [`WorkItem`](crate::work::WorkItem) and wake the
//! worker pool; the pool drives the recovery state machine in
//! [`crate::recovery`]. Peer lifecycle events release the leases of
//! departed peers so their in-flight items become claimable again.
//!
//! Lifecycle is `new` → [`HaCoordinator::start`] → [`HaCoordinator::stop`],
//! with `stop` idempotent.

use crate::alerts::AlertSink;
use crate::config::VigilConfig;
use crate::error::Result;
use crate::fence::FencerSet;
use crate::gate::HaGate;
use crate::inventory::Inventory;
use crate::investigate::InvestigatorSet;
use crate::orchestrator::{ResourceManager, VmLifecycle, VolumeService};
use crate::planner::{Planner, PlannerSet};
use crate::recovery::RecoveryEngine;
use crate::store::WorkStore;
use crate::types::{Host, HostId, HostStatus, HostType, PeerId, Vm, VmId, VmState};
use crate::work::{ReasonType, Step, StopKind, WorkItem, WorkType};
use crate::worker::WorkerPool;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// External collaborators the coordinator consumes.
pub struct Dependencies {
    /// The shared work queue.
    pub store: Arc<dyn WorkStore>,
    /// Management-plane inventory lookups.
    pub inventory: Arc<dyn Inventory>,
    /// The VM orchestrator.
    pub lifecycle: Arc<dyn VmLifecycle>,
    /// Volume orchestration.
    pub volumes: Arc<dyn VolumeService>,
    /// The resource manager.
    pub resources: Arc<dyn ResourceManager>,
    /// Operator alerting.
    pub alerts: Arc<dyn AlertSink>,
}

/// Receiver of management-peer lifecycle events.
#[async_trait]
pub trait PeerListener: Send + Sync {
    /// Peers joined the cluster.
    async fn on_peers_joined(&self, _peers: &[PeerId]) {}

    /// Peers left the cluster; their abandoned leases must be released.
    async fn on_peers_left(&self, peers: &[PeerId]);

    /// This peer got isolated from the cluster.
    async fn on_isolated(&self) {}
}

/// The per-process HA coordinator singleton.
pub struct HaCoordinator {
    engine: Arc<RecoveryEngine>,
    pool: WorkerPool,
    gate: Arc<HaGate>,
    stopped: AtomicBool,
}

impl HaCoordinator {
    /// Build a coordinator for this peer. Validates the configuration;
    /// no background task runs until [`HaCoordinator::start`].
    pub fn new(
        server_id: PeerId,
        config: VigilConfig,
        deps: Dependencies,
        investigators: InvestigatorSet,
        fencers: FencerSet,
        planners: PlannerSet,
    ) -> Result<Self> {
        config.validate()?;
        let gate = Arc::new(HaGate::new());
        let engine = Arc::new(RecoveryEngine {
            server_id,
            config,
            store: deps.store,
            inventory: deps.inventory,
            lifecycle: deps.lifecycle,
            volumes: deps.volumes,
            resources: deps.resources,
            alerts: deps.alerts,
            gate: gate.clone(),
            investigators,
            fencers,
            planners,
        });
        let pool = WorkerPool::new(engine.clone());
        Ok(Self {
            engine,
            pool,
            gate,
            stopped: AtomicBool::new(true),
        })
    }

    /// Per-zone feature gate, for operator toggles.
    pub fn gate(&self) -> &HaGate {
        &self.gate
    }

    /// Configured HA placement tag, if any.
    pub fn ha_tag(&self) -> Option<&str> {
        self.engine.config.ha_tag.as_deref()
    }

    /// The emergency HA planner, if one is registered.
    pub fn ha_planner(&self) -> Option<Arc<dyn Planner>> {
        self.engine.planners.ha_planner()
    }

    /// Start the coordinator: drop any leases left over from a previous
    /// run of this peer, make ownerless investigations re-eligible and
    /// spawn the worker pool.
    pub async fn start(&self) -> Result<()> {
        self.stopped.store(false, Ordering::SeqCst);
        self.engine
            .store
            .release_work_items(self.engine.server_id)
            .await?;
        self.engine.store.mark_pending_works_as_investigating().await?;
        self.pool.start().await;
        Ok(())
    }

    /// Stop the coordinator. Idempotent: waking and joining the workers
    /// happens once, and this peer's leases are released cleanly.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.stop().await;
        if let Err(error) = self
            .engine
            .store
            .mark_server_pending_works_as_investigating(self.engine.server_id)
            .await
        {
            warn!(%error, "Failed to release this peer's work items on shutdown");
        }
    }

    fn wakeup(&self) {
        self.pool.wakeup();
    }

    // ---- Investigation --------------------------------------------------

    /// Synchronously investigate a host. Returns `HostStatus::Alert`
    /// when the host is unknown or the zone gate is off, the first
    /// definitive investigator answer otherwise, and `None` when no
    /// investigator could tell.
    pub async fn investigate(&self, host_id: HostId) -> Option<HostStatus> {
        self.engine.investigate(host_id).await
    }

    // ---- Scheduling -----------------------------------------------------

    /// Schedule an HA restart for every VM on a failed routing host.
    ///
    /// Skips non-routing hosts, hypervisor families whose host stack
    /// handles HA itself, and VMs rooted on host-local storage. System
    /// VMs are scheduled before user VMs. Sends one aggregate host-down
    /// alert naming the HA-enabled VMs.
    pub async fn schedule_restart_for_vms_on_host(
        &self,
        host: &Host,
        investigate: bool,
        reason: ReasonType,
    ) {
        if host.host_type != HostType::Routing {
            return;
        }

        if self
            .engine
            .config
            .hypervisors_with_host_side_ha
            .contains(&host.hypervisor)
        {
            info!(
                host = %host,
                hypervisor = ?host.hypervisor,
                "Not restarting VMs on host, its hypervisor handles HA itself"
            );
            return;
        }

        if !self.gate.vm_ha_enabled(host.zone_id) {
            let message = format!(
                "Unable to schedule restart for VMs on host {host}, VM high availability is disabled"
            );
            debug!(message);
            self.engine
                .send_host_alert(host, message.clone(), message)
                .await;
            return;
        }

        warn!(host = %host, "Scheduling restart for VMs on host");

        let vms = self.engine.inventory.vms_on_host(host.id).await;

        // System VMs go first so the infrastructure recovers before the
        // guests that depend on it.
        let mut reordered: Vec<Vm> = Vec::with_capacity(vms.len());
        let mut ha_names = Vec::new();
        for vm in vms {
            if vm.ha_enabled {
                ha_names.push(vm.name.clone());
            }
            if vm.vm_type.is_system() {
                reordered.insert(0, vm);
            } else {
                reordered.push(vm);
            }
        }

        let host_desc = self.engine.host_description(host).await;
        let vm_list = if ha_names.is_empty() {
            String::new()
        } else {
            format!("  Starting HA on the following VMs: {}", ha_names.join(" "))
        };
        self.engine
            .send_host_alert(
                host,
                format!("Host is down, {host_desc}"),
                format!("Host [{host_desc}] is down.{vm_list}"),
            )
            .await;

        for vm in reordered {
            if self
                .engine
                .inventory
                .is_root_volume_on_local_storage(vm.id)
                .await
            {
                debug!(vm = %vm, "Skipping HA on VM, it uses local storage tied to the host");
                continue;
            }

            let live = match self.engine.inventory.vm_by_id(vm.id).await {
                Some(live) => live,
                None => continue,
            };
            if let Some(current) = live.host_id {
                if current != host.id {
                    debug!(
                        vm = %live,
                        host = %host,
                        current_host = current,
                        "VM is not on the down host, HA is done"
                    );
                    continue;
                }
            }

            debug!(vm = %live, "Notifying HA manager to restart VM");
            self.schedule_restart(&live, investigate, reason).await;
        }
    }

    /// Schedule an HA restart for one VM.
    ///
    /// When the VM needs no investigation (or has no host), its state is
    /// first normalized with a forced stop. Prior HA items within the
    /// failure window carry their attempt count forward so a flapping VM
    /// does not reset its retry budget.
    pub async fn schedule_restart(&self, vm: &Vm, investigate: bool, reason: ReasonType) {
        if !self.gate.vm_ha_enabled(vm.zone_id) {
            let message = format!(
                "Unable to schedule restart for the VM {} ({}), VM high availability is disabled",
                vm.name, vm.id
            );
            debug!(message);
            self.engine.send_vm_alert(vm, message.clone(), message).await;
            return;
        }

        if self
            .engine
            .config
            .hypervisors_with_host_side_ha
            .contains(&vm.hypervisor)
        {
            info!(
                vm = %vm,
                hypervisor = ?vm.hypervisor,
                "Skipping HA for VM, its hypervisor handles HA itself"
            );
            return;
        }

        match self
            .engine
            .store
            .has_been_scheduled(vm.id, WorkType::Ha)
            .await
        {
            Ok(true) => {
                info!(vm = %vm, "There's already HA work scheduled for the VM");
                return;
            }
            Ok(false) => {}
            Err(error) => {
                warn!(vm = %vm, %error, "Unable to check for scheduled HA work");
                return;
            }
        }

        debug!(vm = %vm, investigate, "HA schedule restart");
        let host_id = vm.host_id;
        let mut vm = vm.clone();

        if host_id.is_none() || !investigate {
            if !investigate && !(self.engine.config.force_ha || vm.ha_enabled) {
                let host_desc = format!(
                    "id: {:?}, availability zone id: {}, pod id: {:?}",
                    vm.host_id, vm.zone_id, vm.pod_id
                );
                self.engine
                    .send_vm_alert(
                        &vm,
                        format!(
                            "VM (name: {}, id: {}) stopped unexpectedly on host {host_desc}",
                            vm.name, vm.id
                        ),
                        format!(
                            "Virtual Machine {} (id: {}) running on host [{:?}] stopped unexpectedly.",
                            vm.name, vm.id, vm.host_id
                        ),
                    )
                    .await;
                debug!(vm = %vm, "VM is not HA enabled");
            }

            if host_id.is_none() {
                debug!(vm = %vm, "VM is scheduled for restart but has no host, normalizing state with a forced stop");
            } else {
                debug!(vm = %vm, "VM does not require investigation, normalizing state with a forced stop");
            }
            if let Err(error) = self.engine.lifecycle.advance_stop(&vm.uuid, true).await {
                warn!(vm = %vm, %error, "Forced stop failed while normalizing VM state");
            }
            if let Some(live) = self.engine.inventory.vm_by_id(vm.id).await {
                vm = live;
            }
        }

        let mut times_tried = 0;
        match self.engine.store.find_previous_ha(vm.id).await {
            Ok(items) => {
                let window = self.engine.config.time_between_failures.as_secs() as i64;
                for item in items {
                    if times_tried < item.times_tried && !item.can_schedule_new(window) {
                        times_tried = item.times_tried;
                        break;
                    }
                }
            }
            Err(error) => warn!(vm = %vm, %error, "Unable to look up previous HA work"),
        }

        let source_host = host_id.or(vm.last_host_id).unwrap_or(0);
        let work = WorkItem::new(
            vm.id,
            vm.vm_type,
            WorkType::Ha,
            if investigate {
                Step::Investigating
            } else {
                Step::Scheduled
            },
            source_host,
            vm.state,
            times_tried,
            vm.update_count,
            reason,
        );
        match self.engine.store.persist(work).await {
            Ok(work) => {
                info!(vm = %vm, %work, "Scheduled VM for HA restart");
                self.wakeup();
            }
            Err(error) => warn!(vm = %vm, %error, "Unable to persist HA work"),
        }
    }

    /// Schedule one of the stop flavors for a VM. Returns whether a new
    /// item was persisted.
    pub async fn schedule_stop(
        &self,
        vm: &Vm,
        host_id: HostId,
        kind: StopKind,
        reason: ReasonType,
    ) -> bool {
        let work_type = WorkType::from(kind);
        match self.engine.store.has_been_scheduled(vm.id, work_type).await {
            Ok(true) => {
                info!(vm = %vm, "There's already a job scheduled to stop the VM");
                return false;
            }
            Ok(false) => {}
            Err(error) => {
                warn!(vm = %vm, %error, "Unable to check for scheduled stop work");
                return false;
            }
        }

        if !self.gate.vm_ha_enabled(vm.zone_id) {
            let message = format!(
                "Unable to schedule stop for the VM {} ({}) on host {host_id}, VM high availability is disabled",
                vm.name, vm.id
            );
            debug!(message);
            self.engine.send_vm_alert(vm, message.clone(), message).await;
            return false;
        }

        let work = WorkItem::new(
            vm.id,
            vm.vm_type,
            work_type,
            Step::Scheduled,
            host_id,
            vm.state,
            0,
            vm.update_count,
            reason,
        );
        match self.engine.store.persist(work).await {
            Ok(work) => {
                debug!(%work, "Scheduled stop work");
                self.wakeup();
                true
            }
            Err(error) => {
                warn!(vm = %vm, %error, "Unable to persist stop work");
                false
            }
        }
    }

    /// Schedule a migration off the VM's current host. No-op for VMs
    /// without a host. Returns whether a new item was persisted.
    pub async fn schedule_migration(&self, vm: &Vm, reason: ReasonType) -> bool {
        let Some(current_host) = vm.host_id else {
            return false;
        };

        if !self.gate.vm_ha_enabled(vm.zone_id) {
            let message = format!(
                "Unable to schedule migration for the VM {} on host {current_host}, VM high availability is disabled",
                vm.name
            );
            debug!(message);
            self.engine.send_vm_alert(vm, message.clone(), message).await;
            return false;
        }

        match self
            .engine
            .store
            .has_been_scheduled(vm.id, WorkType::Migration)
            .await
        {
            Ok(true) => {
                info!(vm = %vm, "There's already a migration scheduled for the VM");
                return false;
            }
            Ok(false) => {}
            Err(error) => {
                warn!(vm = %vm, %error, "Unable to check for scheduled migration work");
                return false;
            }
        }

        // For a VM caught mid-migration the source is where it came from.
        let source_host = if vm.state == VmState::Migrating {
            vm.last_host_id.unwrap_or(current_host)
        } else {
            current_host
        };

        let work = WorkItem::new(
            vm.id,
            vm.vm_type,
            WorkType::Migration,
            Step::Scheduled,
            source_host,
            vm.state,
            0,
            vm.update_count,
            reason,
        );
        match self.engine.store.persist(work).await {
            Ok(work) => {
                info!(vm = %vm, source_host, %work, "Scheduled migration work for VM");
                self.wakeup();
                true
            }
            Err(error) => {
                warn!(vm = %vm, %error, "Unable to persist migration work");
                false
            }
        }
    }

    /// Schedule a destroy for the VM. Returns whether a new item was
    /// persisted.
    pub async fn schedule_destroy(&self, vm: &Vm, host_id: HostId, reason: ReasonType) -> bool {
        if !self.gate.vm_ha_enabled(vm.zone_id) {
            let message = format!(
                "Unable to schedule destroy for the VM {} ({}) on host {host_id}, VM high availability is disabled",
                vm.name, vm.id
            );
            debug!(message);
            self.engine.send_vm_alert(vm, message.clone(), message).await;
            return false;
        }

        match self
            .engine
            .store
            .has_been_scheduled(vm.id, WorkType::Destroy)
            .await
        {
            Ok(true) => {
                info!(vm = %vm, "There's already a destroy scheduled for the VM");
                return false;
            }
            Ok(false) => {}
            Err(error) => {
                warn!(vm = %vm, %error, "Unable to check for scheduled destroy work");
                return false;
            }
        }

        let work = WorkItem::new(
            vm.id,
            vm.vm_type,
            WorkType::Destroy,
            Step::Scheduled,
            host_id,
            vm.state,
            0,
            vm.update_count,
            reason,
        );
        match self.engine.store.persist(work).await {
            Ok(work) => {
                debug!(%work, "Scheduled destroy work");
                self.wakeup();
                true
            }
            Err(error) => {
                warn!(vm = %vm, %error, "Unable to persist destroy work");
                false
            }
        }
    }

    /// Cancel pending destroy work for the VM.
    pub async fn cancel_destroy(&self, vm_id: VmId) {
        if let Err(error) = self.engine.store.delete(vm_id, WorkType::Destroy).await {
            warn!(vm_id, %error, "Unable to cancel destroy work");
        }
    }

    /// Cancel this peer's scheduled evacuation work for a host: `Stop`
    /// items for storage hosts, `Migration` items otherwise.
    pub async fn cancel_scheduled_migrations(&self, host: &Host) {
        let work_type = if host.host_type == HostType::Storage {
            WorkType::Stop
        } else {
            WorkType::Migration
        };
        info!(host = %host, "Canceling all scheduled migrations from host");
        if let Err(error) = self
            .engine
            .store
            .delete_migration_work_items(host.id, work_type, self.engine.server_id)
            .await
        {
            warn!(host = %host, %error, "Unable to cancel scheduled migrations");
        }
    }

    /// VMs whose migration work is currently claimed somewhere in the
    /// cluster.
    pub async fn find_taken_migration_work(&self) -> Vec<Vm> {
        let works = match self
            .engine
            .store
            .find_taken_work_items(WorkType::Migration)
            .await
        {
            Ok(works) => works,
            Err(error) => {
                warn!(%error, "Unable to list taken migration work");
                return Vec::new();
            }
        };
        let mut vms = Vec::with_capacity(works.len());
        for work in works {
            if let Some(vm) = self.engine.inventory.vm_by_id(work.instance_id).await {
                vms.push(vm);
            }
        }
        vms
    }

    /// Bulk-purge work items of removed VMs. Returns how many were
    /// removed.
    pub async fn expunge_work_items_by_vm_list(
        &self,
        vm_ids: &[VmId],
        batch_size: usize,
    ) -> usize {
        match self
            .engine
            .store
            .expunge_by_vm_list(vm_ids, batch_size)
            .await
        {
            Ok(removed) => removed,
            Err(error) => {
                warn!(%error, "Unable to expunge work items");
                0
            }
        }
    }

    /// Whether any HA work is outstanding for the VM.
    pub async fn has_pending_ha_work(&self, vm_id: VmId) -> bool {
        match self.engine.store.list_pending_ha_work_for_vm(vm_id).await {
            Ok(items) => !items.is_empty(),
            Err(error) => {
                warn!(vm_id, %error, "Unable to list pending HA work");
                false
            }
        }
    }

    /// Whether any migration work is outstanding for the VM, warning
    /// about items that outlived their retry budget without turning
    /// terminal.
    pub async fn has_pending_migrations_work(&self, vm_id: VmId) -> bool {
        let items = match self
            .engine
            .store
            .list_pending_migrations_for_vm(vm_id)
            .await
        {
            Ok(items) => items,
            Err(error) => {
                warn!(vm_id, %error, "Unable to list pending migration work");
                return false;
            }
        };
        for work in items {
            if work.times_tried <= self.engine.config.max_retries {
                return true;
            }
            warn!(
                %work,
                max_retries = self.engine.config.max_retries,
                "Migration work exceeded max retries but is still not terminal"
            );
        }
        false
    }
}

#[async_trait]
impl PeerListener for HaCoordinator {
    async fn on_peers_left(&self, peers: &[PeerId]) {
        for &peer in peers {
            info!(peer, "Management peer left, releasing its work items");
            if let Err(error) = self.engine.store.release_work_items(peer).await {
                warn!(peer, %error, "Unable to release work items of departed peer");
            }
        }
    }
}
