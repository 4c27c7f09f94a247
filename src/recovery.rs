//! The recovery state machine.
//!
//! [`RecoveryEngine`] owns every collaborator the coordinator consults
//! and drives one claimed [`WorkItem`] at a time through its flow:
//!
//! - **HA restart**: investigate the lost VM, fence it when liveness is
//!   unknowable, force-stop, then restart on surviving capacity with a
//!   planner fallback.
//! - **Migration**: move the VM off its source host, retrying on
//!   capacity exhaustion.
//! - **Stop / CheckStop / ForceStop**: stop the VM, guarded against
//!   concurrent changes for the checked flavors.
//! - **Destroy**: stop if needed, then destroy, expunging system VMs
//!   through their dedicated managers.
//!
//! A step function returns `Ok(None)` when the item is finished,
//! `Ok(Some(at))` to reschedule at epoch-second `at`, or an error to
//! take the generic reschedule path. Terminal steps a flow sets itself
//! (for example `Cancelled`) are preserved.

use crate::alerts::{Alert, AlertSink, AlertType};
use crate::config::VigilConfig;
use crate::error::{Result, VigilError};
use crate::fence::FencerSet;
use crate::gate::HaGate;
use crate::inventory::Inventory;
use crate::investigate::InvestigatorSet;
use crate::orchestrator::{ResourceManager, StartParams, VmLifecycle, VolumeService};
use crate::planner::PlannerSet;
use crate::store::WorkStore;
use crate::types::{now_secs, Host, HostId, HostStatus, HypervisorFamily, PeerId, Vm, VmState, VmType};
use crate::work::{Step, WorkItem, WorkType};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The bundle of collaborators and policy the state machine runs with.
pub(crate) struct RecoveryEngine {
    pub(crate) server_id: PeerId,
    pub(crate) config: VigilConfig,
    pub(crate) store: Arc<dyn WorkStore>,
    pub(crate) inventory: Arc<dyn Inventory>,
    pub(crate) lifecycle: Arc<dyn VmLifecycle>,
    pub(crate) volumes: Arc<dyn VolumeService>,
    pub(crate) resources: Arc<dyn ResourceManager>,
    pub(crate) alerts: Arc<dyn AlertSink>,
    pub(crate) gate: Arc<HaGate>,
    pub(crate) investigators: InvestigatorSet,
    pub(crate) fencers: FencerSet,
    pub(crate) planners: PlannerSet,
}

impl RecoveryEngine {
    /// Claim the next eligible item for this peer.
    pub(crate) async fn take_work(&self) -> Result<Option<WorkItem>> {
        self.store.take(self.server_id).await
    }

    /// Synchronous host investigation: `Alert` for unknown hosts or a
    /// gated zone, the first definitive investigator answer otherwise,
    /// `None` when every investigator is exhausted.
    pub(crate) async fn investigate(&self, host_id: HostId) -> Option<HostStatus> {
        let host = match self.inventory.host_by_id(host_id).await {
            Some(host) => host,
            None => return Some(HostStatus::Alert),
        };

        if !self.gate.vm_ha_enabled(host.zone_id) {
            debug!(
                host = %host,
                "Unable to investigate the host, VM high availability is disabled in its zone"
            );
            return Some(HostStatus::Alert);
        }

        self.investigators.host_status(&host).await
    }

    /// Execute one claimed item and write the outcome back to the store.
    pub(crate) async fn process_work(&self, work: &mut WorkItem) {
        let work_type = work.work_type;
        let vm = self.inventory.vm_by_id(work.instance_id).await;

        if let Some(ref vm) = vm {
            if !self.gate.vm_ha_enabled(vm.zone_id) {
                debug!(
                    %work,
                    vm = %vm,
                    "VM high availability is disabled in the zone, rescheduling to retry later"
                );
                self.reschedule(work, self.reschedule_time(work_type));
                self.finish(work).await;
                return;
            }
        }

        let outcome = match work_type {
            WorkType::Migration => self.migrate(work).await,
            WorkType::Ha => self.restart(work).await,
            WorkType::Stop | WorkType::CheckStop | WorkType::ForceStop => self.stop_vm(work).await,
            WorkType::Destroy => self.destroy_vm(work).await,
        };

        match outcome {
            Ok(None) => {
                if !work.step.is_terminal() {
                    info!(
                        %work,
                        attempts = work.times_tried + 1,
                        max_retries = self.config.max_retries,
                        "Completed work"
                    );
                    work.step = Step::Done;
                }
            }
            Ok(Some(next_time)) => {
                self.reschedule(work, next_time);
            }
            Err(error) => {
                warn!(%work, %error, "Unhandled error during HA processing, rescheduling");
                self.reschedule(work, self.reschedule_time(work_type));
                // The failed attempt may have moved the VM; recapture the
                // staleness barrier so the next attempt can proceed.
                if let Some(live) = self.inventory.vm_by_id(work.instance_id).await {
                    work.update_time = live.update_count;
                    work.previous_state = live.state;
                }
            }
        }

        self.finish(work).await;
    }

    /// Shared post-execution bookkeeping: enforce the retry budget and
    /// persist the item.
    async fn finish(&self, work: &mut WorkItem) {
        if !work.step.is_terminal() {
            if work.times_tried >= self.config.max_retries {
                warn!(
                    %work,
                    attempts = work.times_tried,
                    max_retries = self.config.max_retries,
                    "Giving up on work after max retries"
                );
                work.step = Step::Done;
            } else {
                warn!(
                    %work,
                    time_to_try = work.time_to_try,
                    attempts = work.times_tried,
                    max_retries = self.config.max_retries,
                    "Rescheduling work to try again"
                );
            }
        }
        if let Err(error) = self.store.update(work).await {
            warn!(%work, %error, "Failed to persist work outcome");
        }
    }

    fn reschedule(&self, work: &mut WorkItem, next_time: i64) {
        work.time_to_try = next_time;
        work.times_tried += 1;
        work.server_id = None;
        work.date_taken = None;
    }

    /// Standard reschedule time for a work type.
    pub(crate) fn reschedule_time(&self, work_type: WorkType) -> i64 {
        let interval = match work_type {
            WorkType::Migration => self.config.migrate_retry_interval,
            WorkType::Ha => self.config.restart_retry_interval,
            WorkType::Stop | WorkType::CheckStop | WorkType::ForceStop | WorkType::Destroy => {
                self.config.stop_retry_interval
            }
        };
        now_secs() + interval.as_secs() as i64
    }

    /// Cancel in-flight work whose trigger has evaporated: the item is
    /// still investigating, was scheduled for a host-level reason, and
    /// the host is back `Up`.
    async fn check_and_cancel_if_needed(&self, work: &mut WorkItem) -> bool {
        if work.step != Step::Investigating {
            return false;
        }
        if !work.reason.is_cancellable() {
            return false;
        }
        if self.investigate(work.host_id).await != Some(HostStatus::Up) {
            return false;
        }
        debug!(%work, "Cancelling work as it is not needed anymore");
        work.step = Step::Cancelled;
        true
    }

    // ---- HA restart -----------------------------------------------------

    async fn restart(&self, work: &mut WorkItem) -> Result<Option<i64>> {
        let vm_id = work.instance_id;

        let future = self.store.list_future_ha_work_for_vm(vm_id, work.id).await?;
        if !future.is_empty() {
            let ids: Vec<_> = future.iter().map(|w| w.id).collect();
            info!(
                %work,
                superseded_by = ?ids,
                "Cancelling work item because newer ones have been scheduled"
            );
            work.step = Step::Cancelled;
            return Ok(None);
        }

        let running = self.store.list_running_ha_work_for_vm(vm_id, work.id).await?;
        if !running.is_empty() {
            let ids: Vec<_> = running.iter().map(|w| w.id).collect();
            info!(%work, running = ?ids, "Waiting, other HA work is being executed for the VM");
            return Ok(Some(
                now_secs() + self.config.investigate_retry_interval.as_secs() as i64,
            ));
        }

        let vm = match self.inventory.vm_by_id(vm_id).await {
            Some(vm) => vm,
            None => {
                info!(vm_id, "Unable to find VM, nothing to restart");
                return Ok(None);
            }
        };

        if self.check_and_cancel_if_needed(work).await {
            return Ok(None);
        }

        info!(vm = %vm, "HA on VM");
        if vm.state != work.previous_state || vm.update_count != work.update_time {
            info!(
                vm = %vm,
                current_state = ?vm.state,
                previous_state = ?work.previous_state,
                updated = vm.update_count,
                previously_updated = work.update_time,
                "VM has been changed by someone else, nothing to do"
            );
            return Ok(None);
        }

        let (host, host_removed) = match self.inventory.host_by_id(work.host_id).await {
            Some(host) => (host, false),
            None => match self.inventory.host_by_id_including_removed(work.host_id).await {
                Some(host) => {
                    debug!(vm = %vm, host = %host, "VM is no longer on the host as it is removed");
                    (host, true)
                }
                None => return Err(VigilError::HostNotFound(work.host_id)),
            },
        };

        let host_desc = self.host_description(&host).await;

        if work.step == Step::Investigating {
            if !host_removed {
                if vm.host_id != Some(work.host_id) {
                    info!(vm = %vm, host = %host, "VM is no longer on the host");
                    return Ok(None);
                }

                let alive = self.investigators.vm_alive(&vm, &host).await?;
                let fenced = match alive {
                    Some(true) => {
                        if host.status == HostStatus::Up {
                            info!(vm = %vm, "VM is alive and the host is up, no need to restart");
                            return Ok(None);
                        }
                        debug!(vm = %vm, "Rescheduling, the host is not up but the VM is alive");
                        return Ok(Some(
                            now_secs() + self.config.investigate_retry_interval.as_secs() as i64,
                        ));
                    }
                    Some(false) => true,
                    None => {
                        debug!(vm = %vm, "Fencing off VM whose state we cannot determine");
                        self.fencers.fence(&vm, &host).await
                    }
                };

                if !fenced {
                    debug!(vm = %vm, "Unable to fence off the VM");
                    self.send_vm_alert(
                        &vm,
                        format!("Unable to restart {} which was running on host {host_desc}", vm.name),
                        format!(
                            "Unable to fence off VM, name: {}, id: {} which was running on host {host_desc}",
                            vm.name, vm.id
                        ),
                    )
                    .await;
                    return Ok(Some(
                        now_secs() + self.config.restart_retry_interval.as_secs() as i64,
                    ));
                }

                self.force_stop(&vm).await?;
                work.step = Step::Scheduled;
                self.store.update(work).await?;
            } else {
                debug!(
                    vm = %vm,
                    "HA step is Investigating but the host is removed, calling forced stop anyway"
                );
                self.force_stop(&vm).await?;
                work.step = Step::Scheduled;
                self.store.update(work).await?;
            }
        }

        let vm = match self.inventory.vm_by_id(vm_id).await {
            Some(vm) => vm,
            None => {
                info!(vm_id, "VM disappeared after stop, nothing to restart");
                return Ok(None);
            }
        };

        if !self.config.force_ha && !vm.ha_enabled {
            debug!(vm = %vm, "VM is not HA enabled so we're done");
            return Ok(None);
        }

        let host_gone = host_removed || host.removed || host.status != HostStatus::Up;
        if host_gone && !self.volumes.can_vm_restart_on_another_server(vm.id).await {
            debug!(vm = %vm, "VM cannot restart on another server");
            return Ok(None);
        }

        let params = StartParams {
            ha_tag: self.config.ha_tag.clone(),
            ha_operation: work.work_type == WorkType::Ha,
        };

        let start_outcome = self.start_with_fallback(&vm, &host, &params).await;
        match start_outcome {
            Ok(()) => {
                if let Some(started) = self.inventory.vm_by_id(vm.id).await {
                    if started.state == VmState::Running {
                        let message = format!("HA starting VM: {} ({})", started.name, started.id);
                        info!(vm = %started, host = ?started.host_id, "HA is now restarting the VM");
                        self.send_vm_alert(&started, message.clone(), message).await;
                        return Ok(None);
                    }
                }
                debug!(vm = %vm, "Start did not leave the VM running, rescheduling");
            }
            Err(error) if error.is_retryable() => {
                warn!(vm = %vm, %error, "Unable to restart VM");
                self.send_vm_alert(
                    &vm,
                    format!("Unable to restart {} which was running on host {host_desc}", vm.name),
                    format!(
                        "Unable to restart VM, name: {}, id: {} uuid: {} which was running on host {host_desc}: {error}",
                        vm.name, vm.id, vm.uuid
                    ),
                )
                .await;
            }
            Err(error) => return Err(error),
        }

        if let Some(live) = self.inventory.vm_by_id(vm.id).await {
            work.update_time = live.update_count;
            work.previous_state = live.state;
        }
        Ok(Some(
            now_secs() + self.config.restart_retry_interval.as_secs() as i64,
        ))
    }

    /// Forced stop used inside the restart flow. A forced stop is meant
    /// to handle its own errors; if one surfaces anyway it is logged and
    /// takes the generic reschedule path.
    async fn force_stop(&self, vm: &Vm) -> Result<()> {
        if let Err(error) = self.lifecycle.advance_stop(&vm.uuid, true).await {
            warn!(vm = %vm, %error, "Forced stop failed even though force was set");
            return Err(error);
        }
        Ok(())
    }

    /// One start attempt with the original planner, retried once with
    /// the emergency HA planner on capacity exhaustion.
    async fn start_with_fallback(
        &self,
        vm: &Vm,
        host: &Host,
        params: &StartParams,
    ) -> Result<()> {
        if host.hypervisor == HypervisorFamily::Kvm {
            for volume in self.volumes.volumes_for(vm.id).await {
                if volume.pool_type.requires_full_detach() {
                    self.volumes
                        .detach_volume_from_all_storage_nodes(&volume)
                        .await?;
                }
            }
        }

        match self.start_vm(vm, params, false).await {
            Err(error) if error.is_capacity() => {
                warn!(vm = %vm, %error, "Failed to deploy VM with original planner, sending HA planner");
                self.start_vm(vm, params, true).await
            }
            other => other,
        }
    }

    async fn start_vm(&self, vm: &Vm, params: &StartParams, emergency: bool) -> Result<()> {
        let planner = if emergency {
            self.planners.ha_planner()
        } else {
            None
        };
        match vm.vm_type {
            VmType::DomainRouter => {
                self.lifecycle.start_router_for_ha(vm, params, planner).await
            }
            VmType::ConsoleProxy => self.lifecycle.start_proxy_for_ha(vm, params, planner).await,
            VmType::SecondaryStorageVm => {
                self.lifecycle
                    .start_sec_storage_vm_for_ha(vm, params, planner)
                    .await
            }
            VmType::User => self.lifecycle.start_user_vm_for_ha(vm, params, planner).await,
            VmType::Other => self.lifecycle.advance_start(&vm.uuid, params, planner).await,
        }
    }

    // ---- Migration ------------------------------------------------------

    async fn migrate(&self, work: &mut WorkItem) -> Result<Option<i64>> {
        let vm = match self.inventory.vm_by_id(work.instance_id).await {
            Some(vm) => vm,
            None => {
                info!(vm_id = work.instance_id, "Unable to find VM, skipping migrate");
                return Ok(None);
            }
        };

        if self.check_and_cancel_if_needed(work).await {
            return Ok(None);
        }

        info!(
            vm = %vm,
            source_host = work.host_id,
            attempt = work.times_tried + 1,
            max_retries = self.config.max_retries,
            "Migration attempt for VM"
        );

        if vm.state == VmState::Stopped {
            info!(vm = %vm, "VM is stopped, skipping migrate");
            return Ok(None);
        }
        if vm.state == VmState::Running && vm.host_id != Some(work.host_id) {
            info!(vm = %vm, host = ?vm.host_id, "VM is running on a different host, skipping migration");
            return Ok(None);
        }

        work.step = Step::Migrating;
        self.store.update(work).await?;

        match self.lifecycle.migrate_away(&vm.uuid, work.host_id).await {
            Ok(()) => Ok(None),
            Err(VigilError::InsufficientServerCapacity(reason)) => {
                warn!(
                    vm = %vm,
                    source_host = work.host_id,
                    reason,
                    "Insufficient capacity for migrating VM away from source host"
                );
                self.resources
                    .migrate_away_failed(work.host_id, vm.id)
                    .await;
                Ok(Some(
                    now_secs() + self.config.migrate_retry_interval.as_secs() as i64,
                ))
            }
            Err(error) => {
                warn!(vm = %vm, %error, "Unexpected error while attempting migration");
                Err(error)
            }
        }
    }

    // ---- Stop flavors ---------------------------------------------------

    async fn stop_vm(&self, work: &mut WorkItem) -> Result<Option<i64>> {
        let vm = match self.inventory.vm_by_id(work.instance_id).await {
            Some(vm) => vm,
            None => {
                info!(vm_id = work.instance_id, %work, "No longer can find VM, throwing away work");
                return Ok(None);
            }
        };

        if self.check_and_cancel_if_needed(work).await {
            return Ok(None);
        }

        info!(vm = %vm, "Stopping VM");
        let result = match work.work_type {
            WorkType::Stop => self.lifecycle.advance_stop(&vm.uuid, false).await,
            WorkType::CheckStop | WorkType::ForceStop => {
                if vm.state != work.previous_state
                    || vm.update_count != work.update_time
                    || vm.host_id != Some(work.host_id)
                {
                    info!(
                        vm = %vm,
                        scheduled_host = work.host_id,
                        current_host = ?vm.host_id,
                        state = ?vm.state,
                        "VM is different now, not stopping"
                    );
                    return Ok(None);
                }
                let force = work.work_type == WorkType::ForceStop;
                self.lifecycle.advance_stop(&vm.uuid, force).await
            }
            _ => {
                return Err(VigilError::Internal(format!(
                    "stop flow invoked for {:?}",
                    work.work_type
                )))
            }
        };

        match result {
            Ok(()) => {
                info!(vm = %vm, "Stop was successful");
                Ok(None)
            }
            Err(error) if error.is_retryable() => {
                debug!(vm = %vm, %error, "Stop failed, will retry");
                Ok(Some(
                    now_secs() + self.config.stop_retry_interval.as_secs() as i64,
                ))
            }
            Err(error) => Err(error),
        }
    }

    // ---- Destroy --------------------------------------------------------

    async fn destroy_vm(&self, work: &mut WorkItem) -> Result<Option<i64>> {
        let vm = match self.inventory.vm_by_id(work.instance_id).await {
            Some(vm) => vm,
            None => {
                info!(vm_id = work.instance_id, %work, "No longer can find VM, throwing away work");
                return Ok(None);
            }
        };

        if self.check_and_cancel_if_needed(work).await {
            return Ok(None);
        }

        let expunge = matches!(
            vm.vm_type,
            VmType::ConsoleProxy | VmType::SecondaryStorageVm
        );
        if !expunge && work.previous_state == VmState::Destroyed {
            info!(vm = %vm, %work, "VM already destroyed, throwing away work");
            return Ok(None);
        }

        let result: Result<Option<i64>> = async {
            if work.previous_state == VmState::Running {
                self.lifecycle.advance_stop(&vm.uuid, true).await?;
            }
            if work.previous_state != VmState::Expunging {
                info!(vm = %vm, expunge, "Destroying VM");
                match vm.vm_type {
                    VmType::ConsoleProxy => self.lifecycle.destroy_proxy(vm.id).await?,
                    VmType::SecondaryStorageVm => {
                        self.lifecycle.destroy_sec_storage_vm(vm.id).await?
                    }
                    _ => self.lifecycle.destroy(&vm.uuid, expunge).await?,
                }
                Ok(None)
            } else {
                info!(vm = %vm, state = ?vm.state, "VM still expunging, retrying later");
                Ok(Some(
                    now_secs() + self.config.stop_retry_interval.as_secs() as i64,
                ))
            }
        }
        .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(error) if error.is_retryable() => {
                debug!(vm = %vm, %error, "Destroy failed, will retry");
                Ok(Some(
                    now_secs() + self.config.stop_retry_interval.as_secs() as i64,
                ))
            }
            Err(error) => Err(error),
        }
    }

    // ---- Alerts ---------------------------------------------------------

    /// Human-readable host description for alert texts.
    pub(crate) async fn host_description(&self, host: &Host) -> String {
        let zone = self.inventory.zone_name(host.zone_id).await;
        let pod = self.inventory.pod_name(host.pod_id).await;
        format!(
            "name: {} (id: {}), availability zone: {zone}, pod: {pod}",
            host.name, host.id
        )
    }

    /// VM-scoped alert, honoring the per-zone alerts gate.
    pub(crate) async fn send_vm_alert(&self, vm: &Vm, subject: String, body: String) {
        if !self.gate.alerts_enabled(vm.zone_id) {
            return;
        }
        self.alerts
            .send_alert(Alert {
                alert_type: AlertType::from(vm.vm_type),
                zone_id: vm.zone_id,
                pod_id: vm.pod_id,
                subject,
                body,
            })
            .await;
    }

    /// Host-scoped alert, honoring the per-zone alerts gate.
    pub(crate) async fn send_host_alert(&self, host: &Host, subject: String, body: String) {
        if !self.gate.alerts_enabled(host.zone_id) {
            return;
        }
        self.alerts
            .send_alert(Alert {
                alert_type: AlertType::Host,
                zone_id: host.zone_id,
                pod_id: Some(host.pod_id),
                subject,
                body,
            })
            .await;
    }
}
