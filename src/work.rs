//! The persisted work item model.
//!
//! A [`WorkItem`] is the only durable entity of the coordinator: one row
//! per outstanding recovery action, shared by every management-server
//! peer through the work store. Workers claim items by stamping a lease
//! (`server_id` + `date_taken`) and either drive them to a terminal
//! [`Step`] or push them back with a future `time_to_try`.

use crate::types::{now_secs, HostId, PeerId, VmId, VmState, VmType, WorkId};
use serde::{Deserialize, Serialize};

/// Kind of recovery work scheduled for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    /// Investigate, fence and restart a VM whose host was lost.
    Ha,
    /// Move the VM off its current host.
    Migration,
    /// Plain stop.
    Stop,
    /// Stop only if the VM is still exactly where it was scheduled.
    CheckStop,
    /// Forced stop with the same guard as [`WorkType::CheckStop`].
    ForceStop,
    /// Stop if needed, then destroy.
    Destroy,
}

/// Stop flavors accepted by the stop scheduling API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    /// Unconditional stop.
    Stop,
    /// Guarded stop.
    CheckStop,
    /// Guarded forced stop.
    ForceStop,
}

impl From<StopKind> for WorkType {
    fn from(kind: StopKind) -> Self {
        match kind {
            StopKind::Stop => WorkType::Stop,
            StopKind::CheckStop => WorkType::CheckStop,
            StopKind::ForceStop => WorkType::ForceStop,
        }
    }
}

/// Progress of a work item through the recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Waiting for a worker.
    Scheduled,
    /// Liveness of the VM/host is being established.
    Investigating,
    /// The VM is being isolated from storage and network.
    Fencing,
    /// The VM is being moved to another host.
    Migrating,
    /// Work finished; kept for audit until cleanup.
    Done,
    /// Superseded or no longer needed.
    Cancelled,
    /// Work failed terminally.
    Error,
}

impl Step {
    /// Terminal steps are never executed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Done | Step::Cancelled | Step::Error)
    }
}

/// Why the work was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonType {
    /// Host was put into maintenance.
    HostMaintenance,
    /// Host was detected down.
    HostDown,
    /// Host was reported degraded.
    HostDegraded,
    /// VM stopped unexpectedly.
    VmStopped,
    /// An operator asked for it.
    UserRequested,
    /// No recorded reason.
    Unknown,
}

impl ReasonType {
    /// Reasons that allow cancelling in-flight work once the source host
    /// comes back `Up`.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            ReasonType::HostMaintenance | ReasonType::HostDown | ReasonType::HostDegraded
        )
    }
}

/// A persisted unit of recovery work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Store-assigned identifier; 0 until persisted.
    pub id: WorkId,
    /// The VM this work is about.
    pub instance_id: VmId,
    /// Kind of VM, captured at schedule time.
    pub instance_type: VmType,
    /// Kind of work.
    pub work_type: WorkType,
    /// Current step.
    pub step: Step,
    /// Host the VM was last seen on; the source host for the work.
    pub host_id: HostId,
    /// VM state at schedule time; staleness barrier.
    pub previous_state: VmState,
    /// VM update counter at schedule time; staleness barrier.
    pub update_time: u64,
    /// Attempts consumed so far.
    pub times_tried: u32,
    /// Earliest epoch-seconds at which the item is eligible; 0 means now.
    pub time_to_try: i64,
    /// When a worker last claimed the item; cleared on release.
    pub date_taken: Option<i64>,
    /// Peer holding the lease; cleared on release.
    pub server_id: Option<PeerId>,
    /// Why the work was scheduled.
    pub reason: ReasonType,
    /// When the item was persisted.
    pub created_at: i64,
    /// When the item reached a terminal step.
    pub completed_at: Option<i64>,
}

impl WorkItem {
    /// Build an unpersisted work item. The store assigns `id`,
    /// `created_at` and resets the scheduling fields on persist.
    pub fn new(
        instance_id: VmId,
        instance_type: VmType,
        work_type: WorkType,
        step: Step,
        host_id: HostId,
        previous_state: VmState,
        times_tried: u32,
        update_time: u64,
        reason: ReasonType,
    ) -> Self {
        Self {
            id: 0,
            instance_id,
            instance_type,
            work_type,
            step,
            host_id,
            previous_state,
            update_time,
            times_tried,
            time_to_try: 0,
            date_taken: None,
            server_id: None,
            reason,
            created_at: 0,
            completed_at: None,
        }
    }

    /// Whether this item completed long enough ago that a newly
    /// scheduled item for the same VM starts with a fresh retry budget.
    ///
    /// A flapping VM whose previous HA attempt finished within the
    /// window carries the old attempt count forward instead.
    pub fn can_schedule_new(&self, window_secs: i64) -> bool {
        match self.completed_at {
            None => true,
            Some(completed) => completed + window_secs < now_secs(),
        }
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HAWork[{}-{:?}-{}-{:?}-{:?}]",
            self.id, self.work_type, self.instance_id, self.previous_state, self.step
        )
    }
}
