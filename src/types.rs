//! Core type definitions for the vigil HA coordinator.
//!
//! This module contains the fundamental data types shared across the
//! coordinator: identifiers, the VM and host records consumed from the
//! management-plane inventory, and the enumerations that drive recovery
//! decisions.
//!
//! # Type Aliases
//!
//! Common identifiers are defined as type aliases for clarity:
//!
//! - [`VmId`] = `u64`: VM instance identifier
//! - [`HostId`] = `u64`: hypervisor host identifier
//! - [`ZoneId`] = `u64`: availability zone identifier
//! - [`PodId`] = `u64`: pod identifier within a zone
//! - [`PeerId`] = `u64`: management-server peer identifier
//! - [`WorkId`] = `u64`: persisted work item identifier
//!
//! # Examples
//!
//! ```rust
//! use vigil::types::{Vm, VmState, VmType};
//!
//! let vm = Vm::new(1, VmType::User, "web-01");
//! assert_eq!(vm.state, VmState::Stopped);
//! assert!(!vm.vm_type.is_system());
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a VM instance.
pub type VmId = u64;

/// Unique identifier for a hypervisor host.
pub type HostId = u64;

/// Unique identifier for an availability zone.
pub type ZoneId = u64;

/// Unique identifier for a pod within a zone.
pub type PodId = u64;

/// Unique identifier for a management-server peer.
pub type PeerId = u64;

/// Unique identifier for a persisted work item.
pub type WorkId = u64;

/// Unique identifier for a volume.
pub type VolumeId = u64;

/// Current wall-clock time as Unix epoch seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// VM lifecycle state as tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// VM is running on a host.
    Running,
    /// VM is stopped.
    Stopped,
    /// VM is in the process of starting.
    Starting,
    /// VM is in the process of stopping.
    Stopping,
    /// VM is migrating between hosts.
    Migrating,
    /// VM has been destroyed but not yet expunged.
    Destroyed,
    /// VM is being expunged from the system.
    Expunging,
    /// VM is in an error state.
    Error,
    /// State could not be determined.
    Unknown,
}

/// Kind of VM instance.
///
/// System VM types (router, console proxy, secondary storage) are
/// managed by dedicated lifecycle managers and restart before user VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    /// Guest VM owned by an end user.
    User,
    /// Virtual router appliance.
    DomainRouter,
    /// Console proxy system VM.
    ConsoleProxy,
    /// Secondary storage system VM.
    SecondaryStorageVm,
    /// Any other instance type.
    Other,
}

impl VmType {
    /// Whether this is an infrastructure (system) VM.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            VmType::DomainRouter | VmType::ConsoleProxy | VmType::SecondaryStorageVm
        )
    }
}

/// Host liveness status as reported by investigators and the agent layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    /// Host agent is connected and responsive.
    Up,
    /// Host is confirmed down.
    Down,
    /// Host agent connection was lost.
    Disconnected,
    /// Host needs operator attention.
    Alert,
}

/// Role of a host in the management plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostType {
    /// Host that runs guest VMs.
    Routing,
    /// Dedicated storage host.
    Storage,
    /// Any other host role.
    Other,
}

/// Hypervisor family running on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorFamily {
    Kvm,
    Vmware,
    Hyperv,
    Xen,
    Other,
}

/// VM record as read from the management-plane inventory.
///
/// `update_count` is the VM's monotonic update counter; the recovery
/// state machine compares it against the value captured at schedule time
/// to detect concurrent user or orchestrator actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    /// Internal identifier.
    pub id: VmId,
    /// External identity used in orchestrator calls.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Instance kind.
    pub vm_type: VmType,
    /// Current lifecycle state.
    pub state: VmState,
    /// Host the VM currently sits on, if any.
    pub host_id: Option<HostId>,
    /// Host the VM last ran on.
    pub last_host_id: Option<HostId>,
    /// Availability zone.
    pub zone_id: ZoneId,
    /// Pod the VM is deployed in, if placed.
    pub pod_id: Option<PodId>,
    /// Hypervisor family of the VM's host.
    pub hypervisor: HypervisorFamily,
    /// Whether the owner opted the VM into HA.
    pub ha_enabled: bool,
    /// Monotonic update counter.
    pub update_count: u64,
}

impl Vm {
    /// Create a stopped VM record with sensible defaults, mainly for tests.
    pub fn new(id: VmId, vm_type: VmType, name: impl Into<String>) -> Self {
        Self {
            id,
            uuid: Uuid::new_v4(),
            name: name.into(),
            vm_type,
            state: VmState::Stopped,
            host_id: None,
            last_host_id: None,
            zone_id: 1,
            pod_id: Some(1),
            hypervisor: HypervisorFamily::Kvm,
            ha_enabled: false,
            update_count: 0,
        }
    }
}

impl std::fmt::Display for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VM[{}|{}]", self.id, self.name)
    }
}

/// Host record as read from the management-plane inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Internal identifier.
    pub id: HostId,
    /// Display name.
    pub name: String,
    /// Host role.
    pub host_type: HostType,
    /// Hypervisor family.
    pub hypervisor: HypervisorFamily,
    /// Availability zone.
    pub zone_id: ZoneId,
    /// Pod within the zone.
    pub pod_id: PodId,
    /// Last known status.
    pub status: HostStatus,
    /// Whether the host has been removed from service.
    pub removed: bool,
}

impl Host {
    /// Create an Up routing host record, mainly for tests.
    pub fn new(id: HostId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            host_type: HostType::Routing,
            hypervisor: HypervisorFamily::Kvm,
            zone_id: 1,
            pod_id: 1,
            status: HostStatus::Up,
            removed: false,
        }
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Host[{}|{}]", self.id, self.name)
    }
}

/// Storage pool kind backing a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Network filesystem pool.
    NetworkFilesystem,
    /// Shared block pool whose exports linger across nodes; volumes must
    /// be detached everywhere before the VM starts elsewhere.
    SharedBlock,
    /// Storage local to a single host.
    Local,
    /// Any other pool kind.
    Other,
}

impl PoolType {
    /// Whether volumes on this pool must be detached from every storage
    /// node before the VM can be started on a different host.
    pub fn requires_full_detach(&self) -> bool {
        matches!(self, PoolType::SharedBlock)
    }
}

/// Volume record, as much of it as recovery needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Internal identifier.
    pub id: VolumeId,
    /// Owning VM.
    pub vm_id: VmId,
    /// Pool kind the volume lives on.
    pub pool_type: PoolType,
}
