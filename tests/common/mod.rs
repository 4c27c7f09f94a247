//! Shared test harness: an in-memory management plane with scripted
//! collaborators, wired into a real coordinator over the real store.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vigil::alerts::{Alert, AlertSink};
use vigil::config::VigilConfig;
use vigil::coordinator::{Dependencies, HaCoordinator};
use vigil::fence::{FenceOutcome, Fencer, FencerSet};
use vigil::inventory::Inventory;
use vigil::investigate::{Investigator, InvestigatorSet};
use vigil::orchestrator::{ResourceManager, StartParams, VmLifecycle, VolumeService};
use vigil::planner::{Planner, PlannerSet};
use vigil::store::MemoryWorkStore;
use vigil::types::{
    Host, HostId, HostStatus, PodId, Vm, VmId, VmState, Volume, VolumeId, ZoneId,
};
use vigil::VigilError;

/// Host id the fake orchestrator places restarted VMs on.
pub const RESTART_TARGET_HOST: HostId = 99;

/// The simulated management plane: inventory plus recorded side effects.
#[derive(Default)]
pub struct FakeWorld {
    pub vms: RwLock<HashMap<VmId, Vm>>,
    pub hosts: RwLock<HashMap<HostId, Host>>,
    pub removed_hosts: RwLock<HashMap<HostId, Host>>,
    pub local_storage_vms: RwLock<HashSet<VmId>>,
    pub pinned_vms: RwLock<HashSet<VmId>>,
    pub volumes: RwLock<HashMap<VmId, Vec<Volume>>>,

    pub stops: Mutex<Vec<(VmId, bool)>>,
    pub starts: Mutex<Vec<(VmId, bool)>>,
    pub start_results: Mutex<VecDeque<Result<(), VigilError>>>,
    pub migrations: Mutex<Vec<(VmId, HostId)>>,
    pub migrate_results: Mutex<VecDeque<Result<(), VigilError>>>,
    pub destroys: Mutex<Vec<(VmId, bool)>>,
    pub proxy_destroys: Mutex<Vec<VmId>>,
    pub ssvm_destroys: Mutex<Vec<VmId>>,
    pub detached_volumes: Mutex<Vec<VolumeId>>,
    pub migrate_away_failed_calls: Mutex<Vec<(HostId, VmId)>>,
    pub alerts: Mutex<Vec<Alert>>,
}

impl FakeWorld {
    pub fn add_vm(&self, vm: Vm) {
        self.vms.write().insert(vm.id, vm);
    }

    pub fn add_host(&self, host: Host) {
        self.hosts.write().insert(host.id, host);
    }

    pub fn vm(&self, id: VmId) -> Vm {
        self.vms.read().get(&id).cloned().expect("vm exists")
    }

    pub fn set_vm_state(&self, id: VmId, state: VmState) {
        if let Some(vm) = self.vms.write().get_mut(&id) {
            vm.state = state;
        }
    }

    pub fn bump_vm_update(&self, id: VmId) {
        if let Some(vm) = self.vms.write().get_mut(&id) {
            vm.update_count += 1;
        }
    }

    pub fn set_host_status(&self, id: HostId, status: HostStatus) {
        if let Some(host) = self.hosts.write().get_mut(&id) {
            host.status = status;
        }
    }

    fn vm_id_by_uuid(&self, uuid: &Uuid) -> Option<VmId> {
        self.vms.read().values().find(|vm| &vm.uuid == uuid).map(|vm| vm.id)
    }

    fn apply_stop(&self, vm_id: VmId) {
        if let Some(vm) = self.vms.write().get_mut(&vm_id) {
            vm.state = VmState::Stopped;
            vm.last_host_id = vm.host_id.take();
            vm.update_count += 1;
        }
    }

    fn apply_start(&self, vm_id: VmId) {
        if let Some(vm) = self.vms.write().get_mut(&vm_id) {
            vm.state = VmState::Running;
            vm.host_id = Some(RESTART_TARGET_HOST);
            vm.update_count += 1;
        }
    }

    fn start(&self, vm_id: VmId, emergency: bool) -> Result<(), VigilError> {
        self.starts.lock().push((vm_id, emergency));
        let scripted = self.start_results.lock().pop_front();
        match scripted {
            Some(Err(error)) => Err(error),
            Some(Ok(())) | None => {
                self.apply_start(vm_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Inventory for FakeWorld {
    async fn vm_by_id(&self, id: VmId) -> Option<Vm> {
        self.vms.read().get(&id).cloned()
    }

    async fn vm_by_uuid(&self, uuid: &Uuid) -> Option<Vm> {
        self.vms.read().values().find(|vm| &vm.uuid == uuid).cloned()
    }

    async fn vms_on_host(&self, host_id: HostId) -> Vec<Vm> {
        self.vms
            .read()
            .values()
            .filter(|vm| vm.host_id == Some(host_id))
            .cloned()
            .collect()
    }

    async fn host_by_id(&self, id: HostId) -> Option<Host> {
        self.hosts.read().get(&id).cloned()
    }

    async fn host_by_id_including_removed(&self, id: HostId) -> Option<Host> {
        self.hosts
            .read()
            .get(&id)
            .cloned()
            .or_else(|| self.removed_hosts.read().get(&id).cloned())
    }

    async fn zone_name(&self, zone_id: ZoneId) -> String {
        format!("zone-{zone_id}")
    }

    async fn pod_name(&self, pod_id: PodId) -> String {
        format!("pod-{pod_id}")
    }

    async fn is_root_volume_on_local_storage(&self, vm_id: VmId) -> bool {
        self.local_storage_vms.read().contains(&vm_id)
    }
}

#[async_trait]
impl VmLifecycle for FakeWorld {
    async fn advance_stop(&self, uuid: &Uuid, force: bool) -> vigil::Result<()> {
        let vm_id = self
            .vm_id_by_uuid(uuid)
            .ok_or(VigilError::ResourceUnavailable("unknown vm".into()))?;
        self.stops.lock().push((vm_id, force));
        self.apply_stop(vm_id);
        Ok(())
    }

    async fn advance_start(
        &self,
        uuid: &Uuid,
        _params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> vigil::Result<()> {
        let vm_id = self
            .vm_id_by_uuid(uuid)
            .ok_or(VigilError::ResourceUnavailable("unknown vm".into()))?;
        self.start(vm_id, planner.is_some())
    }

    async fn migrate_away(&self, uuid: &Uuid, source_host: HostId) -> vigil::Result<()> {
        let vm_id = self
            .vm_id_by_uuid(uuid)
            .ok_or(VigilError::ResourceUnavailable("unknown vm".into()))?;
        self.migrations.lock().push((vm_id, source_host));
        let scripted = self.migrate_results.lock().pop_front();
        match scripted {
            Some(Err(error)) => Err(error),
            Some(Ok(())) | None => {
                if let Some(vm) = self.vms.write().get_mut(&vm_id) {
                    vm.last_host_id = vm.host_id.replace(RESTART_TARGET_HOST);
                    vm.update_count += 1;
                }
                Ok(())
            }
        }
    }

    async fn destroy(&self, uuid: &Uuid, expunge: bool) -> vigil::Result<()> {
        let vm_id = self
            .vm_id_by_uuid(uuid)
            .ok_or(VigilError::ResourceUnavailable("unknown vm".into()))?;
        self.destroys.lock().push((vm_id, expunge));
        self.set_vm_state(vm_id, VmState::Destroyed);
        Ok(())
    }

    async fn destroy_proxy(&self, vm_id: VmId) -> vigil::Result<()> {
        self.proxy_destroys.lock().push(vm_id);
        self.set_vm_state(vm_id, VmState::Destroyed);
        Ok(())
    }

    async fn destroy_sec_storage_vm(&self, vm_id: VmId) -> vigil::Result<()> {
        self.ssvm_destroys.lock().push(vm_id);
        self.set_vm_state(vm_id, VmState::Destroyed);
        Ok(())
    }

    async fn start_router_for_ha(
        &self,
        vm: &Vm,
        _params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> vigil::Result<()> {
        self.start(vm.id, planner.is_some())
    }

    async fn start_proxy_for_ha(
        &self,
        vm: &Vm,
        _params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> vigil::Result<()> {
        self.start(vm.id, planner.is_some())
    }

    async fn start_sec_storage_vm_for_ha(
        &self,
        vm: &Vm,
        _params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> vigil::Result<()> {
        self.start(vm.id, planner.is_some())
    }

    async fn start_user_vm_for_ha(
        &self,
        vm: &Vm,
        _params: &StartParams,
        planner: Option<Arc<dyn Planner>>,
    ) -> vigil::Result<()> {
        self.start(vm.id, planner.is_some())
    }
}

#[async_trait]
impl VolumeService for FakeWorld {
    async fn can_vm_restart_on_another_server(&self, vm_id: VmId) -> bool {
        !self.pinned_vms.read().contains(&vm_id)
    }

    async fn volumes_for(&self, vm_id: VmId) -> Vec<Volume> {
        self.volumes.read().get(&vm_id).cloned().unwrap_or_default()
    }

    async fn detach_volume_from_all_storage_nodes(&self, volume: &Volume) -> vigil::Result<()> {
        self.detached_volumes.lock().push(volume.id);
        Ok(())
    }
}

#[async_trait]
impl ResourceManager for FakeWorld {
    async fn migrate_away_failed(&self, host_id: HostId, vm_id: VmId) {
        self.migrate_away_failed_calls.lock().push((host_id, vm_id));
    }
}

#[async_trait]
impl AlertSink for FakeWorld {
    async fn send_alert(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

/// Scripted investigator verdict for a VM.
#[derive(Clone, Copy)]
pub enum VmVerdict {
    Alive,
    Dead,
    Unknown,
    /// The probe itself fails (agent unreachable).
    Failing,
}

/// Investigator with fixed answers.
pub struct ScriptedInvestigator {
    pub name: &'static str,
    pub host_status: RwLock<Option<HostStatus>>,
    pub vm_verdict: RwLock<VmVerdict>,
}

impl ScriptedInvestigator {
    pub fn new(name: &'static str, host_status: Option<HostStatus>, vm_verdict: VmVerdict) -> Arc<Self> {
        Arc::new(Self {
            name,
            host_status: RwLock::new(host_status),
            vm_verdict: RwLock::new(vm_verdict),
        })
    }
}

#[async_trait]
impl Investigator for ScriptedInvestigator {
    async fn is_agent_alive(&self, _host: &Host) -> Option<HostStatus> {
        *self.host_status.read()
    }

    async fn is_vm_alive(&self, vm: &Vm, _host: &Host) -> vigil::Result<bool> {
        match *self.vm_verdict.read() {
            VmVerdict::Alive => Ok(true),
            VmVerdict::Dead => Ok(false),
            VmVerdict::Unknown => Err(VigilError::UnknownVm(vm.id)),
            VmVerdict::Failing => Err(VigilError::AgentUnavailable("agent probe failed".into())),
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// A one-investigator set named "simulator" with fixed answers.
pub fn simulator(
    host_status: Option<HostStatus>,
    vm_verdict: VmVerdict,
) -> Vec<Arc<dyn Investigator>> {
    let investigator: Arc<dyn Investigator> =
        ScriptedInvestigator::new("simulator", host_status, vm_verdict);
    vec![investigator]
}

/// Fencer with a fixed outcome.
pub struct ScriptedFencer {
    pub name: &'static str,
    pub outcome: FenceOutcome,
    pub calls: Mutex<usize>,
}

impl ScriptedFencer {
    pub fn new(name: &'static str, outcome: FenceOutcome) -> Arc<Self> {
        Arc::new(Self {
            name,
            outcome,
            calls: Mutex::new(0),
        })
    }
}

#[async_trait]
impl Fencer for ScriptedFencer {
    async fn fence_off(&self, _vm: &Vm, _host: &Host) -> FenceOutcome {
        *self.calls.lock() += 1;
        self.outcome
    }

    fn name(&self) -> &str {
        self.name
    }
}

struct TestPlanner(&'static str);

impl Planner for TestPlanner {
    fn name(&self) -> &str {
        self.0
    }
}

/// A coordinator wired over fakes, ready to start.
pub struct TestBed {
    pub world: Arc<FakeWorld>,
    pub store: Arc<MemoryWorkStore>,
    pub coordinator: HaCoordinator,
}

/// Peer id of the coordinator under test.
pub const SELF_PEER: u64 = 1;

pub fn testbed(
    investigators: Vec<Arc<dyn Investigator>>,
    fencers: Vec<Arc<dyn Fencer>>,
) -> TestBed {
    testbed_with_config(VigilConfig::development(), investigators, fencers)
}

pub fn testbed_with_config(
    config: VigilConfig,
    investigators: Vec<Arc<dyn Investigator>>,
    fencers: Vec<Arc<dyn Fencer>>,
) -> TestBed {
    let world = Arc::new(FakeWorld::default());
    let store = Arc::new(MemoryWorkStore::new());
    let deps = Dependencies {
        store: store.clone(),
        inventory: world.clone(),
        lifecycle: world.clone(),
        volumes: world.clone(),
        resources: world.clone(),
        alerts: world.clone(),
    };
    let coordinator = HaCoordinator::new(
        SELF_PEER,
        config,
        deps,
        InvestigatorSet::new(investigators),
        FencerSet::new(fencers),
        PlannerSet::new(vec![Arc::new(TestPlanner("ha-first-fit"))]),
    )
    .expect("valid test configuration");
    TestBed {
        world,
        store,
        coordinator,
    }
}

/// Poll a condition until it holds or a five-second budget runs out.
pub async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
