//! The shared work store: durable persistence with claim/lease semantics.
//!
//! Every management-server peer drains the same queue. [`WorkStore::take`]
//! is the claim protocol: it atomically stamps the item with the claiming
//! peer and the claim time, so at most one worker across the cluster holds
//! a given item. Releasing clears both fields.
//!
//! [`MemoryWorkStore`] keeps the whole queue behind a single async mutex,
//! which makes `take` linearizable and FIFO within `(time_to_try, id)`.
//! Production deployments back the [`WorkStore`] trait with the
//! management database instead.

use crate::error::{Result, VigilError};
use crate::types::{now_secs, HostId, PeerId, VmId, WorkId};
use crate::work::{Step, WorkItem, WorkType};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Contract for the persisted work queue.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Persist a new work item. Assigns the id, stamps `created_at` and
    /// makes the item eligible immediately (`time_to_try = 0`, no lease).
    async fn persist(&self, item: WorkItem) -> Result<WorkItem>;

    /// Atomically claim the oldest eligible item for `server_id`.
    ///
    /// Eligible means: no lease, non-terminal step and
    /// `time_to_try <= now`. Items are served in `(time_to_try, id)`
    /// order. Concurrent callers never receive the same item.
    async fn take(&self, server_id: PeerId) -> Result<Option<WorkItem>>;

    /// Write back an item. The id must already exist and cannot change.
    async fn update(&self, item: &WorkItem) -> Result<()>;

    /// Whether a not-yet-claimed, non-terminal item of this type is
    /// already waiting for the VM.
    async fn has_been_scheduled(&self, vm_id: VmId, work_type: WorkType) -> Result<bool>;

    /// Non-terminal HA items for the VM.
    async fn list_pending_ha_work_for_vm(&self, vm_id: VmId) -> Result<Vec<WorkItem>>;

    /// Non-terminal migration items for the VM.
    async fn list_pending_migrations_for_vm(&self, vm_id: VmId) -> Result<Vec<WorkItem>>;

    /// Every HA item ever recorded for the VM, newest first. Feeds the
    /// retry carry-over decision at schedule time.
    async fn find_previous_ha(&self, vm_id: VmId) -> Result<Vec<WorkItem>>;

    /// Non-terminal HA items for the VM newer than `exclude_id`.
    async fn list_future_ha_work_for_vm(
        &self,
        vm_id: VmId,
        exclude_id: WorkId,
    ) -> Result<Vec<WorkItem>>;

    /// Other HA items for the VM currently claimed by some worker.
    async fn list_running_ha_work_for_vm(
        &self,
        vm_id: VmId,
        exclude_id: WorkId,
    ) -> Result<Vec<WorkItem>>;

    /// Items of the given type currently leased anywhere in the cluster.
    async fn find_taken_work_items(&self, work_type: WorkType) -> Result<Vec<WorkItem>>;

    /// Drop pending items of the given type for a host, scoped to items
    /// that are unclaimed or claimed by `server_id`.
    async fn delete_migration_work_items(
        &self,
        host_id: HostId,
        work_type: WorkType,
        server_id: PeerId,
    ) -> Result<()>;

    /// Clear the lease on every item owned by `server_id`. Idempotent.
    async fn release_work_items(&self, server_id: PeerId) -> Result<()>;

    /// Startup recovery: make ownerless in-flight investigations
    /// re-eligible. The step is preserved; only the lease is cleared.
    async fn mark_pending_works_as_investigating(&self) -> Result<()>;

    /// Graceful-shutdown counterpart of
    /// [`WorkStore::mark_pending_works_as_investigating`], scoped to one
    /// peer's leases.
    async fn mark_server_pending_works_as_investigating(&self, server_id: PeerId) -> Result<()>;

    /// Purge terminal items that completed before `older_than`
    /// (epoch seconds). Never touches non-terminal items.
    async fn cleanup(&self, older_than: i64) -> Result<()>;

    /// Bulk-purge all items belonging to the given VMs, in batches.
    /// Returns the number of items removed.
    async fn expunge_by_vm_list(&self, vm_ids: &[VmId], batch_size: usize) -> Result<usize>;

    /// Drop pending unclaimed items of the given type for a VM.
    async fn delete(&self, vm_id: VmId, work_type: WorkType) -> Result<()>;
}

/// In-memory [`WorkStore`] backed by a single mutex-guarded map.
///
/// The map is keyed by item id, so iteration order doubles as insertion
/// order and ties on `time_to_try` resolve FIFO.
#[derive(Debug, Default)]
pub struct MemoryWorkStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_id: WorkId,
    items: BTreeMap<WorkId, WorkItem>,
}

impl MemoryWorkStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items currently held, terminal ones included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    /// Whether the store holds no items.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.items.is_empty()
    }

    /// Fetch a snapshot of one item by id.
    pub async fn get(&self, id: WorkId) -> Option<WorkItem> {
        self.inner.lock().await.items.get(&id).cloned()
    }

    /// Snapshot every item, in id order.
    pub async fn snapshot(&self) -> Vec<WorkItem> {
        self.inner.lock().await.items.values().cloned().collect()
    }
}

#[async_trait]
impl WorkStore for MemoryWorkStore {
    async fn persist(&self, mut item: WorkItem) -> Result<WorkItem> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        item.id = inner.next_id;
        item.created_at = now_secs();
        item.time_to_try = 0;
        item.date_taken = None;
        item.server_id = None;
        item.completed_at = None;
        inner.items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn take(&self, server_id: PeerId) -> Result<Option<WorkItem>> {
        let now = now_secs();
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .items
            .values()
            .filter(|w| w.server_id.is_none() && !w.step.is_terminal() && w.time_to_try <= now)
            .min_by_key(|w| (w.time_to_try, w.id))
            .map(|w| w.id);

        Ok(candidate.and_then(|id| {
            inner.items.get_mut(&id).map(|work| {
                work.server_id = Some(server_id);
                work.date_taken = Some(now);
                work.clone()
            })
        }))
    }

    async fn update(&self, item: &WorkItem) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.items.get_mut(&item.id) {
            Some(stored) => {
                let mut updated = item.clone();
                if updated.step.is_terminal() && stored.completed_at.is_none() {
                    updated.completed_at = Some(now_secs());
                }
                *stored = updated;
                Ok(())
            }
            None => Err(VigilError::WorkNotFound(item.id)),
        }
    }

    async fn has_been_scheduled(&self, vm_id: VmId, work_type: WorkType) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.items.values().any(|w| {
            w.instance_id == vm_id
                && w.work_type == work_type
                && w.server_id.is_none()
                && matches!(w.step, Step::Scheduled | Step::Investigating)
        }))
    }

    async fn list_pending_ha_work_for_vm(&self, vm_id: VmId) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .items
            .values()
            .filter(|w| {
                w.instance_id == vm_id && w.work_type == WorkType::Ha && !w.step.is_terminal()
            })
            .cloned()
            .collect())
    }

    async fn list_pending_migrations_for_vm(&self, vm_id: VmId) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .items
            .values()
            .filter(|w| {
                w.instance_id == vm_id && w.work_type == WorkType::Migration && !w.step.is_terminal()
            })
            .cloned()
            .collect())
    }

    async fn find_previous_ha(&self, vm_id: VmId) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        let mut items: Vec<_> = inner
            .items
            .values()
            .filter(|w| w.instance_id == vm_id && w.work_type == WorkType::Ha)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(items)
    }

    async fn list_future_ha_work_for_vm(
        &self,
        vm_id: VmId,
        exclude_id: WorkId,
    ) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .items
            .values()
            .filter(|w| {
                w.instance_id == vm_id
                    && w.work_type == WorkType::Ha
                    && w.id > exclude_id
                    && !w.step.is_terminal()
            })
            .cloned()
            .collect())
    }

    async fn list_running_ha_work_for_vm(
        &self,
        vm_id: VmId,
        exclude_id: WorkId,
    ) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .items
            .values()
            .filter(|w| {
                w.instance_id == vm_id
                    && w.work_type == WorkType::Ha
                    && w.id != exclude_id
                    && w.server_id.is_some()
                    && !w.step.is_terminal()
            })
            .cloned()
            .collect())
    }

    async fn find_taken_work_items(&self, work_type: WorkType) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .items
            .values()
            .filter(|w| w.work_type == work_type && w.server_id.is_some() && !w.step.is_terminal())
            .cloned()
            .collect())
    }

    async fn delete_migration_work_items(
        &self,
        host_id: HostId,
        work_type: WorkType,
        server_id: PeerId,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.items.retain(|_, w| {
            let cancellable = w.host_id == host_id
                && w.work_type == work_type
                && !w.step.is_terminal()
                && (w.server_id.is_none() || w.server_id == Some(server_id));
            !cancellable
        });
        Ok(())
    }

    async fn release_work_items(&self, server_id: PeerId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for work in inner.items.values_mut() {
            if work.server_id == Some(server_id) {
                work.server_id = None;
                work.date_taken = None;
            }
        }
        Ok(())
    }

    async fn mark_pending_works_as_investigating(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for work in inner.items.values_mut() {
            if work.step == Step::Investigating && work.server_id.is_none() {
                work.date_taken = None;
                work.time_to_try = 0;
            }
        }
        Ok(())
    }

    async fn mark_server_pending_works_as_investigating(&self, server_id: PeerId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for work in inner.items.values_mut() {
            if work.server_id == Some(server_id) && !work.step.is_terminal() {
                work.server_id = None;
                work.date_taken = None;
            }
        }
        Ok(())
    }

    async fn cleanup(&self, older_than: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.items.retain(|_, w| {
            if !w.step.is_terminal() {
                return true;
            }
            let finished = w.completed_at.unwrap_or(w.created_at);
            finished >= older_than
        });
        Ok(())
    }

    async fn expunge_by_vm_list(&self, vm_ids: &[VmId], batch_size: usize) -> Result<usize> {
        let mut removed = 0;
        loop {
            let mut inner = self.inner.lock().await;
            let batch: Vec<WorkId> = inner
                .items
                .values()
                .filter(|w| vm_ids.contains(&w.instance_id))
                .map(|w| w.id)
                .take(batch_size.max(1))
                .collect();
            if batch.is_empty() {
                break;
            }
            for id in batch {
                inner.items.remove(&id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete(&self, vm_id: VmId, work_type: WorkType) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.items.retain(|_, w| {
            !(w.instance_id == vm_id
                && w.work_type == work_type
                && w.server_id.is_none()
                && !w.step.is_terminal())
        });
        Ok(())
    }
}
