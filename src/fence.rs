//! Fencers: isolate a lost VM from shared storage and network.
//!
//! When no investigator can prove a VM dead or alive, the coordinator
//! must fence it off before restarting it elsewhere, or a half-alive
//! copy could keep writing to shared storage. Fencers are consulted in
//! registration order; the first success wins.

use crate::types::{Host, Vm};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Outcome of a fencing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOutcome {
    /// The VM is isolated; restart elsewhere is safe.
    Fenced,
    /// The fencer tried and failed.
    Failed,
    /// The fencer does not apply to this VM or host.
    NotApplicable,
}

/// A single fencing mechanism (storage lease revocation, network
/// isolation, power control, ...).
#[async_trait]
pub trait Fencer: Send + Sync {
    /// Attempt to fence the VM off its last known host.
    async fn fence_off(&self, vm: &Vm, host: &Host) -> FenceOutcome;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// The ordered collection of fencers.
#[derive(Clone)]
pub struct FencerSet {
    fencers: Vec<Arc<dyn Fencer>>,
}

impl FencerSet {
    /// Build a set; order is consultation order.
    pub fn new(fencers: Vec<Arc<dyn Fencer>>) -> Self {
        Self { fencers }
    }

    /// Try fencers in order until one succeeds. Returns whether the VM
    /// ended up fenced.
    pub async fn fence(&self, vm: &Vm, host: &Host) -> bool {
        for fencer in &self.fencers {
            let outcome = fencer.fence_off(vm, host).await;
            info!(fencer = fencer.name(), vm = %vm, ?outcome, "Fencer returned");
            if outcome == FenceOutcome::Fenced {
                return true;
            }
        }
        false
    }
}
