//! Liveness investigators.
//!
//! Investigators are ordered pluggable oracles consulted when the
//! coordinator needs to know whether a host or a VM is still alive.
//! The first investigator with a definitive answer wins; an
//! investigator that does not recognize the VM defers to the next one.

use crate::error::VigilError;
use crate::types::{Host, HostStatus, Vm};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A single liveness oracle.
///
/// Implementations typically probe hypervisor agents, ping management
/// networks or ask neighbouring hosts.
#[async_trait]
pub trait Investigator: Send + Sync {
    /// Host-level liveness. `None` means "cannot tell, ask the next one".
    async fn is_agent_alive(&self, host: &Host) -> Option<HostStatus>;

    /// VM-level liveness. `Err(VigilError::UnknownVm)` means this
    /// investigator does not recognize the VM and the next one should be
    /// asked; it is not a verdict.
    async fn is_vm_alive(&self, vm: &Vm, host: &Host) -> crate::error::Result<bool>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// The ordered collection of investigators.
#[derive(Clone)]
pub struct InvestigatorSet {
    investigators: Vec<Arc<dyn Investigator>>,
}

impl InvestigatorSet {
    /// Build a set; order is consultation order.
    pub fn new(investigators: Vec<Arc<dyn Investigator>>) -> Self {
        Self { investigators }
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.investigators.is_empty()
    }

    /// Determine host status: the first non-`None` answer wins.
    pub async fn host_status(&self, host: &Host) -> Option<HostStatus> {
        for investigator in &self.investigators {
            match investigator.is_agent_alive(host).await {
                Some(status) => {
                    debug!(
                        investigator = investigator.name(),
                        host = %host,
                        ?status,
                        "Investigator determined host status"
                    );
                    return Some(status);
                }
                None => {
                    debug!(
                        investigator = investigator.name(),
                        host = %host,
                        "Investigator unable to determine host status, moving on"
                    );
                }
            }
        }
        None
    }

    /// Determine VM liveness: the first definitive verdict wins; an
    /// `UnknownVm` answer moves to the next investigator. `Ok(None)`
    /// when every investigator is exhausted without a verdict. Any
    /// other investigator error is not a verdict and propagates to the
    /// caller's retry handling.
    pub async fn vm_alive(&self, vm: &Vm, host: &Host) -> crate::error::Result<Option<bool>> {
        for investigator in &self.investigators {
            match investigator.is_vm_alive(vm, host).await {
                Ok(alive) => {
                    info!(
                        investigator = investigator.name(),
                        vm = %vm,
                        alive,
                        "Investigator found VM liveness"
                    );
                    return Ok(Some(alive));
                }
                Err(VigilError::UnknownVm(_)) => {
                    info!(
                        investigator = investigator.name(),
                        vm = %vm,
                        "Investigator could not find VM"
                    );
                }
                Err(error) => {
                    warn!(
                        investigator = investigator.name(),
                        vm = %vm,
                        %error,
                        "Investigator failed"
                    );
                    return Err(error);
                }
            }
        }
        Ok(None)
    }
}
