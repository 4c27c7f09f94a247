//! Operator alerting.
//!
//! Recovery progress and failures are conveyed to operators through an
//! [`AlertSink`]; the transport behind it (email, webhook, pager) is not
//! the coordinator's concern. Alert types mirror the kind of resource
//! the alert is about so downstream routing can fan them out.

use crate::types::{PodId, VmType, ZoneId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of resource an alert concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// A user VM.
    UserVm,
    /// A virtual router.
    DomainRouter,
    /// A console proxy system VM.
    ConsoleProxy,
    /// A secondary storage system VM.
    SecondaryStorageVm,
    /// A hypervisor host.
    Host,
}

impl From<VmType> for AlertType {
    fn from(vm_type: VmType) -> Self {
        match vm_type {
            VmType::DomainRouter => AlertType::DomainRouter,
            VmType::ConsoleProxy => AlertType::ConsoleProxy,
            VmType::SecondaryStorageVm => AlertType::SecondaryStorageVm,
            VmType::User | VmType::Other => AlertType::UserVm,
        }
    }
}

/// One operator-facing alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Kind of resource the alert is about.
    pub alert_type: AlertType,
    /// Zone the resource lives in.
    pub zone_id: ZoneId,
    /// Pod, when the resource is placed.
    pub pod_id: Option<PodId>,
    /// Short subject line.
    pub subject: String,
    /// Full body.
    pub body: String,
}

/// Destination for alerts. Must be safe to call from workers and
/// scheduler callers concurrently.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert. Delivery failures are the sink's problem;
    /// recovery never blocks on alerting.
    async fn send_alert(&self, alert: Alert);
}
