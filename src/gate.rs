//! Per-zone feature gate for the HA coordinator.
//!
//! Operators can disable HA (and separately, HA alerting) per zone at
//! runtime. Scheduling APIs refuse new work for disabled zones; workers
//! reschedule claimed items instead of executing them, so disabling
//! never loses work.

use crate::types::ZoneId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Runtime on/off switches, defaulting to enabled with per-zone
/// overrides.
#[derive(Debug, Default)]
pub struct HaGate {
    enabled: RwLock<HashMap<ZoneId, bool>>,
    alerts_enabled: RwLock<HashMap<ZoneId, bool>>,
}

impl HaGate {
    /// Gate with everything enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether VM HA may schedule and execute work in the zone.
    pub fn vm_ha_enabled(&self, zone_id: ZoneId) -> bool {
        *self.enabled.read().get(&zone_id).unwrap_or(&true)
    }

    /// Whether HA alerts may be sent for the zone.
    pub fn alerts_enabled(&self, zone_id: ZoneId) -> bool {
        *self.alerts_enabled.read().get(&zone_id).unwrap_or(&true)
    }

    /// Override the HA gate for one zone.
    pub fn set_vm_ha_enabled(&self, zone_id: ZoneId, enabled: bool) {
        self.enabled.write().insert(zone_id, enabled);
    }

    /// Override the alerts gate for one zone.
    pub fn set_alerts_enabled(&self, zone_id: ZoneId, enabled: bool) {
        self.alerts_enabled.write().insert(zone_id, enabled);
    }
}
