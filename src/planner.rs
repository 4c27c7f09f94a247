//! Placement planners.
//!
//! A planner picks the target host for a (re)starting VM. The
//! coordinator never places VMs itself: it passes a planner handle to
//! the orchestrator's start calls. Restart first runs with the VM's
//! original planner (no override) and falls back to the first emergency
//! HA planner when capacity runs out.

use std::sync::Arc;

/// An opaque placement strategy handle, resolved by the orchestrator.
pub trait Planner: Send + Sync {
    /// Name used in logs and by the orchestrator to resolve the strategy.
    fn name(&self) -> &str;
}

/// Ordered emergency planners for HA restarts.
#[derive(Clone, Default)]
pub struct PlannerSet {
    ha_planners: Vec<Arc<dyn Planner>>,
}

impl PlannerSet {
    /// Build a set; order is fallback priority.
    pub fn new(ha_planners: Vec<Arc<dyn Planner>>) -> Self {
        Self { ha_planners }
    }

    /// The emergency planner used when the original placement has no
    /// capacity left, if one is configured.
    pub fn ha_planner(&self) -> Option<Arc<dyn Planner>> {
        self.ha_planners.first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedPlanner(&'static str);

    impl Planner for NamedPlanner {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_first_planner_is_the_emergency_fallback() {
        let set = PlannerSet::new(vec![
            Arc::new(NamedPlanner("ha-first-fit")),
            Arc::new(NamedPlanner("ha-spread")),
        ]);
        assert_eq!(set.ha_planner().map(|p| p.name().to_string()).as_deref(), Some("ha-first-fit"));
    }

    #[test]
    fn test_empty_set_has_no_fallback() {
        assert!(PlannerSet::default().ha_planner().is_none());
    }
}
