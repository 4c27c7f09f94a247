//! Vigil - the high-availability coordinator of a VM management plane.
//!
//! Vigil keeps guest virtual machines running in the face of host and VM
//! failures. Recovery requests are persisted into a work queue shared by
//! every management-server peer; a pool of workers claims items under a
//! lease and drives each through a retrying state machine: investigate
//! the suspect host, fence the lost VM, stop it, and restart it on
//! surviving capacity. Migration, stop and destroy requests flow through
//! the same queue.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Vigil                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scheduler API: restart | stop | migrate | destroy          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Work Store: claim/lease queue shared across peers          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Worker Pool: claim → state machine → done / reschedule     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Strategies: Investigators | Fencers | HA Planners          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Collaborators: Orchestrator | Volumes | Alerts | Inventory │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use vigil::config::VigilConfig;
//! use vigil::coordinator::{Dependencies, HaCoordinator};
//! use vigil::fence::FencerSet;
//! use vigil::investigate::InvestigatorSet;
//! use vigil::planner::PlannerSet;
//!
//! # async fn run(deps: Dependencies) -> vigil::Result<()> {
//! let coordinator = HaCoordinator::new(
//!     1,
//!     VigilConfig::default(),
//!     deps,
//!     InvestigatorSet::new(vec![]),
//!     FencerSet::new(vec![]),
//!     PlannerSet::default(),
//! )?;
//! coordinator.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fence;
pub mod gate;
pub mod inventory;
pub mod investigate;
pub mod orchestrator;
pub mod planner;
pub mod recovery;
pub mod store;
pub mod types;
pub mod work;
pub mod worker;

pub use config::VigilConfig;
pub use coordinator::{Dependencies, HaCoordinator, PeerListener};
pub use error::{Result, VigilError};
pub use work::{ReasonType, Step, StopKind, WorkItem, WorkType};
