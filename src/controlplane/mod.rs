//! Control Plane Module
//!
//! Everything around the migration core that a long-running service needs:
//! the run manager, the REST API over it, and a simulated control plane for
//! rehearsals.

pub mod api;
pub mod runs;
pub mod simulated;

pub use api::*;
pub use runs::{generate_run_id, PipelineSummary, RunManager, RunView};
pub use simulated::{ResourceKind, SimulatedControlPlane, SimulatedWorld, SimulationConfig};
