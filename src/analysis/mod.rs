//! Analysis scheduler.
//!
//! Every machine runs one cooperative loop ([`MachineScheduler`]) that traverses an
//! [`AnalysisGraph`] from its entry to an end node, then starts over. The graph is
//! built once per machine; branch nodes re-evaluate their predicate on every visit,
//! so a machine starting or stopping production switches graph on the very next
//! iteration.
//!
//! Three entry graphs exist:
//!
//! - **catch-up**, entered at cold start when `Analysis.CatchUp.{machine}` is set:
//!   every step with an unlimited budget, then the marker is deleted;
//! - **producing**: time-budgeted steps with fallback edges on exceeded budget;
//! - **not producing**: a lighter order with a reason-slots-only fallback when the
//!   activity analysis fails.
//!
//! Steps of one machine never run concurrently; machines are independent.

pub mod graph;
pub mod pause;
pub mod scheduler;
pub mod step;

pub use graph::{AnalysisGraph, Node, NodeId, Predicate};
pub use pause::PauseGate;
pub use scheduler::{
    request_catch_up, AnalysisMode, MachineScheduler, SchedulerHandle, SchedulerStatus,
};
pub use step::{
    AnalysisStep, ExtensionStep, MachineAnalysis, PriorityFilter, StepBudget, StepOutcome,
};
