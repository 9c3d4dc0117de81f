//! # CNC Pipeline Core Library
//!
//! Data pipeline between CNC acquisition drivers and the analysis of machine
//! activity. Acquisition units push [`queue::ExchangeRecord`]s into per-machine
//! queues; an import loop per unit drains them, consolidates values into segments
//! and persists them; an analysis loop per machine then runs its time-budgeted
//! steps over the imported data.
//!
//! ## Crate Structure
//!
//! - **`queue`**: the queue bus. Named FIFO queues, in memory or persisted, grouped
//!   into a [`queue::MachineQueueSet`] per machine module.
//! - **`cache`**: consolidation caches turning successive samples into segments.
//! - **`import`**: the queue import loop and its per-kind importers.
//! - **`persistence`**: the [`persistence::Store`] abstraction and an in-memory store.
//! - **`supervisor`**: acquisition units (threads or child processes), their
//!   liveness and the watchdog restarting them.
//! - **`analysis`**: the per-machine analysis scheduler and its step graph.
//! - **`pipeline`**: wiring of the above into one runnable unit.
//! - **`config`**, **`logging`**, **`error`**: ambient infrastructure.

pub mod analysis;
pub mod cache;
pub mod config;
pub mod error;
pub mod import;
pub mod logging;
pub mod model;
pub mod notifier;
pub mod persistence;
pub mod pipeline;
pub mod platform;
pub mod queue;
pub mod supervisor;

pub use error::{AppResult, PipelineError};
