//! Shared vocabulary for the Dragnet reconnaissance engine.
//!
//! Everything that crosses a crate boundary lives here: job and worker
//! status enums, job type enums, scan options, and the canonical defaults
//! (intervals, port sets, batch sizes). No I/O.

pub mod config;
pub mod defaults;
pub mod types;

pub use types::{
    AncillaryJobType, JobStatus, PrimaryJobType, ProtocolError, ScanOptions, WorkerStatus,
};
