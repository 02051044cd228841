//! Dragnet worker: leases jobs from the store, runs the masscan discovery
//! pipeline and the post-discovery analyzers.
//!
//! One worker process is a small cooperative scheduler: a heartbeat task,
//! a dispatcher task that leases work every second, and up to
//! `max_concurrent` handler tasks. All coordination with other workers
//! happens through the durable store.

pub mod banner_analyzer;
pub mod banner_grabber;
pub mod domain_enum;
pub mod geolocation;
pub mod handlers;
pub mod masscan;
pub mod metrics;
pub mod runtime;
pub mod shutdown;
pub mod ssl_cert;
pub mod tls;

pub use runtime::{Worker, WorkerConfig};
pub use shutdown::ShutdownSignal;
