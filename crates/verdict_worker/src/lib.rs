//! Verdict worker: claims task payloads from the durable queue and runs
//! them to a terminal status.
//!
//! Workers are independent OS processes supervised by the server; this
//! crate is also a library so the execution loop can be driven in-process
//! by integration tests.

pub mod cancel;
pub mod context;
pub mod kinds;
pub mod worker;

pub use cancel::DrainToken;
pub use context::{TaskContext, TaskError, TaskResult};
pub use worker::{Worker, WorkerConfig};
