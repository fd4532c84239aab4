//! Verdict server: multiplexes many analysis-result products behind one
//! RPC endpoint and runs a durable background-task engine on top of the
//! shared configuration store.
//!
//! Component map:
//! - [`dispatcher`] — path/product/identity resolution per call
//! - [`auth`] — sessions, accounts, permission evaluation
//! - [`registry`] — product mount table and result-store pools
//! - [`task_manager`] — allocation, data dirs, enqueue, admin ops
//! - [`reaper`] — heartbeat demotion and housekeeping sweeps
//! - [`workers`] — worker process pool supervision

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod metrics;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod task_manager;
pub mod workers;

pub use config::ServerConfig;
pub use server::{Server, ServerState};
