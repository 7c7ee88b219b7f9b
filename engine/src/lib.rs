//! Core of the Atelier workflow engine.
//!
//! Users author a graph of jobs with declared resource needs, wire them with
//! child and follow-on edges, and pass values forward through promises. The
//! engine validates the graph, freezes it into a durable job store, and on
//! each worker provides the per-job file store (plain or cache-backed) that
//! moves content in and out of that store and publishes the job's effects
//! atomically.
//!
//! The leader that schedules wrappers onto workers and the concrete job
//! store backends are external; see the `JobStore` trait for the contract
//! they meet.
//!

pub use cache::*;
pub use config::*;
pub use error::*;
pub use filestore::*;
pub use job::*;
pub use modref::*;
pub use promise::*;
pub use resources::*;
pub use serialize::*;
pub use service::*;
pub use store::*;
pub use worker::*;
pub use wrapper::*;

mod cache;
mod config;
mod error;
mod filestore;
mod job;
mod modref;
pub mod promise;
mod resources;
pub mod serialize;
mod service;
mod store;
mod worker;
mod wrapper;

/// Return crate name and version.
///
pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
