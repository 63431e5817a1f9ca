//! # Conveyor REST
//!
//! HTTP surface over the job subsystem: enqueue, status polling, kind
//! listing and health checks.

pub mod controllers;
pub mod extractors;
pub mod middleware;
pub mod responses;
pub mod router;
pub mod state;

pub use router::*;
pub use state::*;
