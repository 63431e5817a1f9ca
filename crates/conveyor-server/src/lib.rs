//! # Conveyor Server Library
//!
//! Wires configuration, broker, registry, worker pool and HTTP router into
//! a runnable application for the configured deployment role.

pub mod app;
pub mod startup;

pub use app::Application;
