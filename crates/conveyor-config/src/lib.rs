//! # Conveyor Config
//!
//! Layered configuration: TOML files, `.env`, then `CONVEYOR_`-prefixed
//! environment variables, with runtime reload.

mod app_config;
mod deployment;
mod loader;

pub use app_config::*;
pub use deployment::*;
pub use loader::*;
