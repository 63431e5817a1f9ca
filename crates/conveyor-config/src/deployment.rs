//! Deployment role configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which parts of the system this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentRole {
    /// HTTP API and worker pool in a single process.
    #[default]
    All,
    /// HTTP API only: enqueue and status.
    Api,
    /// Worker pool only.
    Worker,
}

impl DeploymentRole {
    /// Returns true if this role serves the HTTP API.
    #[must_use]
    pub const fn has_api(&self) -> bool {
        matches!(self, Self::All | Self::Api)
    }

    /// Returns true if this role runs workers.
    #[must_use]
    pub const fn has_workers(&self) -> bool {
        matches!(self, Self::All | Self::Worker)
    }
}

impl fmt::Display for DeploymentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Api => write!(f, "api"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploymentConfig {
    /// Role of this process.
    #[serde(default)]
    pub role: DeploymentRole,
}
