//! Error types for automatic code signing asset resolution.
//!
//! Every stage of the pipeline fails with exactly one of the stage variants below.
//! All of them are terminal for the run.

use crate::config::DistributionType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutoCodesignError>;

#[derive(Debug, Error)]
pub enum AutoCodesignError {
    /// Malformed or inconsistent input, detected before any I/O.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// No usable authentication path to the Developer Portal.
    #[error("Developer Portal credentials: {0}")]
    Credential(String),

    /// A Developer Portal call failed after transport-level retries.
    #[error("Developer Portal operation failed: {0}")]
    PortalOperation(String),

    /// No authoritative certificate or profile for a requested distribution type.
    #[error("Asset resolution failed for {distribution}: {reason}")]
    AssetResolution {
        distribution: DistributionType,
        reason: String,
    },

    /// Resolved assets could not be mapped to the output contract.
    #[error("Output projection failed: {0}")]
    OutputProjection(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Keychain operation failed: {0}")]
    KeychainOperation(String),

    #[error("Project analysis failed: {0}")]
    Project(String),

    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AutoCodesignError {
    pub fn unresolved(distribution: DistributionType, reason: impl Into<String>) -> Self {
        Self::AssetResolution {
            distribution,
            reason: reason.into(),
        }
    }

    /// Pipeline stage that produced the error, used for the final diagnostic line.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "input validation",
            Self::Credential(_) => "credential selection",
            Self::Certificate(_) | Self::KeychainOperation(_) => "certificate reconciliation",
            Self::PortalOperation(_) | Self::AssetResolution { .. } => "asset resolution",
            Self::OutputProjection(_) => "output projection",
            Self::Project(_) | Self::CommandExecution(_) => "project analysis",
            Self::Io(_) | Self::Json(_) | Self::Http(_) => "I/O",
        }
    }
}
