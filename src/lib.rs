//! Automatic code signing asset resolution for iOS, tvOS and macOS builds
//!
//! Given a distribution method, certificate archives and an Apple Developer Portal
//! connection, a run decides which certificates and provisioning profiles are
//! authoritative, creates the missing ones, points the Xcode project at them and
//! exports the resulting signing identity.

pub mod autocodesign;
pub mod certificate;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod keychain;
pub mod log;
pub mod outputs;
pub mod portal;
pub mod project;
pub mod retry;
pub mod step;

// Re-export common types
pub use autocodesign::{CodesignAssetManager, CodesignAssets, CodesignAssetsByDistributionType, CodesignAssetsOpts};
pub use config::{Config, DistributionType, ValidatedInputs};
pub use error::{AutoCodesignError, Result};
pub use log::Logger;
pub use step::{Collaborators, run};
