//! Apple Developer Portal model and client seam.

pub mod client;
pub mod profile;

pub use client::{AppStoreConnectClient, AppStoreConnectFactory};
pub use profile::ProvisioningProfile;

use crate::config::{CertificateKind, DistributionType};
use crate::credentials::AuthCredentials;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;

/// Entitlement keys a target declares or a profile grants.
pub type Capabilities = BTreeSet<String>;

/// Portal capability type enabling an entitlement, if the entitlement needs one.
#[must_use]
pub fn capability_type(entitlement: &str) -> Option<&'static str> {
    let capability = match entitlement {
        "aps-environment" | "com.apple.developer.aps-environment" => "PUSH_NOTIFICATIONS",
        "com.apple.developer.associated-domains" => "ASSOCIATED_DOMAINS",
        "com.apple.security.application-groups" => "APP_GROUPS",
        "com.apple.developer.icloud-container-identifiers"
        | "com.apple.developer.icloud-services"
        | "com.apple.developer.ubiquity-kvstore-identifier"
        | "com.apple.developer.ubiquity-container-identifiers" => "ICLOUD",
        "com.apple.developer.in-app-payments" => "APPLE_PAY",
        "com.apple.developer.healthkit" | "com.apple.developer.healthkit.access" => "HEALTHKIT",
        "com.apple.developer.homekit" => "HOMEKIT",
        "com.apple.developer.networking.wifi-info" => "ACCESS_WIFI_INFORMATION",
        "com.apple.developer.applesignin" => "APPLE_ID_AUTH",
        "com.apple.developer.siri" => "SIRIKIT",
        "com.apple.developer.networking.networkextension" => "NETWORK_EXTENSIONS",
        "com.apple.developer.networking.vpn.api" => "PERSONAL_VPN",
        "com.apple.developer.nfc.readersession.formats" => "NFC_TAG_READING",
        "com.apple.developer.pass-type-identifiers" => "WALLET",
        "com.apple.developer.game-center" => "GAME_CENTER",
        "com.apple.developer.default-data-protection" => "DATA_PROTECTION",
        "com.apple.developer.usernotifications.time-sensitive" => "USERNOTIFICATIONS_TIMESENSITIVE",
        "com.apple.developer.usernotifications.communication" => "USERNOTIFICATIONS_COMMUNICATION",
        "com.apple.developer.weatherkit" => "WEATHERKIT",
        _ => return None,
    };
    Some(capability)
}

/// Entitlements of `declared` that a profile only grants once the matching
/// capability is enabled on the bundle ID. Other keys are signed as declared.
#[must_use]
pub fn required_capabilities(declared: &Capabilities) -> Capabilities {
    declared
        .iter()
        .filter(|key| capability_type(key).is_some())
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Ios,
    TvOs,
    MacOs,
}

impl Platform {
    /// Bundle ID and device platform value used by the portal.
    #[must_use]
    pub fn portal_name(&self) -> &'static str {
        match self {
            Self::Ios | Self::TvOs => "IOS",
            Self::MacOs => "MAC_OS",
        }
    }

    #[must_use]
    pub fn profile_type(&self, distribution: DistributionType) -> &'static str {
        match (self, distribution) {
            (Self::Ios, DistributionType::Development) => "IOS_APP_DEVELOPMENT",
            (Self::Ios, DistributionType::AppStore) => "IOS_APP_STORE",
            (Self::Ios, DistributionType::AdHoc) => "IOS_APP_ADHOC",
            (Self::Ios, DistributionType::Enterprise) => "IOS_APP_INHOUSE",
            (Self::TvOs, DistributionType::Development) => "TVOS_APP_DEVELOPMENT",
            (Self::TvOs, DistributionType::AppStore) => "TVOS_APP_STORE",
            (Self::TvOs, DistributionType::AdHoc) => "TVOS_APP_ADHOC",
            (Self::TvOs, DistributionType::Enterprise) => "TVOS_APP_INHOUSE",
            (Self::MacOs, DistributionType::Development) => "MAC_APP_DEVELOPMENT",
            (Self::MacOs, DistributionType::AppStore) => "MAC_APP_STORE",
            (Self::MacOs, DistributionType::AdHoc | DistributionType::Enterprise) => "MAC_APP_DIRECT",
        }
    }

    /// Whether a device of the given portal class can run this platform's builds.
    #[must_use]
    pub fn accepts_device_class(&self, device_class: &str) -> bool {
        match self {
            Self::Ios => matches!(device_class, "IPHONE" | "IPAD" | "IPOD" | "APPLE_WATCH" | "APPLE_VISION_PRO"),
            Self::TvOs => device_class == "APPLE_TV",
            Self::MacOs => device_class == "MAC",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ios => f.write_str("iOS"),
            Self::TvOs => f.write_str("tvOS"),
            Self::MacOs => f.write_str("macOS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalCertificate {
    pub id: String,
    pub serial: String,
    pub name: String,
    pub kind: Option<CertificateKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub udid: String,
    pub name: String,
    pub device_class: String,
    pub enabled: bool,
}

/// Canonical form of a device UDID for comparisons.
#[must_use]
pub fn normalize_udid(udid: &str) -> String {
    udid.trim().replace('-', "").to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleId {
    pub id: String,
    pub identifier: String,
    pub name: String,
    /// Capability types enabled on the portal.
    pub capabilities: BTreeSet<String>,
}

/// Parameters of a new provisioning profile.
#[derive(Debug, Clone)]
pub struct ProfileRequest<'a> {
    pub name: String,
    pub bundle_id: &'a BundleId,
    pub distribution: DistributionType,
    pub platform: Platform,
    pub certificate_id: &'a str,
    pub device_ids: Vec<String>,
}

/// Developer Portal operations the resolver depends on.
///
/// Implementations own transport-level retries; any error they return is final.
#[async_trait]
pub trait DevPortalClient: Send + Sync {
    async fn list_certificates(&self) -> Result<Vec<PortalCertificate>>;

    async fn list_devices(&self) -> Result<Vec<Device>>;

    async fn register_device(&self, name: &str, udid: &str, platform: Platform) -> Result<Device>;

    async fn find_bundle_id(&self, identifier: &str) -> Result<Option<BundleId>>;

    async fn create_bundle_id(&self, identifier: &str, name: &str, platform: Platform) -> Result<BundleId>;

    async fn enable_capability(&self, bundle_id: &BundleId, capability_type: &str) -> Result<()>;

    /// Active profiles of `bundle_id` for the given distribution type.
    async fn list_profiles(
        &self,
        bundle_id: &BundleId,
        distribution: DistributionType,
        platform: Platform,
    ) -> Result<Vec<ProvisioningProfile>>;

    async fn create_profile(&self, request: &ProfileRequest<'_>) -> Result<ProvisioningProfile>;

    async fn delete_profile(&self, profile_id: &str) -> Result<()>;
}

/// Builds a portal client once credentials are selected.
pub trait PortalClientFactory: Send + Sync {
    fn create(&self, credentials: AuthCredentials, team_id: Option<&str>) -> Result<Box<dyn DevPortalClient>>;
}
