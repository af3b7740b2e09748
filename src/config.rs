//! Step inputs and their validation.
//!
//! Inputs arrive either from the command line (with environment fallbacks) or from a
//! TOML file. Nothing in here performs I/O: every check runs before the first network
//! call so a misaligned certificate/passphrase pairing can never reach the keychain.

use crate::credentials::ApiKeyOverrides;
use crate::error::{AutoCodesignError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Delimiter of the certificate URL and passphrase lists.
pub const LIST_SEPARATOR: &str = "|";

/// Intended deployment channel of a signed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionType {
    Development,
    AppStore,
    AdHoc,
    Enterprise,
}

/// Kind of signing certificate a distribution type needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateKind {
    Development,
    Distribution,
}

impl DistributionType {
    pub const ALL: [Self; 4] = [
        Self::Development,
        Self::AppStore,
        Self::AdHoc,
        Self::Enterprise,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::AppStore => "app-store",
            Self::AdHoc => "ad-hoc",
            Self::Enterprise => "enterprise",
        }
    }

    #[must_use]
    pub fn certificate_kind(&self) -> CertificateKind {
        match self {
            Self::Development => CertificateKind::Development,
            Self::AppStore | Self::AdHoc | Self::Enterprise => CertificateKind::Distribution,
        }
    }

    /// Profiles of this type embed a device list.
    #[must_use]
    pub fn has_devices(&self) -> bool {
        matches!(self, Self::Development | Self::AdHoc)
    }
}

impl fmt::Display for DistributionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributionType {
    type Err = AutoCodesignError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| {
                AutoCodesignError::Configuration(format!(
                    "unexpected distribution method '{s}' (expected one of: development, app-store, ad-hoc, enterprise)"
                ))
            })
    }
}

/// How the Developer Portal is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    ApiKey,
    AppleId,
}

impl FromStr for ConnectionType {
    type Err = AutoCodesignError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "api-key" => Ok(Self::ApiKey),
            "apple-id" => Ok(Self::AppleId),
            other => Err(AutoCodesignError::Configuration(format!(
                "unexpected value for Apple service connection '{other}' (expected api-key or apple-id)"
            ))),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey => f.write_str("api-key"),
            Self::AppleId => f.write_str("apple-id"),
        }
    }
}

/// Sensitive input value. Never printed and wiped from memory on drop.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A certificate archive locator and the passphrase it is encrypted with.
#[derive(Debug, Clone)]
pub struct CertificateAndPassphrase {
    pub url: String,
    pub passphrase: Secret,
}

/// Raw step configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub distribution_method: String,
    pub project_path: PathBuf,
    pub scheme: String,
    #[serde(default)]
    pub configuration: Option<String>,

    #[serde(default = "default_connection")]
    pub apple_service_connection: String,

    #[serde(default)]
    pub register_test_devices: bool,
    #[serde(default)]
    pub min_profile_validity: i64,
    #[serde(default)]
    pub sign_uitest_targets: bool,

    pub certificate_url_list: String,
    #[serde(default)]
    pub passphrase_list: Secret,
    pub keychain_path: PathBuf,
    #[serde(default)]
    pub keychain_password: Secret,

    #[serde(default)]
    pub build_url: Option<String>,
    #[serde(default)]
    pub build_api_token: Option<Secret>,

    #[serde(default)]
    pub api_key_path: Option<String>,
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub api_issuer: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,

    #[serde(default)]
    pub verbose_log: bool,
}

fn default_connection() -> String {
    "api-key".to_string()
}

/// Inputs after validation. Enumerations are parsed and certificate pairs aligned.
#[derive(Debug, Clone)]
pub struct ValidatedInputs {
    pub distribution: DistributionType,
    pub connection_type: ConnectionType,
    pub certificates: Vec<CertificateAndPassphrase>,
    pub min_profile_validity_days: u32,
    pub api_key_overrides: ApiKeyOverrides,
    pub team_id: Option<String>,
    pub register_test_devices: bool,
    pub sign_ui_test_targets: bool,
}

impl Config {
    pub fn distribution_type(&self) -> Result<DistributionType> {
        self.distribution_method.parse()
    }

    pub fn connection_type(&self) -> Result<ConnectionType> {
        self.apple_service_connection.parse()
    }

    /// Validates that the number of certificate URLs matches the number of passphrases.
    pub fn validate_certificates(&self) -> Result<(Vec<String>, Vec<String>)> {
        let urls = split_and_clean(&self.certificate_url_list, LIST_SEPARATOR, true);
        let passphrases = split_and_clean(self.passphrase_list.expose(), LIST_SEPARATOR, false);

        if urls.len() != passphrases.len() {
            return Err(AutoCodesignError::Configuration(format!(
                "certificates count ({}) and passphrases count ({}) should match",
                urls.len(),
                passphrases.len()
            )));
        }

        Ok((urls, passphrases))
    }

    /// Certificate URLs paired with their passphrases, in input order.
    pub fn certificates(&self) -> Result<Vec<CertificateAndPassphrase>> {
        let (urls, passphrases) = self.validate_certificates()?;

        Ok(urls
            .into_iter()
            .zip(passphrases)
            .map(|(url, passphrase)| CertificateAndPassphrase {
                url,
                passphrase: Secret::new(passphrase),
            })
            .collect())
    }

    /// Runs every input check and returns the parsed values.
    pub fn validate(&self) -> Result<ValidatedInputs> {
        let distribution = self.distribution_type()?;
        let connection_type = self.connection_type()?;

        if self.scheme.trim().is_empty() {
            return Err(AutoCodesignError::Configuration(
                "scheme is required".to_string(),
            ));
        }
        if self.keychain_path.as_os_str().is_empty() {
            return Err(AutoCodesignError::Configuration(
                "keychain path is required".to_string(),
            ));
        }
        if self.certificate_url_list.trim().is_empty() {
            return Err(AutoCodesignError::Configuration(
                "certificate URL list is required".to_string(),
            ));
        }

        let min_profile_validity_days = u32::try_from(self.min_profile_validity).map_err(|_| {
            AutoCodesignError::Configuration(format!(
                "minimum profile validity must be a non-negative number of days (got {})",
                self.min_profile_validity
            ))
        })?;

        let certificates = self.certificates()?;

        Ok(ValidatedInputs {
            distribution,
            connection_type,
            certificates,
            min_profile_validity_days,
            api_key_overrides: ApiKeyOverrides {
                key_path: self.api_key_path.clone(),
                key_id: self.api_key_id.clone(),
                issuer_id: self.api_issuer.clone(),
            },
            team_id: self.team_id.as_deref().map(str::trim).filter(|t| !t.is_empty()).map(str::to_string),
            register_test_devices: self.register_test_devices,
            sign_ui_test_targets: self.sign_uitest_targets,
        })
    }
}

/// Splits `list` on `sep` and trims every item; empty items are dropped when
/// `omit_empty` is set.
#[must_use]
pub fn split_and_clean(list: &str, sep: &str, omit_empty: bool) -> Vec<String> {
    list.split(sep)
        .map(str::trim)
        .filter(|item| !omit_empty || !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses the `yes`/`no` toggles of the step interface.
pub fn parse_toggle(value: &str) -> std::result::Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" | "" => Ok(false),
        other => Err(format!("expected yes or no, got '{other}'")),
    }
}
