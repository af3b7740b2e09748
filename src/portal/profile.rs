//! Provisioning profiles and the checks that decide whether one can be reused

use super::{Capabilities, normalize_udid};
use crate::certificate::serial_hex;
use crate::config::DistributionType;
use crate::error::{AutoCodesignError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::time::SystemTime;
use x509_certificate::X509Certificate;

#[derive(Clone)]
pub struct ProvisioningProfile {
    /// Portal resource ID.
    pub id: String,
    pub uuid: String,
    pub name: String,
    pub bundle_identifier: String,
    pub distribution: DistributionType,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Normalized UDIDs of the provisioned devices.
    pub devices: BTreeSet<String>,
    /// Serial numbers of the trusted certificates.
    pub certificate_serials: BTreeSet<String>,
    /// Entitlement keys granted by the profile.
    pub capabilities: Capabilities,
    /// Raw `.mobileprovision` content.
    pub content: Vec<u8>,
}

impl std::fmt::Debug for ProvisioningProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningProfile")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("bundle_identifier", &self.bundle_identifier)
            .field("distribution", &self.distribution)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Why an existing profile cannot be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileMismatch {
    MissingCertificate(String),
    MissingCapabilities(Vec<String>),
    MissingDevices(usize),
    ExpiresTooSoon(DateTime<Utc>),
}

impl std::fmt::Display for ProfileMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCertificate(serial) => write!(f, "does not contain certificate {serial}"),
            Self::MissingCapabilities(keys) => write!(f, "is missing entitlements: {}", keys.join(", ")),
            Self::MissingDevices(count) => write!(f, "is missing {count} registered device(s)"),
            Self::ExpiresTooSoon(at) => write!(f, "expires too soon ({})", at.format("%Y-%m-%d")),
        }
    }
}

/// Requirements a reusable profile has to meet.
#[derive(Debug, Clone)]
pub struct ProfileRequirements<'a> {
    pub certificate_serial: &'a str,
    pub capabilities: &'a Capabilities,
    /// Normalized UDIDs that must be provisioned; empty when devices are not checked.
    pub devices: &'a BTreeSet<String>,
    pub valid_until: DateTime<Utc>,
}

impl<'a> ProfileRequirements<'a> {
    #[must_use]
    pub fn new(
        certificate_serial: &'a str,
        capabilities: &'a Capabilities,
        devices: &'a BTreeSet<String>,
        now: DateTime<Utc>,
        min_validity_days: u32,
    ) -> Self {
        Self {
            certificate_serial,
            capabilities,
            devices,
            valid_until: now + Duration::days(i64::from(min_validity_days)),
        }
    }
}

impl ProvisioningProfile {
    /// Parses the property list embedded in a CMS signed `.mobileprovision`.
    pub fn from_content(
        id: impl Into<String>,
        bundle_identifier: impl Into<String>,
        distribution: DistributionType,
        content: Vec<u8>,
    ) -> Result<Self> {
        let plist = embedded_plist(&content)?;
        let dict = plist::Value::from_reader_xml(plist)
            .map_err(|e| AutoCodesignError::PortalOperation(format!("invalid profile plist: {e}")))?
            .into_dictionary()
            .ok_or_else(|| AutoCodesignError::PortalOperation("profile plist is not a dictionary".to_string()))?;

        let string = |key: &str| dict.get(key).and_then(plist::Value::as_string).map(str::to_string);
        let date = |key: &str| {
            dict.get(key)
                .and_then(plist::Value::as_date)
                .map(|d| DateTime::<Utc>::from(SystemTime::from(d)))
                .ok_or_else(|| AutoCodesignError::PortalOperation(format!("profile has no {key}")))
        };

        let uuid = string("UUID")
            .ok_or_else(|| AutoCodesignError::PortalOperation("profile has no UUID".to_string()))?;

        let devices = dict
            .get("ProvisionedDevices")
            .and_then(plist::Value::as_array)
            .map(|udids| udids.iter().filter_map(plist::Value::as_string).map(normalize_udid).collect())
            .unwrap_or_default();

        let certificate_serials = dict
            .get("DeveloperCertificates")
            .and_then(plist::Value::as_array)
            .map(|certs| {
                certs
                    .iter()
                    .filter_map(plist::Value::as_data)
                    .filter_map(|der| X509Certificate::from_der(der).ok())
                    .map(|cert| serial_hex(cert.serial_number_asn1().as_slice()))
                    .collect()
            })
            .unwrap_or_default();

        let capabilities = dict
            .get("Entitlements")
            .and_then(plist::Value::as_dictionary)
            .map(|entitlements| entitlements.keys().cloned().collect())
            .unwrap_or_default();

        Ok(Self {
            id: id.into(),
            name: string("Name").unwrap_or_default(),
            uuid,
            bundle_identifier: bundle_identifier.into(),
            distribution,
            created_at: date("CreationDate")?,
            expires_at: date("ExpirationDate")?,
            devices,
            certificate_serials,
            capabilities,
            content,
        })
    }

    /// Checks every reuse condition, reporting the first one that fails.
    pub fn check(&self, requirements: &ProfileRequirements<'_>) -> std::result::Result<(), ProfileMismatch> {
        if !self.certificate_serials.contains(requirements.certificate_serial) {
            return Err(ProfileMismatch::MissingCertificate(
                requirements.certificate_serial.to_string(),
            ));
        }

        let missing: Vec<String> = requirements
            .capabilities
            .difference(&self.capabilities)
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ProfileMismatch::MissingCapabilities(missing));
        }

        let missing_devices = requirements.devices.difference(&self.devices).count();
        if missing_devices > 0 {
            return Err(ProfileMismatch::MissingDevices(missing_devices));
        }

        if self.expires_at < requirements.valid_until {
            return Err(ProfileMismatch::ExpiresTooSoon(self.expires_at));
        }

        Ok(())
    }
}

/// Picks the profile to reuse among several valid ones: the most recently created,
/// then the greatest UUID so the choice never depends on portal ordering.
#[must_use]
pub fn pick_latest(profiles: Vec<ProvisioningProfile>) -> Option<ProvisioningProfile> {
    profiles
        .into_iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uuid.cmp(&b.uuid)))
}

/// Slice of `data` holding the XML property list of a CMS envelope.
fn embedded_plist(data: &[u8]) -> Result<&[u8]> {
    let start = data
        .windows(5)
        .position(|w| w == b"<?xml")
        .ok_or_else(|| AutoCodesignError::PortalOperation("no plist found in profile".to_string()))?;
    let end = data[start..]
        .windows(8)
        .position(|w| w == b"</plist>")
        .map(|p| start + p + 8)
        .ok_or_else(|| AutoCodesignError::PortalOperation("truncated plist in profile".to_string()))?;
    Ok(&data[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn profile(uuid: &str, created_day: u32, expires_in_days: i64) -> ProvisioningProfile {
        let now = Utc::now();
        ProvisioningProfile {
            id: format!("id-{uuid}"),
            uuid: uuid.to_string(),
            name: "Bitrise iOS development - (com.example.app)".to_string(),
            bundle_identifier: "com.example.app".to_string(),
            distribution: DistributionType::Development,
            created_at: Utc.with_ymd_and_hms(2026, 1, created_day, 0, 0, 0).unwrap(),
            expires_at: now + Duration::days(expires_in_days),
            devices: ["aaaa".to_string()].into_iter().collect(),
            certificate_serials: ["0A1B".to_string()].into_iter().collect(),
            capabilities: ["aps-environment".to_string()].into_iter().collect(),
            content: Vec::new(),
        }
    }

    #[test]
    fn profile_meeting_every_condition_is_reusable() {
        let caps: Capabilities = ["aps-environment".to_string()].into_iter().collect();
        let devices: BTreeSet<String> = ["aaaa".to_string()].into_iter().collect();
        let req = ProfileRequirements::new("0A1B", &caps, &devices, Utc::now(), 30);
        assert_eq!(profile("u1", 1, 90).check(&req), Ok(()));
    }

    #[test]
    fn each_condition_is_enforced() {
        let caps: Capabilities = ["aps-environment".to_string(), "com.apple.developer.associated-domains".to_string()]
            .into_iter()
            .collect();
        let none = Capabilities::new();
        let devices: BTreeSet<String> = ["aaaa".to_string(), "bbbb".to_string()].into_iter().collect();
        let no_devices = BTreeSet::new();
        let now = Utc::now();
        let p = profile("u1", 1, 90);

        assert!(matches!(
            p.check(&ProfileRequirements::new("FFFF", &none, &no_devices, now, 0)),
            Err(ProfileMismatch::MissingCertificate(_))
        ));
        assert!(matches!(
            p.check(&ProfileRequirements::new("0A1B", &caps, &no_devices, now, 0)),
            Err(ProfileMismatch::MissingCapabilities(_))
        ));
        assert_eq!(
            p.check(&ProfileRequirements::new("0A1B", &none, &devices, now, 0)),
            Err(ProfileMismatch::MissingDevices(1))
        );
    }

    #[test]
    fn profile_expiring_within_minimum_validity_is_rejected() {
        let none = Capabilities::new();
        let no_devices = BTreeSet::new();
        let p = profile("u1", 1, 10);
        let req = ProfileRequirements::new("0A1B", &none, &no_devices, Utc::now(), 30);
        assert!(matches!(p.check(&req), Err(ProfileMismatch::ExpiresTooSoon(_))));
        let req = ProfileRequirements::new("0A1B", &none, &no_devices, Utc::now(), 5);
        assert_eq!(p.check(&req), Ok(()));
    }

    #[test]
    fn latest_created_profile_wins_ties() {
        let picked = pick_latest(vec![profile("b", 1, 90), profile("a", 3, 90), profile("c", 2, 90)]).unwrap();
        assert_eq!(picked.uuid, "a");

        let picked = pick_latest(vec![profile("a", 1, 90), profile("b", 1, 90)]).unwrap();
        assert_eq!(picked.uuid, "b");
    }

    #[test]
    fn parses_mobileprovision_payload() {
        let mut entitlements = plist::Dictionary::new();
        entitlements.insert("aps-environment".to_string(), plist::Value::String("development".to_string()));
        entitlements.insert("get-task-allow".to_string(), plist::Value::Boolean(true));

        let created = SystemTime::from(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let expires = SystemTime::from(Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());

        let mut dict = plist::Dictionary::new();
        dict.insert("UUID".to_string(), plist::Value::String("1234-ABCD".to_string()));
        dict.insert("Name".to_string(), plist::Value::String("Bitrise iOS development - (com.example.app)".to_string()));
        dict.insert("CreationDate".to_string(), plist::Value::Date(created.into()));
        dict.insert("ExpirationDate".to_string(), plist::Value::Date(expires.into()));
        dict.insert("Entitlements".to_string(), plist::Value::Dictionary(entitlements));
        dict.insert(
            "ProvisionedDevices".to_string(),
            plist::Value::Array(vec![plist::Value::String("00008030-001A2B3C4D5E6F7A".to_string())]),
        );

        let mut xml = Vec::new();
        plist::Value::Dictionary(dict).to_writer_xml(&mut xml).unwrap();
        let mut content = vec![0x30, 0x80, 0x06, 0x09];
        content.extend_from_slice(&xml);
        content.extend_from_slice(&[0x00, 0x00, 0xa0]);

        let profile = ProvisioningProfile::from_content(
            "P1",
            "com.example.app",
            DistributionType::Development,
            content,
        )
        .unwrap();
        assert_eq!(profile.uuid, "1234-ABCD");
        assert_eq!(profile.expires_at, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
        assert!(profile.capabilities.contains("aps-environment"));
        assert!(profile.devices.contains("00008030001a2b3c4d5e6f7a"));
        assert!(profile.certificate_serials.is_empty());
    }

    #[test]
    fn content_without_plist_is_rejected() {
        assert!(ProvisioningProfile::from_content("P1", "x", DistributionType::AppStore, b"junk".to_vec()).is_err());
    }
}
