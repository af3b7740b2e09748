//! Signing certificates: metadata, download and per-distribution selection.

pub mod download;
pub mod reconcile;

pub use download::{CertificateDownloader, HttpCertificateDownloader};
pub use reconcile::{CertificateReconciler, CertificateResolution, select_certificates};

use crate::config::{CertificateKind, DistributionType, Secret};
use crate::error::{AutoCodesignError, Result};
use chrono::{DateTime, Utc};
use x509_certificate::X509Certificate;

/// Common name prefixes of Apple development certificates.
const DEVELOPMENT_PREFIXES: &[&str] = &["Apple Development", "iPhone Developer", "Mac Developer"];

/// Common name prefixes of Apple distribution certificates.
const DISTRIBUTION_PREFIXES: &[&str] = &[
    "Apple Distribution",
    "iPhone Distribution",
    "3rd Party Mac Developer Application",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CertificateSource {
    /// Already installed on the build machine.
    Local,
    /// Downloaded from the configured certificate URLs.
    Remote,
}

/// PKCS#12 archive a remote certificate was decoded from, kept for keychain import.
#[derive(Clone)]
pub struct Pkcs12Payload {
    pub data: Vec<u8>,
    pub passphrase: Secret,
}

#[derive(Clone)]
pub struct CertificateInfo {
    /// Upper-case hex serial number without leading zeros.
    pub serial: String,
    pub common_name: String,
    pub team_id: String,
    pub team_name: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub kind: CertificateKind,
    pub source: CertificateSource,
    pub der: Vec<u8>,
    pub pkcs12: Option<Pkcs12Payload>,
    /// Developer Portal resource ID, once the certificate is matched to the portal.
    pub portal_id: Option<String>,
}

impl std::fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("serial", &self.serial)
            .field("common_name", &self.common_name)
            .field("team_id", &self.team_id)
            .field("not_after", &self.not_after)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for CertificateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] (expires {})",
            self.common_name,
            self.serial,
            self.not_after.format("%Y-%m-%d")
        )
    }
}

impl CertificateInfo {
    /// Parses a DER encoded Apple code signing certificate.
    pub fn from_der(der: &[u8], source: CertificateSource) -> Result<Self> {
        let certificate = X509Certificate::from_der(der)
            .map_err(|e| AutoCodesignError::Certificate(format!("failed to parse certificate DER: {e}")))?;
        Self::from_x509(&certificate, der.to_vec(), source)
    }

    /// Decodes a PKCS#12 archive and parses its leaf certificate.
    ///
    /// The archive must also carry the private key, otherwise the certificate
    /// cannot sign anything.
    pub fn from_pkcs12(data: &[u8], passphrase: &Secret) -> Result<Self> {
        let pfx = p12::PFX::parse(data)
            .map_err(|e| AutoCodesignError::Certificate(format!("failed to parse PKCS#12: {e:?}")))?;

        let certs = pfx.cert_x509_bags(passphrase.expose()).map_err(|e| {
            AutoCodesignError::Certificate(format!("failed to extract certificates from PKCS#12: {e:?}"))
        })?;
        let keys = pfx.key_bags(passphrase.expose()).map_err(|e| {
            AutoCodesignError::Certificate(format!("failed to extract keys from PKCS#12: {e:?}"))
        })?;

        let Some(cert_der) = certs.first() else {
            return Err(AutoCodesignError::Certificate("no certificate in PKCS#12".to_string()));
        };
        if keys.is_empty() {
            return Err(AutoCodesignError::Certificate("no private key in PKCS#12".to_string()));
        }

        let mut info = Self::from_der(cert_der, CertificateSource::Remote)?;
        info.pkcs12 = Some(Pkcs12Payload {
            data: data.to_vec(),
            passphrase: passphrase.clone(),
        });
        Ok(info)
    }

    /// Parses every Apple code signing certificate of a PEM bundle, skipping the
    /// ones that are not development or distribution certificates.
    pub fn from_pem_bundle(pem: &[u8], source: CertificateSource) -> Result<Vec<Self>> {
        let certificates = X509Certificate::from_pem_multiple(pem)
            .map_err(|e| AutoCodesignError::Certificate(format!("failed to parse PEM: {e}")))?;

        let mut infos = Vec::new();
        for certificate in certificates {
            let der = certificate.encode_der()?;
            if let Ok(info) = Self::from_x509(&certificate, der, source) {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    fn from_x509(certificate: &X509Certificate, der: Vec<u8>, source: CertificateSource) -> Result<Self> {
        let common_name = certificate
            .subject_common_name()
            .ok_or_else(|| AutoCodesignError::Certificate("certificate has no common name".to_string()))?;
        let kind = certificate_kind(&common_name).ok_or_else(|| {
            AutoCodesignError::Certificate(format!("'{common_name}' is not an Apple code signing certificate"))
        })?;

        let subject = certificate.subject_name();
        let team_id = subject
            .iter_organizational_unit()
            .find_map(|atav| atav.to_string().ok())
            .unwrap_or_default();
        let team_name = subject
            .iter_organization()
            .find_map(|atav| atav.to_string().ok())
            .unwrap_or_default();

        Ok(Self {
            serial: serial_hex(certificate.serial_number_asn1().as_slice()),
            common_name,
            team_id,
            team_name,
            not_before: certificate.validity_not_before(),
            not_after: certificate.validity_not_after(),
            kind,
            source,
            der,
            pkcs12: None,
            portal_id: None,
        })
    }

    /// Validity window covers `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    #[must_use]
    pub fn is_eligible_for(&self, distribution: DistributionType) -> bool {
        self.kind == distribution.certificate_kind()
    }
}

/// Development or distribution, derived from the common name prefix.
#[must_use]
pub fn certificate_kind(common_name: &str) -> Option<CertificateKind> {
    if DEVELOPMENT_PREFIXES.iter().any(|p| common_name.starts_with(p)) {
        Some(CertificateKind::Development)
    } else if DISTRIBUTION_PREFIXES.iter().any(|p| common_name.starts_with(p)) {
        Some(CertificateKind::Distribution)
    } else {
        None
    }
}

/// Hex serial number of DER serial bytes, in [`normalize_serial`] form.
#[must_use]
pub fn serial_hex(bytes: &[u8]) -> String {
    normalize_serial(&hex::encode_upper(bytes))
}

/// Upper-case hex without leading zeros, so `0A1B`, `00a1b` and `a1b` compare equal.
#[must_use]
pub fn normalize_serial(serial: &str) -> String {
    let trimmed = serial.trim().trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_ascii_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_common_name() {
        assert_eq!(
            certificate_kind("Apple Development: Jane Doe (ABCDE12345)"),
            Some(CertificateKind::Development)
        );
        assert_eq!(
            certificate_kind("iPhone Distribution: Acme Inc (TEAM123456)"),
            Some(CertificateKind::Distribution)
        );
        assert_eq!(certificate_kind("Developer ID Application: Acme"), None);
    }

    #[test]
    fn serial_drops_leading_zeros() {
        assert_eq!(serial_hex(&[0x00, 0x6a, 0x0c]), "6A0C");
        assert_eq!(serial_hex(&[0x0a, 0x1b]), "A1B");
        assert_eq!(serial_hex(&[0x00]), "0");
    }

    #[test]
    fn portal_and_certificate_serials_agree() {
        assert_eq!(normalize_serial("0A1B"), normalize_serial("a1b"));
        assert_eq!(normalize_serial("a1b"), serial_hex(&[0x0a, 0x1b]));
        assert_eq!(normalize_serial("000"), "0");
    }

    #[test]
    fn invalid_archives_are_rejected() {
        let result = CertificateInfo::from_pkcs12(b"not a p12", &Secret::new("pw"));
        assert!(matches!(result, Err(AutoCodesignError::Certificate(_))));
        assert!(CertificateInfo::from_der(b"junk", CertificateSource::Local).is_err());
    }
}
