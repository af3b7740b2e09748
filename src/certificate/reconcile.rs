//! Choosing one authoritative certificate per distribution type

use super::{CertificateDownloader, CertificateInfo, CertificateSource, normalize_serial};
use crate::config::DistributionType;
use crate::error::{AutoCodesignError, Result};
use crate::keychain::AssetWriter;
use crate::log::Logger;
use crate::portal::DevPortalClient;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Outcome per requested distribution type. A type is never silently missing.
pub type CertificateResolution = BTreeMap<DistributionType, Result<CertificateInfo>>;

/// Picks the authoritative certificate for each requested type.
///
/// Remote certificates take precedence over local ones. Within a source the
/// certificate expiring last wins, then the greater serial number.
#[must_use]
pub fn select_certificates(
    requested: &[DistributionType],
    remote: &[CertificateInfo],
    local: &[CertificateInfo],
    now: DateTime<Utc>,
) -> CertificateResolution {
    requested
        .iter()
        .map(|&distribution| {
            let chosen = best_match(remote, distribution, now)
                .or_else(|| best_match(local, distribution, now))
                .cloned()
                .ok_or_else(|| {
                    AutoCodesignError::unresolved(
                        distribution,
                        format!(
                            "no valid {:?} certificate among {} remote and {} local certificate(s)",
                            distribution.certificate_kind(),
                            remote.len(),
                            local.len()
                        ),
                    )
                });
            (distribution, chosen)
        })
        .collect()
}

fn best_match(
    certificates: &[CertificateInfo],
    distribution: DistributionType,
    now: DateTime<Utc>,
) -> Option<&CertificateInfo> {
    certificates
        .iter()
        .filter(|c| c.is_eligible_for(distribution) && c.is_valid_at(now))
        .max_by(|a, b| {
            a.not_after
                .cmp(&b.not_after)
                .then_with(|| a.serial.len().cmp(&b.serial.len()))
                .then_with(|| a.serial.cmp(&b.serial))
        })
}

/// Merges downloaded and installed certificates against the portal inventory
/// and installs the remote ones it selects.
pub struct CertificateReconciler<'a> {
    downloader: &'a dyn CertificateDownloader,
    portal: &'a dyn DevPortalClient,
    writer: &'a dyn AssetWriter,
    logger: Logger,
}

impl<'a> CertificateReconciler<'a> {
    pub fn new(
        downloader: &'a dyn CertificateDownloader,
        portal: &'a dyn DevPortalClient,
        writer: &'a dyn AssetWriter,
        logger: Logger,
    ) -> Self {
        Self {
            downloader,
            portal,
            writer,
            logger,
        }
    }

    pub async fn reconcile(
        &self,
        requested: &[DistributionType],
        local: Vec<CertificateInfo>,
    ) -> Result<CertificateResolution> {
        self.logger.section("Certificates");

        let remote = self.downloader.get_certificates().await?;
        self.logger.info(format!(
            "{} remote and {} local certificate(s) found",
            remote.len(),
            local.len()
        ));

        let registered: HashMap<String, String> = self
            .portal
            .list_certificates()
            .await?
            .into_iter()
            .map(|c| (normalize_serial(&c.serial), c.id))
            .collect();

        let remote = registered_only(remote, &registered, &self.logger);
        let local = registered_only(local, &registered, &self.logger);

        let resolution = select_certificates(requested, &remote, &local, Utc::now());

        let mut installed = BTreeSet::new();
        for (distribution, outcome) in &resolution {
            match outcome {
                Ok(certificate) => {
                    self.logger.done(format!("{distribution}: {certificate}"));
                    if certificate.source == CertificateSource::Remote
                        && installed.insert(certificate.serial.clone())
                    {
                        self.writer.install_certificate(certificate).await?;
                    }
                }
                Err(e) => self.logger.warn(format!("{distribution}: {e}")),
            }
        }

        Ok(resolution)
    }
}

/// Keeps the certificates the portal knows about and attaches their portal IDs.
///
/// `registered` maps [`normalize_serial`] serials to portal IDs.
fn registered_only(
    certificates: Vec<CertificateInfo>,
    registered: &HashMap<String, String>,
    logger: &Logger,
) -> Vec<CertificateInfo> {
    certificates
        .into_iter()
        .filter_map(|mut certificate| match registered.get(&normalize_serial(&certificate.serial)) {
            Some(id) => {
                certificate.portal_id = Some(id.clone());
                Some(certificate)
            }
            None => {
                logger.warn(format!(
                    "Certificate {certificate} is not registered on the Developer Portal, ignoring it"
                ));
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertificateKind;
    use chrono::Duration;

    fn cert(serial: &str, kind: CertificateKind, source: CertificateSource, expires_in_days: i64) -> CertificateInfo {
        let now = Utc::now();
        CertificateInfo {
            serial: serial.to_string(),
            common_name: format!("{kind:?} {serial}"),
            team_id: "TEAM123456".to_string(),
            team_name: "Acme".to_string(),
            not_before: now - Duration::days(30),
            not_after: now + Duration::days(expires_in_days),
            kind,
            source,
            der: Vec::new(),
            pkcs12: None,
            portal_id: None,
        }
    }

    #[test]
    fn remote_wins_over_local() {
        let remote = vec![cert("0A", CertificateKind::Development, CertificateSource::Remote, 10)];
        let local = vec![cert("0B", CertificateKind::Development, CertificateSource::Local, 300)];

        let resolution = select_certificates(&[DistributionType::Development], &remote, &local, Utc::now());
        assert_eq!(resolution[&DistributionType::Development].as_ref().unwrap().serial, "0A");
    }

    #[test]
    fn later_expiry_then_greater_serial_wins() {
        let remote = vec![
            cert("01", CertificateKind::Distribution, CertificateSource::Remote, 100),
            cert("03", CertificateKind::Distribution, CertificateSource::Remote, 200),
            cert("02", CertificateKind::Distribution, CertificateSource::Remote, 200),
        ];

        let resolution = select_certificates(&[DistributionType::AppStore], &remote, &[], Utc::now());
        assert_eq!(resolution[&DistributionType::AppStore].as_ref().unwrap().serial, "03");
    }

    #[test]
    fn expired_and_ineligible_certificates_leave_type_unresolved() {
        let remote = vec![
            cert("01", CertificateKind::Distribution, CertificateSource::Remote, -1),
            cert("02", CertificateKind::Development, CertificateSource::Remote, 100),
        ];

        let resolution = select_certificates(
            &[DistributionType::AdHoc, DistributionType::Development],
            &remote,
            &[],
            Utc::now(),
        );
        assert!(matches!(
            resolution[&DistributionType::AdHoc],
            Err(AutoCodesignError::AssetResolution {
                distribution: DistributionType::AdHoc,
                ..
            })
        ));
        assert!(resolution[&DistributionType::Development].is_ok());
    }

    #[test]
    fn local_fallback_when_no_remote_matches() {
        let local = vec![cert("0C", CertificateKind::Distribution, CertificateSource::Local, 50)];
        let resolution = select_certificates(&[DistributionType::Enterprise], &[], &local, Utc::now());
        let chosen = resolution[&DistributionType::Enterprise].as_ref().unwrap();
        assert_eq!(chosen.source, CertificateSource::Local);
    }

    #[test]
    fn portal_serials_match_regardless_of_padding_and_case() {
        let registered = HashMap::from([(normalize_serial("a1b"), "C1".to_string())]);
        let certificates = vec![
            cert("0A1B", CertificateKind::Development, CertificateSource::Remote, 100),
            cert("0C", CertificateKind::Development, CertificateSource::Remote, 100),
        ];

        let kept = registered_only(certificates, &registered, &Logger::default());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].serial, "0A1B");
        assert_eq!(kept[0].portal_id.as_deref(), Some("C1"));
    }
}
