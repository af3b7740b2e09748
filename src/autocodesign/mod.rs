//! Ensures the certificates, devices and provisioning profiles a build needs.
//!
//! The flow for one run:
//! 1. Reconcile certificates for every requested distribution type.
//! 2. Register test devices when a device-bearing type is requested.
//! 3. Prepare bundle IDs, then settle each (bundle ID, type) pair concurrently.
//! 4. Install the resulting profiles.

pub mod devices;
pub mod profiles;

pub use devices::ensure_test_devices;
pub use profiles::{bundle_id_name, profile_name};

use crate::certificate::{CertificateDownloader, CertificateInfo, CertificateReconciler};
use crate::config::DistributionType;
use crate::connection::TestDevice;
use crate::error::{AutoCodesignError, Result};
use crate::keychain::AssetWriter;
use crate::log::Logger;
use crate::portal::{BundleId, Capabilities, DevPortalClient, ProvisioningProfile, normalize_udid};
use crate::project::{AppLayout, Target};
use chrono::Utc;
use futures::future::try_join_all;
use profiles::{ProfileJob, ensure_bundle_id, ensure_profile};
use std::collections::{BTreeMap, BTreeSet};

/// Signing assets settled for one distribution type.
#[derive(Debug, Clone)]
pub struct CodesignAssets {
    pub certificate: CertificateInfo,
    pub archivable_target_profiles_by_bundle_id: BTreeMap<String, ProvisioningProfile>,
    pub ui_test_target_profiles_by_bundle_id: BTreeMap<String, ProvisioningProfile>,
}

pub type CodesignAssetsByDistributionType = BTreeMap<DistributionType, CodesignAssets>;

#[derive(Debug, Clone)]
pub struct CodesignAssetsOpts {
    pub distribution: DistributionType,
    pub min_profile_validity_days: u32,
    /// Devices to register; empty when registration is disabled.
    pub test_devices: Vec<TestDevice>,
    /// Certificates already installed in the target keychain.
    pub local_certificates: Vec<CertificateInfo>,
    pub sign_ui_test_targets: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Required,
    /// Dropped with a warning when its certificate cannot be resolved.
    Optional,
}

/// Distribution types a run settles assets for.
///
/// Development is always included: optional next to another type, required
/// when UI test targets are signed since they only use development profiles.
#[must_use]
pub fn requested_distribution_types(
    distribution: DistributionType,
    sign_ui_test_targets: bool,
) -> Vec<(DistributionType, Requirement)> {
    let mut requested = vec![(distribution, Requirement::Required)];
    if distribution != DistributionType::Development {
        let requirement = if sign_ui_test_targets {
            Requirement::Required
        } else {
            Requirement::Optional
        };
        requested.push((DistributionType::Development, requirement));
    }
    requested
}

pub struct CodesignAssetManager<'a> {
    portal: &'a dyn DevPortalClient,
    downloader: &'a dyn CertificateDownloader,
    writer: &'a dyn AssetWriter,
    logger: Logger,
}

impl<'a> CodesignAssetManager<'a> {
    pub fn new(
        portal: &'a dyn DevPortalClient,
        downloader: &'a dyn CertificateDownloader,
        writer: &'a dyn AssetWriter,
        logger: Logger,
    ) -> Self {
        Self {
            portal,
            downloader,
            writer,
            logger,
        }
    }

    pub async fn ensure_codesign_assets(
        &self,
        layout: &AppLayout,
        opts: CodesignAssetsOpts,
    ) -> Result<CodesignAssetsByDistributionType> {
        let requested = requested_distribution_types(opts.distribution, opts.sign_ui_test_targets);
        let types: Vec<DistributionType> = requested.iter().map(|(d, _)| *d).collect();

        let reconciler = CertificateReconciler::new(self.downloader, self.portal, self.writer, self.logger);
        let mut resolution = reconciler.reconcile(&types, opts.local_certificates).await?;

        let mut certificates = Vec::new();
        for (distribution, requirement) in requested {
            let outcome = resolution.remove(&distribution).unwrap_or_else(|| {
                Err(AutoCodesignError::unresolved(distribution, "certificate was not resolved"))
            });
            match (outcome, requirement) {
                (Ok(certificate), _) => certificates.push((distribution, certificate)),
                (Err(e), Requirement::Optional) => {
                    self.logger.warn(format!("Skipping {distribution} code signing assets: {e}"));
                }
                (Err(e), Requirement::Required) => return Err(e),
            }
        }

        let needs_devices = certificates.iter().any(|(d, _)| d.has_devices());
        let devices = if needs_devices {
            ensure_test_devices(self.portal, &opts.test_devices, layout.platform, &self.logger).await?
        } else {
            Vec::new()
        };
        let device_ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
        // Coverage is only enforced for devices this run is asked to keep provisioned
        let required_devices: BTreeSet<String> = if opts.test_devices.is_empty() {
            BTreeSet::new()
        } else {
            devices.iter().map(|d| normalize_udid(&d.udid)).collect()
        };

        self.logger.section("Bundle IDs");
        let entitlements = entitlements_by_bundle_id(layout, &certificates);
        let bundle_ids: BTreeMap<String, BundleId> = try_join_all(entitlements.iter().map(|(identifier, caps)| {
            ensure_bundle_id(self.portal, identifier, caps, layout.platform, &self.logger)
        }))
        .await?
        .into_iter()
        .map(|b| (b.identifier.clone(), b))
        .collect();

        self.logger.section("Provisioning profiles");
        let now = Utc::now();
        let no_devices = BTreeSet::new();
        let mut jobs = Vec::new();
        for (distribution, certificate) in &certificates {
            for (target, is_ui_test) in targets_for(layout, *distribution) {
                let bundle_id = bundle_ids.get(&target.bundle_id).ok_or_else(|| {
                    AutoCodesignError::unresolved(*distribution, format!("bundle ID {} missing", target.bundle_id))
                })?;
                let job = ProfileJob {
                    bundle_id,
                    entitlements: &target.capabilities,
                    distribution: *distribution,
                    platform: layout.platform,
                    certificate,
                    required_devices: if distribution.has_devices() {
                        &required_devices
                    } else {
                        &no_devices
                    },
                    device_ids: &device_ids,
                    min_validity_days: opts.min_profile_validity_days,
                    now,
                };
                jobs.push(async move {
                    let profile = ensure_profile(self.portal, job, &self.logger).await?;
                    Ok::<_, AutoCodesignError>((*distribution, is_ui_test, target.bundle_id.clone(), profile))
                });
            }
        }
        let settled = try_join_all(jobs).await?;

        let mut assets: CodesignAssetsByDistributionType = certificates
            .into_iter()
            .map(|(distribution, certificate)| {
                (
                    distribution,
                    CodesignAssets {
                        certificate,
                        archivable_target_profiles_by_bundle_id: BTreeMap::new(),
                        ui_test_target_profiles_by_bundle_id: BTreeMap::new(),
                    },
                )
            })
            .collect();

        for (distribution, is_ui_test, bundle_id, profile) in settled {
            self.writer.install_profile(&profile).await?;
            if let Some(entry) = assets.get_mut(&distribution) {
                let by_bundle_id = if is_ui_test {
                    &mut entry.ui_test_target_profiles_by_bundle_id
                } else {
                    &mut entry.archivable_target_profiles_by_bundle_id
                };
                by_bundle_id.insert(bundle_id, profile);
            }
        }

        Ok(assets)
    }
}

/// Targets signed for `distribution`, flagged when they are UI test targets.
fn targets_for(layout: &AppLayout, distribution: DistributionType) -> impl Iterator<Item = (&Target, bool)> {
    let ui_tests = if distribution == DistributionType::Development {
        layout.ui_test_targets.as_slice()
    } else {
        &[]
    };
    layout
        .archivable_targets
        .iter()
        .map(|t| (t, false))
        .chain(ui_tests.iter().map(|t| (t, true)))
}

/// Union of the entitlements declared for each bundle ID signed this run.
fn entitlements_by_bundle_id(
    layout: &AppLayout,
    certificates: &[(DistributionType, CertificateInfo)],
) -> BTreeMap<String, Capabilities> {
    let mut entitlements: BTreeMap<String, Capabilities> = BTreeMap::new();
    for (distribution, _) in certificates {
        for (target, _) in targets_for(layout, *distribution) {
            entitlements
                .entry(target.bundle_id.clone())
                .or_default()
                .extend(target.capabilities.iter().cloned());
        }
    }
    entitlements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::Platform;

    fn target(name: &str, bundle_id: &str) -> Target {
        Target {
            name: name.to_string(),
            bundle_id: bundle_id.to_string(),
            capabilities: Capabilities::new(),
            deployment_target: None,
        }
    }

    #[test]
    fn development_is_optional_next_to_other_types() {
        assert_eq!(
            requested_distribution_types(DistributionType::AppStore, false),
            vec![
                (DistributionType::AppStore, Requirement::Required),
                (DistributionType::Development, Requirement::Optional)
            ]
        );
        assert_eq!(
            requested_distribution_types(DistributionType::AdHoc, true)[1],
            (DistributionType::Development, Requirement::Required)
        );
        assert_eq!(
            requested_distribution_types(DistributionType::Development, true),
            vec![(DistributionType::Development, Requirement::Required)]
        );
    }

    #[test]
    fn ui_test_targets_only_get_development_profiles() {
        let layout = AppLayout {
            platform: Platform::Ios,
            archivable_targets: vec![target("App", "com.example.app")],
            ui_test_targets: vec![target("AppUITests", "com.example.app.uitests")],
        };

        let development: Vec<_> = targets_for(&layout, DistributionType::Development)
            .map(|(t, ui)| (t.name.as_str(), ui))
            .collect();
        assert_eq!(development, vec![("App", false), ("AppUITests", true)]);

        let app_store: Vec<_> = targets_for(&layout, DistributionType::AppStore)
            .map(|(t, _)| t.name.as_str())
            .collect();
        assert_eq!(app_store, vec!["App"]);
    }
}
