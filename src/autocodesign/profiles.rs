//! Bundle ID preparation and provisioning profile reuse or creation

use crate::certificate::CertificateInfo;
use crate::config::DistributionType;
use crate::error::{AutoCodesignError, Result};
use crate::log::Logger;
use crate::portal::profile::{ProfileRequirements, pick_latest};
use crate::portal::{
    BundleId, Capabilities, DevPortalClient, Platform, ProfileRequest, ProvisioningProfile, capability_type,
    required_capabilities,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Name of the profiles this tool creates, e.g. `Bitrise iOS development - (com.example.app)`.
#[must_use]
pub fn profile_name(platform: Platform, distribution: DistributionType, bundle_id: &str) -> String {
    format!("Bitrise {platform} {distribution} - ({bundle_id})")
}

/// Name of the bundle IDs this tool registers.
#[must_use]
pub fn bundle_id_name(identifier: &str) -> String {
    let words: String = identifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    format!("Bitrise {words}")
}

/// Looks up or registers `identifier` and enables the capabilities its targets need.
pub async fn ensure_bundle_id(
    portal: &dyn DevPortalClient,
    identifier: &str,
    entitlements: &Capabilities,
    platform: Platform,
    logger: &Logger,
) -> Result<BundleId> {
    let mut bundle_id = match portal.find_bundle_id(identifier).await? {
        Some(bundle_id) => {
            logger.debug(format!("Bundle ID found: {identifier}"));
            bundle_id
        }
        None => {
            let created = portal
                .create_bundle_id(identifier, &bundle_id_name(identifier), platform)
                .await?;
            logger.done(format!("Bundle ID registered: {identifier}"));
            created
        }
    };

    let missing: BTreeSet<&'static str> = required_capabilities(entitlements)
        .iter()
        .filter_map(|entitlement| capability_type(entitlement))
        .filter(|capability| !bundle_id.capabilities.contains(*capability))
        .collect();

    for capability in missing {
        portal.enable_capability(&bundle_id, capability).await?;
        logger.done(format!("Capability {capability} enabled on {identifier}"));
        bundle_id.capabilities.insert(capability.to_string());
    }

    Ok(bundle_id)
}

/// Everything needed to settle one (bundle ID, distribution type) pair.
pub struct ProfileJob<'a> {
    pub bundle_id: &'a BundleId,
    pub entitlements: &'a Capabilities,
    pub distribution: DistributionType,
    pub platform: Platform,
    pub certificate: &'a CertificateInfo,
    /// Normalized UDIDs every reused profile has to cover.
    pub required_devices: &'a BTreeSet<String>,
    /// Portal IDs of the devices a new profile includes.
    pub device_ids: &'a [String],
    pub min_validity_days: u32,
    pub now: DateTime<Utc>,
}

/// Reuses the most recent profile meeting every requirement, otherwise replaces
/// the generated profile with a fresh one.
pub async fn ensure_profile(
    portal: &dyn DevPortalClient,
    job: ProfileJob<'_>,
    logger: &Logger,
) -> Result<ProvisioningProfile> {
    let identifier = &job.bundle_id.identifier;
    let name = profile_name(job.platform, job.distribution, identifier);
    let capabilities = required_capabilities(job.entitlements);
    let requirements = ProfileRequirements::new(
        &job.certificate.serial,
        &capabilities,
        job.required_devices,
        job.now,
        job.min_validity_days,
    );

    let mut reusable = Vec::new();
    let mut stale = Vec::new();
    for profile in portal
        .list_profiles(job.bundle_id, job.distribution, job.platform)
        .await?
    {
        match profile.check(&requirements) {
            Ok(()) => reusable.push(profile),
            Err(mismatch) => {
                logger.debug(format!("Profile {} {mismatch}", profile.name));
                if profile.name == name {
                    stale.push(profile.id);
                }
            }
        }
    }

    if let Some(profile) = pick_latest(reusable) {
        logger.done(format!("Reusing {} profile for {identifier}: {}", job.distribution, profile.uuid));
        return Ok(profile);
    }

    for profile_id in stale {
        portal.delete_profile(&profile_id).await?;
        logger.debug(format!("Deleted outdated profile {name}"));
    }

    let certificate_id = job.certificate.portal_id.as_deref().ok_or_else(|| {
        AutoCodesignError::unresolved(
            job.distribution,
            format!("certificate {} is not registered on the Developer Portal", job.certificate.serial),
        )
    })?;
    let device_ids = if job.distribution.has_devices() {
        job.device_ids.to_vec()
    } else {
        Vec::new()
    };

    let request = ProfileRequest {
        name,
        bundle_id: job.bundle_id,
        distribution: job.distribution,
        platform: job.platform,
        certificate_id,
        device_ids,
    };
    let profile = portal.create_profile(&request).await?;
    logger.done(format!("Created {} profile for {identifier}: {}", job.distribution, profile.uuid));

    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names() {
        assert_eq!(
            profile_name(Platform::Ios, DistributionType::AppStore, "com.example.app"),
            "Bitrise iOS app-store - (com.example.app)"
        );
        assert_eq!(bundle_id_name("com.example.my-app"), "Bitrise com example my app");
    }
}
