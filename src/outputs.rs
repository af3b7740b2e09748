//! Exported step outputs

use crate::autocodesign::{CodesignAssets, CodesignAssetsByDistributionType};
use crate::config::DistributionType;
use crate::error::{AutoCodesignError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;

pub const EXPORT_METHOD: &str = "BITRISE_EXPORT_METHOD";
pub const DEVELOPER_TEAM: &str = "BITRISE_DEVELOPER_TEAM";
pub const DEVELOPMENT_CODESIGN_IDENTITY: &str = "BITRISE_DEVELOPMENT_CODESIGN_IDENTITY";
pub const DEVELOPMENT_PROFILE: &str = "BITRISE_DEVELOPMENT_PROFILE";
pub const PRODUCTION_CODESIGN_IDENTITY: &str = "BITRISE_PRODUCTION_CODESIGN_IDENTITY";
pub const PRODUCTION_PROFILE: &str = "BITRISE_PRODUCTION_PROFILE";

/// Maps the settled assets to the exported key/value contract.
pub fn project_outputs(
    distribution: DistributionType,
    assets: &CodesignAssetsByDistributionType,
    main_bundle_id: &str,
) -> Result<BTreeMap<String, String>> {
    let selected = assets.get(&distribution).ok_or_else(|| {
        AutoCodesignError::OutputProjection(format!("no code signing assets ensured for {distribution}"))
    })?;

    let mut outputs = BTreeMap::new();
    outputs.insert(EXPORT_METHOD.to_string(), distribution.to_string());
    outputs.insert(DEVELOPER_TEAM.to_string(), selected.certificate.team_id.clone());

    if let Some(development) = assets.get(&DistributionType::Development) {
        outputs.insert(
            DEVELOPMENT_CODESIGN_IDENTITY.to_string(),
            development.certificate.common_name.clone(),
        );
        outputs.insert(
            DEVELOPMENT_PROFILE.to_string(),
            main_profile_uuid(development, DistributionType::Development, main_bundle_id)?,
        );
    }

    if distribution != DistributionType::Development {
        outputs.insert(
            PRODUCTION_CODESIGN_IDENTITY.to_string(),
            selected.certificate.common_name.clone(),
        );
        outputs.insert(
            PRODUCTION_PROFILE.to_string(),
            main_profile_uuid(selected, distribution, main_bundle_id)?,
        );
    }

    Ok(outputs)
}

fn main_profile_uuid(assets: &CodesignAssets, distribution: DistributionType, main_bundle_id: &str) -> Result<String> {
    assets
        .archivable_target_profiles_by_bundle_id
        .get(main_bundle_id)
        .map(|profile| profile.uuid.clone())
        .ok_or_else(|| {
            AutoCodesignError::OutputProjection(format!(
                "no {distribution} provisioning profile ensured for the main target ({main_bundle_id})"
            ))
        })
}

/// Destination of exported outputs.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn export(&self, key: &str, value: &str) -> Result<()>;
}

/// Exports through `envman add`, making values visible to later steps.
pub struct EnvmanSink;

#[async_trait]
impl OutputSink for EnvmanSink {
    async fn export(&self, key: &str, value: &str) -> Result<()> {
        let output = tokio::process::Command::new("envman")
            .args(["add", "--key", key, "--value", value])
            .output()
            .await
            .map_err(|e| AutoCodesignError::CommandExecution(format!("failed to execute envman: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AutoCodesignError::OutputProjection(format!(
                "exporting {key} failed: {stderr}"
            )));
        }
        Ok(())
    }
}

/// Prints `KEY=VALUE` lines.
pub struct StdoutSink;

#[async_trait]
impl OutputSink for StdoutSink {
    async fn export(&self, key: &str, value: &str) -> Result<()> {
        println!("{key}={value}");
        Ok(())
    }
}
