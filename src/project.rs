//! Xcode project analysis and code signing overrides

use crate::autocodesign::CodesignAssetsByDistributionType;
use crate::config::DistributionType;
use crate::error::{AutoCodesignError, Result};
use crate::log::Logger;
use crate::portal::{Capabilities, Platform};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Name of the build settings overlay written next to the project.
pub const XCCONFIG_FILE_NAME: &str = "autocodesign.xcconfig";

const PRODUCT_TYPE_APPLICATION: &str = "com.apple.product-type.application";
const PRODUCT_TYPE_UI_TESTING: &str = "com.apple.product-type.bundle.ui-testing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub bundle_id: String,
    /// Entitlement keys from the target's entitlements file.
    pub capabilities: Capabilities,
    pub deployment_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLayout {
    pub platform: Platform,
    /// The main application target comes first.
    pub archivable_targets: Vec<Target>,
    pub ui_test_targets: Vec<Target>,
}

#[async_trait]
pub trait ProjectAnalyzer: Send + Sync {
    async fn app_layout(&self, include_ui_tests: bool) -> Result<AppLayout>;

    async fn main_target_bundle_id(&self) -> Result<String>;

    /// Points the project's signing settings at the resolved assets.
    async fn force_codesign_assets(
        &self,
        distribution: DistributionType,
        assets: &CodesignAssetsByDistributionType,
    ) -> Result<()>;
}

/// Target entry of `xcodebuild -showBuildSettings -json`.
#[derive(Debug, Deserialize)]
struct TargetSettings {
    target: String,
    #[serde(rename = "buildSettings")]
    build_settings: HashMap<String, String>,
}

impl TargetSettings {
    fn get(&self, key: &str) -> Option<&str> {
        self.build_settings.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn product_type(&self) -> &str {
        self.get("PRODUCT_TYPE").unwrap_or_default()
    }

    fn is_archivable(&self) -> bool {
        let product_type = self.product_type();
        product_type.starts_with(PRODUCT_TYPE_APPLICATION)
            || product_type.contains("extension")
            || product_type.contains("watchapp")
    }

    fn platform(&self) -> Option<Platform> {
        match self.get("PLATFORM_NAME")? {
            "iphoneos" | "iphonesimulator" => Some(Platform::Ios),
            "appletvos" | "appletvsimulator" => Some(Platform::TvOs),
            "macosx" => Some(Platform::MacOs),
            _ => None,
        }
    }

    fn deployment_target(&self) -> Option<String> {
        [
            "IPHONEOS_DEPLOYMENT_TARGET",
            "TVOS_DEPLOYMENT_TARGET",
            "MACOSX_DEPLOYMENT_TARGET",
        ]
        .into_iter()
        .find_map(|key| self.get(key))
        .map(str::to_string)
    }

    fn entitlements_path(&self) -> Option<PathBuf> {
        let path = Path::new(self.get("CODE_SIGN_ENTITLEMENTS")?);
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        let root = self.get("SRCROOT").or_else(|| self.get("PROJECT_DIR"))?;
        Some(Path::new(root).join(path))
    }
}

/// A project or workspace with a shared scheme.
pub struct XcodeProject {
    path: PathBuf,
    scheme: String,
    configuration: Option<String>,
    logger: Logger,
}

impl XcodeProject {
    pub fn new(
        path: impl Into<PathBuf>,
        scheme: impl Into<String>,
        configuration: Option<String>,
        logger: Logger,
    ) -> Result<Self> {
        let path = path.into();
        let is_project = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("xcodeproj" | "xcworkspace")
        );
        if !is_project {
            return Err(AutoCodesignError::Project(format!(
                "{} is not an .xcodeproj or .xcworkspace",
                path.display()
            )));
        }

        Ok(Self {
            path,
            scheme: scheme.into(),
            configuration: configuration.filter(|c| !c.trim().is_empty()),
            logger,
        })
    }

    /// Location of the build settings overlay.
    #[must_use]
    pub fn xcconfig_path(&self) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(XCCONFIG_FILE_NAME)
    }

    async fn build_settings(&self, include_ui_tests: bool) -> Result<Vec<TargetSettings>> {
        let mut command = tokio::process::Command::new("xcodebuild");
        let flag = if self.path.extension().and_then(|e| e.to_str()) == Some("xcworkspace") {
            "-workspace"
        } else {
            "-project"
        };
        command.arg(flag).arg(&self.path).args(["-scheme", self.scheme.as_str()]);
        if let Some(configuration) = &self.configuration {
            command.args(["-configuration", configuration.as_str()]);
        }
        command.args(["-showBuildSettings", "-json"]);
        if include_ui_tests {
            command.arg("build-for-testing");
        }

        self.logger.debug(format!("Reading build settings of scheme {}", self.scheme));
        let output = command
            .output()
            .await
            .map_err(|e| AutoCodesignError::CommandExecution(format!("failed to execute xcodebuild: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AutoCodesignError::Project(format!("xcodebuild -showBuildSettings failed: {stderr}")));
        }

        parse_build_settings(&output.stdout)
    }
}

/// Parses the JSON printed by `xcodebuild -showBuildSettings -json`, one entry
/// per target and in build order.
fn parse_build_settings(json: &[u8]) -> Result<Vec<TargetSettings>> {
    let mut targets: Vec<TargetSettings> = serde_json::from_slice(json)?;
    let mut seen = std::collections::HashSet::new();
    targets.retain(|t| seen.insert(t.target.clone()));
    Ok(targets)
}

async fn read_entitlements(path: Option<PathBuf>) -> Result<Capabilities> {
    let Some(path) = path else {
        return Ok(Capabilities::new());
    };
    let data = tokio::fs::read(&path).await.map_err(|e| {
        AutoCodesignError::Project(format!("failed to read entitlements {}: {e}", path.display()))
    })?;
    let entitlements: plist::Dictionary = plist::from_bytes(&data)
        .map_err(|e| AutoCodesignError::Project(format!("invalid entitlements {}: {e}", path.display())))?;
    Ok(entitlements.keys().cloned().collect())
}

async fn into_target(settings: &TargetSettings) -> Result<Target> {
    let bundle_id = settings
        .get("PRODUCT_BUNDLE_IDENTIFIER")
        .ok_or_else(|| AutoCodesignError::Project(format!("target {} has no bundle identifier", settings.target)))?;

    Ok(Target {
        name: settings.target.clone(),
        bundle_id: bundle_id.to_string(),
        capabilities: read_entitlements(settings.entitlements_path()).await?,
        deployment_target: settings.deployment_target(),
    })
}

fn main_target(targets: &[TargetSettings]) -> Result<&TargetSettings> {
    targets
        .iter()
        .find(|t| t.product_type() == PRODUCT_TYPE_APPLICATION)
        .ok_or_else(|| AutoCodesignError::Project("scheme has no application target".to_string()))
}

#[async_trait]
impl ProjectAnalyzer for XcodeProject {
    async fn app_layout(&self, include_ui_tests: bool) -> Result<AppLayout> {
        let targets = self.build_settings(include_ui_tests).await?;
        let main = main_target(&targets)?;
        let platform = main.platform().ok_or_else(|| {
            AutoCodesignError::Project(format!("unsupported platform of target {}", main.target))
        })?;

        let mut archivable_targets = vec![into_target(main).await?];
        for settings in targets.iter().filter(|t| t.is_archivable() && t.target != main.target) {
            archivable_targets.push(into_target(settings).await?);
        }

        let mut ui_test_targets = Vec::new();
        if include_ui_tests {
            for settings in targets.iter().filter(|t| t.product_type() == PRODUCT_TYPE_UI_TESTING) {
                ui_test_targets.push(into_target(settings).await?);
            }
        }

        self.logger.info(format!(
            "{platform} app with {} archivable and {} UI test target(s)",
            archivable_targets.len(),
            ui_test_targets.len()
        ));
        Ok(AppLayout {
            platform,
            archivable_targets,
            ui_test_targets,
        })
    }

    async fn main_target_bundle_id(&self) -> Result<String> {
        let targets = self.build_settings(false).await?;
        let main = main_target(&targets)?;
        main.get("PRODUCT_BUNDLE_IDENTIFIER")
            .map(str::to_string)
            .ok_or_else(|| AutoCodesignError::Project(format!("target {} has no bundle identifier", main.target)))
    }

    async fn force_codesign_assets(
        &self,
        distribution: DistributionType,
        assets: &CodesignAssetsByDistributionType,
    ) -> Result<()> {
        let overlay = render_xcconfig(distribution, assets)?;
        let path = self.xcconfig_path();
        tokio::fs::write(&path, overlay).await?;

        self.logger.done(format!("Code signing settings written to {}", path.display()));
        self.logger.info(format!("Pass -xcconfig {} to xcodebuild to apply them", path.display()));
        Ok(())
    }
}

/// Same transformation as Xcode's `:c99extidentifier` build setting operator.
#[must_use]
pub fn c99_identifier(value: &str) -> String {
    let mut identifier: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if identifier.starts_with(|c: char| c.is_ascii_digit()) {
        identifier.insert(0, '_');
    }
    identifier
}

/// Renders manual signing settings keyed by bundle identifier.
///
/// Archivable targets use the requested distribution's assets, UI test targets
/// the development assets.
pub fn render_xcconfig(distribution: DistributionType, assets: &CodesignAssetsByDistributionType) -> Result<String> {
    let main = assets.get(&distribution).ok_or_else(|| {
        AutoCodesignError::Project(format!("no code signing assets ensured for {distribution}"))
    })?;

    let mut per_bundle: BTreeMap<&str, (&str, &str, &str)> = BTreeMap::new();
    for (bundle_id, profile) in &main.archivable_target_profiles_by_bundle_id {
        per_bundle.insert(
            bundle_id.as_str(),
            (main.certificate.common_name.as_str(), profile.uuid.as_str(), profile.name.as_str()),
        );
    }
    if let Some(development) = assets.get(&DistributionType::Development) {
        for (bundle_id, profile) in &development.ui_test_target_profiles_by_bundle_id {
            per_bundle.insert(
                bundle_id.as_str(),
                (
                    development.certificate.common_name.as_str(),
                    profile.uuid.as_str(),
                    profile.name.as_str(),
                ),
            );
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "// Generated by kodegen_autocodesign for {distribution}");
    let _ = writeln!(out, "CODE_SIGN_STYLE = Manual");
    let _ = writeln!(out, "DEVELOPMENT_TEAM = {}", main.certificate.team_id);
    let _ = writeln!(out, "AUTOCODESIGN_KEY = $(PRODUCT_BUNDLE_IDENTIFIER:c99extidentifier)");
    let _ = writeln!(out, "CODE_SIGN_IDENTITY = $(AUTOCODESIGN_IDENTITY_$(AUTOCODESIGN_KEY))");
    let _ = writeln!(out, "PROVISIONING_PROFILE = $(AUTOCODESIGN_PROFILE_$(AUTOCODESIGN_KEY))");
    let _ = writeln!(out, "PROVISIONING_PROFILE_SPECIFIER = $(AUTOCODESIGN_SPECIFIER_$(AUTOCODESIGN_KEY))");

    for (bundle_id, (identity, uuid, name)) in per_bundle {
        let key = c99_identifier(bundle_id);
        let _ = writeln!(out);
        let _ = writeln!(out, "// {bundle_id}");
        let _ = writeln!(out, "AUTOCODESIGN_IDENTITY_{key} = {identity}");
        let _ = writeln!(out, "AUTOCODESIGN_PROFILE_{key} = {uuid}");
        let _ = writeln!(out, "AUTOCODESIGN_SPECIFIER_{key} = {name}");
    }

    Ok(out)
}
