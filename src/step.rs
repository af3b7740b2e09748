//! One automatic code signing run, from validated inputs to exported outputs.

use crate::autocodesign::{CodesignAssetManager, CodesignAssetsOpts};
use crate::certificate::{CertificateDownloader, CertificateInfo};
use crate::config::ValidatedInputs;
use crate::connection::ConnectionProvider;
use crate::credentials::{ConnectionState, select_credentials};
use crate::error::Result;
use crate::keychain::AssetWriter;
use crate::log::Logger;
use crate::outputs::{OutputSink, project_outputs};
use crate::portal::PortalClientFactory;
use crate::project::ProjectAnalyzer;
use std::collections::BTreeMap;

/// External collaborators of a run.
pub struct Collaborators<'a> {
    pub project: &'a dyn ProjectAnalyzer,
    pub connection: &'a dyn ConnectionProvider,
    pub portal: &'a dyn PortalClientFactory,
    pub downloader: &'a dyn CertificateDownloader,
    pub writer: &'a dyn AssetWriter,
    pub sink: &'a dyn OutputSink,
}

/// Runs every stage in order and returns the exported outputs.
///
/// Any error aborts the run; nothing is exported unless every stage succeeds.
pub async fn run(
    inputs: &ValidatedInputs,
    local_certificates: Vec<CertificateInfo>,
    collaborators: &Collaborators<'_>,
    logger: &Logger,
) -> Result<BTreeMap<String, String>> {
    logger.section("Analyzing project");
    let layout = collaborators.project.app_layout(inputs.sign_ui_test_targets).await?;

    logger.section("Apple Developer Portal");
    let connection = ConnectionState::from(collaborators.connection.connection().await?);
    let selection = select_credentials(
        inputs.connection_type,
        &connection,
        &inputs.api_key_overrides,
        inputs.team_id.as_deref(),
        logger,
    )?;
    let credentials = selection.into_credentials().await?;
    let portal = collaborators.portal.create(credentials, inputs.team_id.as_deref())?;

    let test_devices = match (&connection, inputs.register_test_devices) {
        (ConnectionState::Connected(c), true) => c.test_devices.clone(),
        _ => Vec::new(),
    };
    if inputs.register_test_devices && test_devices.is_empty() {
        logger.warn("Test device registration is enabled but the connection lists no test devices");
    }

    let manager = CodesignAssetManager::new(
        portal.as_ref(),
        collaborators.downloader,
        collaborators.writer,
        *logger,
    );
    let assets = manager
        .ensure_codesign_assets(
            &layout,
            CodesignAssetsOpts {
                distribution: inputs.distribution,
                min_profile_validity_days: inputs.min_profile_validity_days,
                test_devices,
                local_certificates,
                sign_ui_test_targets: inputs.sign_ui_test_targets,
            },
        )
        .await?;

    // A projection failure must leave the project untouched.
    let main_bundle_id = collaborators.project.main_target_bundle_id().await?;
    let outputs = project_outputs(inputs.distribution, &assets, &main_bundle_id)?;

    collaborators
        .project
        .force_codesign_assets(inputs.distribution, &assets)
        .await?;

    logger.section("Exporting outputs");
    for (key, value) in &outputs {
        logger.done(format!("{key}={value}"));
        collaborators.sink.export(key, value).await?;
    }

    Ok(outputs)
}
