//! Test device registration

use crate::connection::TestDevice;
use crate::error::Result;
use crate::log::Logger;
use crate::portal::{DevPortalClient, Device, Platform, normalize_udid};
use std::collections::BTreeSet;

/// Platform a test device registers under, from its reported device type.
fn device_platform(device_type: &str) -> Platform {
    if device_type.to_ascii_lowercase().contains("tv") {
        Platform::TvOs
    } else {
        Platform::Ios
    }
}

/// Registers the test devices missing from the portal and returns the enabled
/// devices usable on `platform`.
///
/// Devices are registered one at a time.
pub async fn ensure_test_devices(
    portal: &dyn DevPortalClient,
    test_devices: &[TestDevice],
    platform: Platform,
    logger: &Logger,
) -> Result<Vec<Device>> {
    logger.section("Devices");

    let mut devices = portal.list_devices().await?;
    logger.info(format!("{} device(s) registered on the Developer Portal", devices.len()));

    let mut known: BTreeSet<String> = devices.iter().map(|d| normalize_udid(&d.udid)).collect();

    for test_device in test_devices {
        let udid = normalize_udid(&test_device.device_id);
        if udid.is_empty() {
            continue;
        }
        if platform == Platform::MacOs || device_platform(&test_device.device_type) != platform {
            logger.debug(format!(
                "Skipping {} ({}): not a {platform} device",
                test_device.title, test_device.device_type
            ));
            continue;
        }
        if known.contains(&udid) {
            logger.debug(format!("Device already registered: {}", test_device.title));
            continue;
        }

        let device = portal
            .register_device(&test_device.title, &test_device.device_id, platform)
            .await?;
        logger.done(format!("Registered device: {} ({})", device.name, device.udid));
        known.insert(udid);
        devices.push(device);
    }

    let usable: Vec<Device> = devices
        .into_iter()
        .filter(|d| d.enabled && platform.accepts_device_class(&d.device_class))
        .collect();
    logger.info(format!("{} {platform} device(s) available for profiles", usable.len()));

    Ok(usable)
}
