//! Apple Developer connection provided by the CI platform

use crate::config::Secret;
use crate::error::{AutoCodesignError, Result};
use crate::log::Logger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

const CONNECTION_DATA_PATH: &str = "apple_developer_portal_data.json";
const BUILD_API_TOKEN_HEADER: &str = "BUILD_API_TOKEN";

/// Developer Portal account data attached to a build.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppleDeveloperConnection {
    #[serde(rename = "apple_id", default)]
    pub session: Option<SessionConnection>,
    #[serde(rename = "api_key", default)]
    pub api_key: Option<ApiKeyConnection>,
    #[serde(default)]
    pub test_devices: Vec<TestDevice>,
}

/// Apple ID session established by the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConnection {
    pub apple_id: String,
    #[serde(default)]
    pub connection_expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_cookies: BTreeMap<String, Vec<SessionCookie>>,
}

#[derive(Clone, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: Secret,
}

impl std::fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCookie")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl SessionConnection {
    /// `Cookie` header value built from every stored cookie.
    #[must_use]
    pub fn cookie_header(&self) -> Secret {
        let header = self
            .session_cookies
            .values()
            .flatten()
            .map(|c| format!("{}={}", c.name, c.value.expose()))
            .collect::<Vec<_>>()
            .join("; ");
        Secret::new(header)
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.connection_expiry_date.is_some_and(|expiry| expiry <= now)
    }
}

/// App Store Connect API key stored on the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConnection {
    pub key_id: String,
    pub issuer_id: String,
    pub private_key: Secret,
}

/// Device registered for testing on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestDevice {
    #[serde(rename = "device_identifier")]
    pub device_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub device_type: String,
}

impl TestDevice {
    #[must_use]
    pub fn new(device_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            title: title.into(),
            device_type: "ios".to_string(),
        }
    }
}

/// Source of the optional Apple Developer connection.
///
/// `Ok(None)` means no connection is configured, which is a normal state.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connection(&self) -> Result<Option<AppleDeveloperConnection>>;
}

/// Reads the connection attached to a Bitrise build.
///
/// A `file://` build URL points at a local JSON document instead, which lets the
/// step run outside the platform.
pub struct BitriseConnectionProvider {
    build_url: Option<String>,
    api_token: Option<Secret>,
    logger: Logger,
}

impl BitriseConnectionProvider {
    #[must_use]
    pub fn new(build_url: Option<String>, api_token: Option<Secret>, logger: Logger) -> Self {
        Self {
            build_url: build_url.filter(|u| !u.trim().is_empty()),
            api_token: api_token.filter(|t| !t.is_empty()),
            logger,
        }
    }

    async fn fetch_remote(&self, build_url: &str, token: &Secret) -> Result<AppleDeveloperConnection> {
        let url = format!("{}/{CONNECTION_DATA_PATH}", build_url.trim_end_matches('/'));
        self.logger.debug(format!("Fetching Apple Developer connection from {url}"));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let response = client
            .get(&url)
            .header(BUILD_API_TOKEN_HEADER, token.expose())
            .send()
            .await
            .map_err(|e| {
                AutoCodesignError::Credential(format!("failed to fetch Apple Developer connection: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.logger.debug(format!("Connection response ({status}): {body}"));
            return Err(AutoCodesignError::Credential(format!(
                "failed to fetch Apple Developer connection: HTTP {status}"
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ConnectionProvider for BitriseConnectionProvider {
    async fn connection(&self) -> Result<Option<AppleDeveloperConnection>> {
        let (Some(build_url), Some(token)) = (&self.build_url, &self.api_token) else {
            self.logger.warn(
                "Connected Apple Developer Portal account not found: build URL and build API token are not set",
            );
            return Ok(None);
        };

        let connection = if let Some(path) = build_url.strip_prefix("file://") {
            let content = tokio::fs::read_to_string(path).await?;
            serde_json::from_str(&content)?
        } else {
            self.fetch_remote(build_url, token).await?
        };

        Ok(Some(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONNECTION_JSON: &str = r#"{
        "apple_id": {
            "apple_id": "dev@example.com",
            "connection_expiry_date": "2030-01-01T00:00:00Z",
            "session_cookies": {
                "https://idmsa.apple.com": [
                    {"name": "myacinfo", "value": "abc", "domain": "apple.com"},
                    {"name": "DES58b0", "value": "def"}
                ]
            }
        },
        "api_key": null,
        "test_devices": [
            {"id": 1, "user_id": 2, "device_identifier": "00008030-001A2B3C4D5E6F7A", "title": "iPhone", "device_type": "ios"}
        ]
    }"#;

    #[test]
    fn parses_platform_connection_payload() {
        let connection: AppleDeveloperConnection = serde_json::from_str(CONNECTION_JSON).unwrap();
        let session = connection.session.unwrap();
        assert_eq!(session.apple_id, "dev@example.com");
        assert_eq!(session.cookie_header().expose(), "myacinfo=abc; DES58b0=def");
        assert!(!session.is_expired(Utc::now()));
        assert!(connection.api_key.is_none());
        assert_eq!(connection.test_devices.len(), 1);
        assert_eq!(connection.test_devices[0].device_id, "00008030-001A2B3C4D5E6F7A");
    }

    #[tokio::test]
    async fn missing_build_url_means_no_connection() {
        let provider = BitriseConnectionProvider::new(None, Some(Secret::new("token")), Logger::default());
        assert!(provider.connection().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_url_reads_local_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONNECTION_JSON.as_bytes()).unwrap();

        let provider = BitriseConnectionProvider::new(
            Some(format!("file://{}", file.path().display())),
            Some(Secret::new("any")),
            Logger::default(),
        );
        let connection = provider.connection().await.unwrap().unwrap();
        assert!(connection.session.is_some());
    }
}
