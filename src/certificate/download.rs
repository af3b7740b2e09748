//! Fetching and decoding the configured certificate archives

use super::CertificateInfo;
use crate::config::CertificateAndPassphrase;
use crate::error::{AutoCodesignError, Result};
use crate::log::Logger;
use crate::retry::{AttemptError, is_transient_status, with_retry};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::time::Duration;

#[async_trait]
pub trait CertificateDownloader: Send + Sync {
    /// Downloads and decrypts every configured certificate archive.
    async fn get_certificates(&self) -> Result<Vec<CertificateInfo>>;
}

/// Downloads `.p12` archives over HTTP(S) or reads them from `file://` URLs and
/// plain paths.
pub struct HttpCertificateDownloader {
    certificates: Vec<CertificateAndPassphrase>,
    client: reqwest::Client,
    logger: Logger,
}

impl HttpCertificateDownloader {
    pub fn new(certificates: Vec<CertificateAndPassphrase>, logger: Logger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            certificates,
            client,
            logger,
        })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(tokio::fs::read(path).await?);
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Ok(tokio::fs::read(url).await?);
        }

        let redacted = &redact_url(url);
        with_retry(&format!("certificate download ({redacted})"), &self.logger, || async move {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                let error = AutoCodesignError::Certificate(format!(
                    "downloading {redacted} failed: HTTP {status}"
                ));
                return Err(if is_transient_status(status.as_u16()) {
                    AttemptError::transient(error)
                } else {
                    AttemptError::permanent(error)
                });
            }
            Ok(response.bytes().await?.to_vec())
        })
        .await
    }

    async fn download(&self, index: usize, item: &CertificateAndPassphrase) -> Result<CertificateInfo> {
        self.logger.debug(format!("Downloading certificate {}", index + 1));

        let data = self.fetch(&item.url).await?;
        let certificate = CertificateInfo::from_pkcs12(&data, &item.passphrase).map_err(|e| {
            AutoCodesignError::Certificate(format!("certificate {}: {e}", index + 1))
        })?;

        self.logger.debug(format!("Certificate {}: {certificate}", index + 1));
        Ok(certificate)
    }
}

#[async_trait]
impl CertificateDownloader for HttpCertificateDownloader {
    async fn get_certificates(&self) -> Result<Vec<CertificateInfo>> {
        try_join_all(
            self.certificates
                .iter()
                .enumerate()
                .map(|(index, item)| self.download(index, item)),
        )
        .await
    }
}

/// Query strings of storage URLs often carry access tokens.
fn redact_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
