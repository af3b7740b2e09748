//! Keychain and provisioning profile installation
//!
//! All writes go through one [`Keychain`] value. An in-process mutex and an
//! exclusive lock file keep a single writer on the keychain, even when several
//! runs share a machine.

use crate::certificate::{CertificateInfo, CertificateSource};
use crate::config::Secret;
use crate::credentials::expand_tilde_path;
use crate::error::{AutoCodesignError, Result};
use crate::log::Logger;
use crate::portal::ProvisioningProfile;
use async_trait::async_trait;
use fs4::tokio::AsyncFileExt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Persists resolved signing assets on the build machine.
#[async_trait]
pub trait AssetWriter: Send + Sync {
    async fn install_certificate(&self, certificate: &CertificateInfo) -> Result<()>;

    async fn install_profile(&self, profile: &ProvisioningProfile) -> Result<()>;
}

pub struct Keychain {
    path: PathBuf,
    password: Secret,
    profiles_dir: PathBuf,
    write_lock: Mutex<()>,
    logger: Logger,
}

impl Keychain {
    pub fn new(path: &Path, password: Secret, logger: Logger) -> Result<Self> {
        let path = PathBuf::from(expand_tilde_path(&path.to_string_lossy())?);
        let profiles_dir = dirs::home_dir()
            .ok_or_else(|| AutoCodesignError::KeychainOperation("HOME not set".to_string()))?
            .join("Library/MobileDevice/Provisioning Profiles");

        Ok(Self {
            path,
            password,
            profiles_dir,
            write_lock: Mutex::new(()),
            logger,
        })
    }

    #[must_use]
    pub fn with_profiles_dir(mut self, profiles_dir: impl Into<PathBuf>) -> Self {
        self.profiles_dir = profiles_dir.into();
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Code signing certificates already present in the keychain.
    pub async fn installed_certificates(&self) -> Result<Vec<CertificateInfo>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            self.logger.debug(format!("Keychain {} does not exist yet", self.path.display()));
            return Ok(Vec::new());
        }

        let output = tokio::process::Command::new("security")
            .arg("find-certificate")
            .args(["-a", "-p"])
            .arg(&self.path)
            .output()
            .await
            .map_err(|e| AutoCodesignError::CommandExecution(format!("failed to run security: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AutoCodesignError::KeychainOperation(format!(
                "listing certificates failed: {stderr}"
            )));
        }

        if output.stdout.is_empty() {
            return Ok(Vec::new());
        }
        CertificateInfo::from_pem_bundle(&output.stdout, CertificateSource::Local)
    }

    async fn security(&self, args: &[&str], what: &str) -> Result<std::process::Output> {
        let output = tokio::process::Command::new("security")
            .args(args)
            .output()
            .await
            .map_err(|e| AutoCodesignError::CommandExecution(format!("failed to execute security {what}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AutoCodesignError::KeychainOperation(format!("{what} failed: {stderr}")));
        }
        Ok(output)
    }

    /// Exclusive lock shared by every process writing to this keychain.
    async fn lock_file(&self) -> Result<tokio::fs::File> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| AutoCodesignError::KeychainOperation("could not determine cache directory".to_string()))?;
        let lock_path = lock_path(&cache_dir, &self.path);
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let lock_file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_path)
            .await?;

        lock_file.lock_exclusive().map_err(|e| {
            AutoCodesignError::KeychainOperation(format!("failed to acquire keychain lock: {e}"))
        })?;

        Ok(lock_file)
    }

    async fn is_installed(&self, certificate: &CertificateInfo) -> Result<bool> {
        let output = tokio::process::Command::new("security")
            .args(["find-certificate", "-a", "-p", "-c", certificate.common_name.as_str()])
            .arg(&self.path)
            .output()
            .await
            .map_err(|e| AutoCodesignError::CommandExecution(format!("failed to check existing certificate: {e}")))?;

        if !output.status.success() || output.stdout.is_empty() {
            return Ok(false);
        }

        let installed = CertificateInfo::from_pem_bundle(&output.stdout, CertificateSource::Local)?;
        Ok(installed.iter().any(|c| c.serial == certificate.serial))
    }
}

/// `<cache>/kodegen/<keychain file name>.lock`, one lock per keychain.
fn lock_path(cache_dir: &Path, keychain: &Path) -> PathBuf {
    let name = keychain
        .file_name()
        .map_or_else(|| "keychain".to_string(), |n| n.to_string_lossy().to_string());
    cache_dir.join("kodegen").join(format!("{name}.lock"))
}

#[async_trait]
impl AssetWriter for Keychain {
    async fn install_certificate(&self, certificate: &CertificateInfo) -> Result<()> {
        let Some(pkcs12) = &certificate.pkcs12 else {
            // Local certificates are already in the keychain
            return Ok(());
        };

        let _guard = self.write_lock.lock().await;
        let _lock_file = self.lock_file().await?;

        let keychain = self.path.to_string_lossy().to_string();
        self.security(
            &["unlock-keychain", "-p", self.password.expose(), &keychain],
            "unlock-keychain",
        )
        .await?;

        if self.is_installed(certificate).await? {
            self.logger.done(format!("Certificate already installed: {}", certificate.common_name));
            return Ok(());
        }

        let temp_dir = tempfile::TempDir::new()?;
        let p12_path = temp_dir.path().join("certificate.p12");
        tokio::fs::write(&p12_path, &pkcs12.data).await?;
        let p12_path = p12_path.to_string_lossy().to_string();

        self.security(
            &[
                "import",
                &p12_path,
                "-k",
                &keychain,
                "-P",
                pkcs12.passphrase.expose(),
                "-f",
                "pkcs12",
                "-T",
                "/usr/bin/codesign",
                "-T",
                "/usr/bin/security",
            ],
            "import",
        )
        .await?;

        // Lets codesign use the key without a UI prompt
        self.security(
            &[
                "set-key-partition-list",
                "-S",
                "apple-tool:,apple:",
                "-k",
                self.password.expose(),
                &keychain,
            ],
            "set-key-partition-list",
        )
        .await?;

        self.logger.done(format!("Certificate installed: {}", certificate.common_name));
        Ok(())
    }

    async fn install_profile(&self, profile: &ProvisioningProfile) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&self.profiles_dir).await?;
        let path = self.profiles_dir.join(format!("{}.mobileprovision", profile.uuid));
        tokio::fs::write(&path, &profile.content).await?;

        self.logger.debug(format!("Profile installed: {}", path.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistributionType;
    use chrono::Utc;

    #[tokio::test]
    async fn profiles_are_written_by_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = Keychain::new(Path::new("/tmp/missing.keychain-db"), Secret::new("pw"), Logger::default())
            .unwrap()
            .with_profiles_dir(dir.path());

        let profile = ProvisioningProfile {
            id: "P1".to_string(),
            uuid: "1234-ABCD".to_string(),
            name: "Bitrise iOS development - (com.example.app)".to_string(),
            bundle_identifier: "com.example.app".to_string(),
            distribution: DistributionType::Development,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            devices: Default::default(),
            certificate_serials: Default::default(),
            capabilities: Default::default(),
            content: b"profile".to_vec(),
        };
        keychain.install_profile(&profile).await.unwrap();

        let written = std::fs::read(dir.path().join("1234-ABCD.mobileprovision")).unwrap();
        assert_eq!(written, b"profile");
    }

    #[test]
    fn each_keychain_gets_its_own_lock() {
        let cache = Path::new("/cache");
        let login = lock_path(cache, Path::new("/Users/vagrant/Library/Keychains/login.keychain-db"));
        let ci = lock_path(cache, Path::new("/tmp/ci.keychain-db"));

        assert_eq!(login, Path::new("/cache/kodegen/login.keychain-db.lock"));
        assert_ne!(login, ci);
    }

    #[tokio::test]
    async fn missing_keychain_has_no_certificates() {
        let keychain = Keychain::new(Path::new("/tmp/does-not-exist.keychain-db"), Secret::new("pw"), Logger::default())
            .unwrap();
        assert!(keychain.installed_certificates().await.unwrap().is_empty());
    }
}
