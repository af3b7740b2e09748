use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;

use kodegen_bundler_autocodesign::certificate::HttpCertificateDownloader;
use kodegen_bundler_autocodesign::config::{Config, Secret, parse_toggle};
use kodegen_bundler_autocodesign::connection::BitriseConnectionProvider;
use kodegen_bundler_autocodesign::keychain::Keychain;
use kodegen_bundler_autocodesign::outputs::{EnvmanSink, OutputSink, StdoutSink};
use kodegen_bundler_autocodesign::portal::AppStoreConnectFactory;
use kodegen_bundler_autocodesign::project::XcodeProject;
use kodegen_bundler_autocodesign::{AutoCodesignError, Collaborators, Logger};

// Log output is decorative: color and write errors are ignored by the logger.
// Everything else propagates and ends the run with exit code 1.

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportWith {
    /// Export through `envman add`
    Envman,
    /// Print KEY=VALUE lines
    Stdout,
}

#[derive(Parser)]
#[command(name = "kodegen_autocodesign")]
#[command(version, about = "Ensure code signing assets for an Xcode project")]
struct Cli {
    /// Path to step config file (TOML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// development, app-store, ad-hoc or enterprise
    #[arg(long, env = "distribution_method")]
    distribution_method: Option<String>,

    /// Path of the .xcodeproj or .xcworkspace
    #[arg(long, env = "project_path")]
    project_path: Option<PathBuf>,

    #[arg(long, env = "scheme")]
    scheme: Option<String>,

    /// Build configuration (defaults to the scheme's archive configuration)
    #[arg(long, env = "configuration")]
    configuration: Option<String>,

    /// api-key or apple-id
    #[arg(long, env = "apple_service_connection", default_value = "api-key")]
    apple_service_connection: String,

    #[arg(long, env = "register_test_devices", default_value = "no", value_parser = parse_toggle, action = ArgAction::Set)]
    register_test_devices: bool,

    /// Minimum days a reused profile has to stay valid
    #[arg(long, env = "min_profile_validity", default_value_t = 0, allow_negative_numbers = true)]
    min_profile_validity: i64,

    #[arg(long, env = "sign_uitest_targets", default_value = "no", value_parser = parse_toggle, action = ArgAction::Set)]
    sign_uitest_targets: bool,

    /// Pipe separated certificate URLs
    #[arg(long, env = "certificate_url_list", hide_env_values = true)]
    certificate_url_list: Option<String>,

    /// Pipe separated passphrases, aligned with the certificate URLs
    #[arg(long, env = "passphrase_list", hide_env_values = true)]
    passphrase_list: Option<String>,

    #[arg(long, env = "keychain_path")]
    keychain_path: Option<PathBuf>,

    #[arg(long, env = "keychain_password", hide_env_values = true)]
    keychain_password: Option<String>,

    #[arg(long, env = "BITRISE_BUILD_URL")]
    build_url: Option<String>,

    #[arg(long, env = "BITRISE_BUILD_API_TOKEN", hide_env_values = true)]
    build_api_token: Option<String>,

    /// Path to an App Store Connect .p8 key
    #[arg(long, env = "api_key_path")]
    api_key_path: Option<String>,

    #[arg(long, env = "api_key_id")]
    api_key_id: Option<String>,

    #[arg(long, env = "api_issuer")]
    api_issuer: Option<String>,

    /// Developer Portal team, for Apple IDs in several teams
    #[arg(long, env = "team_id")]
    team_id: Option<String>,

    #[arg(long, env = "verbose_log", default_value = "no", value_parser = parse_toggle, action = ArgAction::Set)]
    verbose_log: bool,

    #[arg(long, value_enum, default_value = "envman")]
    export_with: ExportWith,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            distribution_method: self.distribution_method.unwrap_or_default(),
            project_path: self.project_path.unwrap_or_default(),
            scheme: self.scheme.unwrap_or_default(),
            configuration: self.configuration,
            apple_service_connection: self.apple_service_connection,
            register_test_devices: self.register_test_devices,
            min_profile_validity: self.min_profile_validity,
            sign_uitest_targets: self.sign_uitest_targets,
            certificate_url_list: self.certificate_url_list.unwrap_or_default(),
            passphrase_list: Secret::new(self.passphrase_list.unwrap_or_default()),
            keychain_path: self.keychain_path.unwrap_or_default(),
            keychain_password: Secret::new(self.keychain_password.unwrap_or_default()),
            build_url: self.build_url,
            build_api_token: self.build_api_token.map(Secret::new),
            api_key_path: self.api_key_path,
            api_key_id: self.api_key_id,
            api_issuer: self.api_issuer,
            team_id: self.team_id,
            verbose_log: self.verbose_log,
        }
    }
}

async fn load_config(cli: Cli) -> Result<(Config, ExportWith)> {
    let export_with = cli.export_with;
    let Some(path) = cli.config.clone() else {
        return Ok((cli.into_config(), export_with));
    };

    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| AutoCodesignError::Configuration(format!("{}: {e}", path.display())))?;
    Ok((config, export_with))
}

async fn run(config: Config, export_with: ExportWith, logger: &Logger) -> Result<()> {
    let inputs = config.validate()?;
    logger.info(format!("Distribution method: {}", inputs.distribution));
    logger.info(format!("Connection: {}", inputs.connection_type));
    logger.info(format!("Certificates: {}", inputs.certificates.len()));

    let project = XcodeProject::new(
        &config.project_path,
        config.scheme.clone(),
        config.configuration.clone(),
        *logger,
    )?;
    let connection = BitriseConnectionProvider::new(config.build_url.clone(), config.build_api_token.clone(), *logger);
    let downloader = HttpCertificateDownloader::new(inputs.certificates.clone(), *logger)?;
    let keychain = Keychain::new(&config.keychain_path, config.keychain_password.clone(), *logger)?;
    let portal = AppStoreConnectFactory::new(*logger);
    let sink: Box<dyn OutputSink> = match export_with {
        ExportWith::Envman => Box::new(EnvmanSink),
        ExportWith::Stdout => Box::new(StdoutSink),
    };

    let local_certificates = keychain
        .installed_certificates()
        .await
        .context("failed to read installed certificates")?;

    let collaborators = Collaborators {
        project: &project,
        connection: &connection,
        portal: &portal,
        downloader: &downloader,
        writer: &keychain,
        sink: sink.as_ref(),
    };
    kodegen_bundler_autocodesign::run(&inputs, local_certificates, &collaborators, logger).await?;

    logger.done("Code signing assets ensured");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose_log;

    let result = match load_config(cli).await {
        Ok((config, export_with)) => {
            let logger = Logger::new(verbose || config.verbose_log);
            run(config, export_with, &logger).await.map_err(|e| (e, logger))
        }
        Err(e) => Err((e, Logger::new(verbose))),
    };

    if let Err((e, logger)) = result {
        let stage = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<AutoCodesignError>())
            .map_or("setup", AutoCodesignError::stage);
        logger.error(format!("{stage} failed: {e:#}"));
        std::process::exit(1);
    }
}
