//! dockhand keeps a Docker host's containers and stacks on fresh images.
//!
//! A single long-running process with no subcommands. Every knob is an
//! environment variable (with a flag twin for ad-hoc runs); the daemon
//! exits non-zero only when the configuration is invalid or the Docker
//! engine is unreachable at startup.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::info;
use update_engine::{
    EngineClient, EngineSettings, PortainerAuth, PortainerClient, PortainerConfig, UpdateEngine,
    UpdateMode,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// One of INTERVAL, DAILY, WEEKLY, MONTHLY.
    #[arg(long, env = "UPDATE_MODE", default_value = "INTERVAL")]
    update_mode: String,

    /// Cycle spacing in interval mode, e.g. 30s, 10m, 2h, 1d.
    #[arg(long, env = "UPDATE_INTERVAL", default_value = "10m")]
    update_interval: String,

    /// Wall-clock HH:MM for daily/weekly/monthly modes (local time).
    #[arg(long, env = "UPDATE_TIME", default_value = "03:00")]
    update_time: String,

    /// Weekday name (weekly) or day of month (monthly).
    #[arg(long, env = "UPDATE_DAY", default_value = "1")]
    update_day: String,

    /// Comma-separated substrings; matches against image references and
    /// container names exclude them from updates.
    #[arg(long, env = "EXCLUDE_IMAGES", default_value = "")]
    exclude_images: String,

    /// Days a backup tag is kept before pruning.
    #[arg(long, env = "BACKUP_RETENTION_DAYS", default_value = "5")]
    backup_retention_days: u64,

    /// Seconds a replaced container is observed before committing.
    #[arg(long, env = "CONTAINER_CHECK_SECONDS", default_value = "10")]
    container_check_seconds: u64,

    /// Ask the registry for the remote digest before pulling.
    #[arg(long, env = "REGISTRY_CHECK", default_value = "false")]
    registry_check: bool,

    /// Portainer base URL; enables the stack phase.
    #[arg(long, env = "PORTAINER_URL")]
    portainer_url: Option<String>,

    #[arg(long, env = "PORTAINER_API_KEY")]
    portainer_api_key: Option<String>,

    #[arg(long, env = "PORTAINER_USERNAME")]
    portainer_username: Option<String>,

    #[arg(long, env = "PORTAINER_PASSWORD")]
    portainer_password: Option<String>,

    /// Accept self-signed certificates from Portainer.
    #[arg(long, env = "PORTAINER_INSECURE_TLS", default_value = "false")]
    portainer_insecure_tls: bool,
}

impl Args {
    fn engine_settings(&self) -> Result<EngineSettings> {
        if self.backup_retention_days == 0 {
            bail!("BACKUP_RETENTION_DAYS must be greater than zero");
        }
        if self.container_check_seconds == 0 {
            bail!("CONTAINER_CHECK_SECONDS must be greater than zero");
        }
        Ok(EngineSettings {
            exclude_patterns: self
                .exclude_images
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            backup_retention: Duration::from_secs(self.backup_retention_days * 24 * 60 * 60),
            health_window: Duration::from_secs(self.container_check_seconds),
            registry_check: self.registry_check,
        })
    }

    fn portainer_config(&self) -> Result<Option<PortainerConfig>> {
        let Some(url) = &self.portainer_url else {
            return Ok(None);
        };
        let auth = if let Some(key) = &self.portainer_api_key {
            PortainerAuth::ApiKey(key.clone())
        } else if let (Some(username), Some(password)) =
            (&self.portainer_username, &self.portainer_password)
        {
            PortainerAuth::Credentials {
                username: username.clone(),
                password: password.clone(),
            }
        } else {
            bail!("PORTAINER_URL is set but neither PORTAINER_API_KEY nor PORTAINER_USERNAME/PORTAINER_PASSWORD are");
        };
        Ok(Some(PortainerConfig {
            url: url.clone(),
            auth,
            insecure_tls: self.portainer_insecure_tls,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,update_engine=debug".into()),
        )
        .init();

    let args = Args::parse();

    let mode = UpdateMode::from_settings(
        &args.update_mode,
        &args.update_interval,
        &args.update_time,
        &args.update_day,
    )
    .context("invalid schedule configuration")?;
    let settings = args.engine_settings()?;

    let portainer = match args.portainer_config()? {
        Some(config) => {
            info!(url = %config.url, "stack phase enabled");
            Some(PortainerClient::new(&config).context("cannot build Portainer client")?)
        }
        None => None,
    };

    let engine = EngineClient::connect()
        .await
        .context("cannot reach the Docker engine")?;
    info!("connected to the Docker engine");

    let mut update_engine = UpdateEngine::new(engine, portainer, settings);
    info!(?mode, "starting update cycles");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = update_engine.run_cycle() => {}
        }

        let delay = mode.delay_from_now();
        info!(seconds = delay.as_secs(), "cycle finished, sleeping");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("stopped");
    Ok(())
}
