use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;
use crate::error::AppError;

/// Which geo lookup backend the resolver talks to
#[derive(Debug, Clone)]
pub enum GeoBackendKind {
    /// Remote ip-api.com lookups, subject to pacing
    IpApi,
    /// Offline JSON database, no network calls
    File(PathBuf),
}

/// Runtime settings assembled from the CLI
#[derive(Debug, Clone)]
pub struct Config {
    pub gossip_command: String,
    pub command_timeout: Duration,
    pub refresh_interval: Duration,
    pub geo_ttl: Duration,
    pub geo_spacing: Duration,
    pub geo_timeout: Duration,
    pub geo_concurrency: usize,
    pub geo_backend: GeoBackendKind,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, AppError> {
        if cli.gossip_command.trim().is_empty() {
            return Err(AppError::Config(
                "discovery command must not be empty".to_string(),
            ));
        }

        if cli.geo_concurrency == 0 {
            return Err(AppError::Config(
                "geo concurrency must be at least 1".to_string(),
            ));
        }

        let geo_backend = match &cli.geo_database {
            Some(path) => GeoBackendKind::File(path.clone()),
            None => GeoBackendKind::IpApi,
        };

        // The offline database needs no pacing; spacing only guards the
        // external HTTP API.
        let geo_spacing = match geo_backend {
            GeoBackendKind::File(_) => Duration::ZERO,
            GeoBackendKind::IpApi => Duration::from_millis(cli.geo_spacing_ms),
        };

        Ok(Config {
            gossip_command: cli.gossip_command.clone(),
            command_timeout: cli.command_timeout(),
            refresh_interval: cli.refresh_interval(),
            geo_ttl: Duration::from_secs(cli.geo_ttl),
            geo_spacing,
            geo_timeout: Duration::from_secs(cli.geo_timeout),
            geo_concurrency: cli.geo_concurrency,
            geo_backend,
        })
    }
}
