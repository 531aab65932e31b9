use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

use crate::error::AppError;
use crate::models::GossipPeer;

/// Summary line the discovery command appends after the listing
const HEADER_TOKEN: &str = "Nodes:";

/// Column header of the tabular listing format
const COLUMN_HEADER: &str = "IP Address";

/// Minimum whitespace-separated fields for a usable peer line
const MIN_FIELDS: usize = 4;

/// Version tokens meaning "no version reported"
const VERSION_SENTINELS: [&str; 2] = ["none", "-"];

/// Source of raw peer records, injectable so the cache can be tested
/// without shelling out.
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<GossipPeer>, AppError>;
}

/// Runs the configured gossip discovery command and parses its output.
///
/// The command string is split on whitespace into program and
/// arguments; there is no shell involved, so quoting is not
/// interpreted. Arguments with embedded spaces need a `sh -c` wrapper.
pub struct GossipCommandSource {
    command: String,
    timeout: Duration,
}

impl GossipCommandSource {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PeerSource for GossipCommandSource {
    async fn fetch(&self) -> Result<Vec<GossipPeer>, AppError> {
        let mut tokens = self.command.split_whitespace();
        let program = tokens
            .next()
            .ok_or_else(|| AppError::Dependency("empty discovery command".to_string()))?;

        tracing::debug!("Running discovery command: {}", self.command);

        let output = tokio::time::timeout(self.timeout, Command::new(program).args(tokens).output())
            .await
            .map_err(|_| {
                AppError::Dependency(format!(
                    "discovery command timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| AppError::Dependency(format!("failed to run discovery command: {}", e)))?;

        if !output.status.success() {
            return Err(AppError::Dependency(format!(
                "discovery command exited with {}",
                output.status
            )));
        }

        // The command writes diagnostics to stderr only when something
        // went wrong; treat any stderr output as a total failure.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            return Err(AppError::Dependency(format!(
                "discovery command reported: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(AppError::Dependency(
                "discovery command produced no output".to_string(),
            ));
        }

        parse_peer_listing(&stdout)
    }
}

/// Parse the full peer listing. One malformed line never aborts the
/// fetch; zero usable lines from an otherwise successful command is a
/// format-contract break and surfaces as a parse error.
pub fn parse_peer_listing(listing: &str) -> Result<Vec<GossipPeer>, AppError> {
    let mut peers = Vec::new();

    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() || is_header_line(line) {
            continue;
        }

        match parse_peer_line(line) {
            Some(peer) => peers.push(peer),
            None => tracing::warn!("Skipping malformed gossip line: {}", line),
        }
    }

    if peers.is_empty() {
        return Err(AppError::Parse(
            "discovery output contained no usable peer lines".to_string(),
        ));
    }

    tracing::debug!("Parsed {} peers from discovery output", peers.len());
    Ok(peers)
}

fn is_header_line(line: &str) -> bool {
    line.starts_with(HEADER_TOKEN)
        || line.starts_with(COLUMN_HEADER)
        || line
            .chars()
            .all(|c| c == '-' || c == '+' || c == '|' || c.is_whitespace())
}

/// Fixed-arity rule: tokens 0..4 are address, identity, gossip port and
/// TPU port; everything after is version text.
fn parse_peer_line(line: &str) -> Option<GossipPeer> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < MIN_FIELDS {
        return None;
    }

    let address = tokens[0].to_string();
    let gossip_endpoint = parse_endpoint(&address, tokens[2]);
    let tpu_endpoint = parse_endpoint(&address, tokens[3]);

    Some(GossipPeer {
        identity: tokens[1].to_string(),
        gossip_endpoint,
        tpu_endpoint,
        version: normalize_version(&tokens[4..]),
        address,
    })
}

fn parse_endpoint(address: &str, port: &str) -> Option<String> {
    port.parse::<u16>()
        .ok()
        .map(|port| format!("{}:{}", address, port))
}

fn normalize_version(tokens: &[&str]) -> Option<String> {
    if tokens.is_empty() {
        return None;
    }
    let joined = tokens.join(" ");
    if VERSION_SENTINELS.contains(&joined.as_str()) {
        None
    } else {
        Some(joined)
    }
}
