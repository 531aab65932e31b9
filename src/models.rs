use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::node_cache::NodeCache;

/// Application state shared across API handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<NodeCache>,
}

/// Type alias for the application state that can be used with Axum
pub type SharedState = axum::extract::State<AppState>;

/// One peer as reported by the gossip discovery command.
///
/// Built fresh on every fetch cycle and never mutated afterwards; the
/// next cycle's records supersede it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipPeer {
    /// Peer IP address; also the key for geo lookups.
    pub address: String,
    /// Node identity pubkey as printed by the command.
    pub identity: String,
    #[serde(rename = "gossipEndpoint")]
    pub gossip_endpoint: Option<String>,
    #[serde(rename = "tpuEndpoint")]
    pub tpu_endpoint: Option<String>,
    /// Reported software version; `None` when the listing printed the
    /// absent sentinel.
    pub version: Option<String>,
}

/// Resolved (or provably unresolvable) location for one address.
///
/// A record with no coordinates is a valid negative-cache entry: it is
/// honored until its TTL expires so failing addresses are not retried
/// on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub address: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(rename = "resolvedAt")]
    pub resolved_at: DateTime<Utc>,
}

impl GeoRecord {
    pub fn located(address: &str, lat: f64, lon: f64) -> Self {
        Self {
            address: address.to_string(),
            lat: Some(lat),
            lon: Some(lon),
            resolved_at: Utc::now(),
        }
    }

    /// Negative-cache entry: lookup ran and produced nothing.
    pub fn unresolved(address: &str) -> Self {
        Self {
            address: address.to_string(),
            lat: None,
            lon: None,
            resolved_at: Utc::now(),
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.resolved_at);
        age.num_milliseconds() < ttl.as_millis() as i64
    }

    /// Both coordinates or neither; zero is a real coordinate and is
    /// never used as a missing-value stand-in.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// A gossip peer merged with its resolved coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedNode {
    pub address: String,
    pub identity: String,
    #[serde(rename = "gossipEndpoint")]
    pub gossip_endpoint: Option<String>,
    #[serde(rename = "tpuEndpoint")]
    pub tpu_endpoint: Option<String>,
    pub version: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(rename = "observedAt")]
    pub observed_at: DateTime<Utc>,
}

/// The cached serving unit: every enriched node from one refresh cycle,
/// in the order the discovery command listed them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: Vec<EnrichedNode>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl Snapshot {
    pub fn is_stale(&self, refresh_interval: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_updated);
        age.num_milliseconds() >= refresh_interval.as_millis() as i64
    }
}

/// Response from the ip-api.com geo endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoApiResponse {
    pub status: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Payload of the node-listing endpoint. `populated` is false only
/// before the first successful refresh.
#[derive(Debug, Clone, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<EnrichedNode>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<DateTime<Utc>>,
    pub populated: bool,
}

/// Aggregate counters over the current snapshot
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub total_nodes: usize,
    pub located_nodes: usize,
    pub versions: Vec<VersionCount>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<DateTime<Utc>>,
    pub populated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionCount {
    pub version: String,
    pub count: usize,
}
