use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line interface for the gossip map server
#[derive(Parser, Debug, Clone)]
#[clap(
    name = "gossip-map",
    about = "A Rust web server that maps gossip network peers onto geographic coordinates",
    version
)]
pub struct Cli {
    /// Port to run the web server on
    #[clap(short, long, default_value = "8080")]
    pub port: u16,

    /// Discovery command producing the peer listing on stdout. Split
    /// on whitespace into program and arguments, with no shell
    /// quoting; wrap in `sh -c '...'` for anything fancier
    #[clap(long, env = "GOSSIP_COMMAND", default_value = "solana gossip -um")]
    pub gossip_command: String,

    /// Timeout for the discovery command in seconds
    #[clap(long, default_value = "30")]
    pub command_timeout: u64,

    /// Snapshot refresh interval in seconds
    #[clap(long, env = "CACHE_REFRESH_INTERVAL", default_value = "300")]
    pub refresh_interval: u64,

    /// Geo cache TTL in seconds (locations rarely change)
    #[clap(long, env = "GEO_CACHE_TTL", default_value = "2592000")]
    pub geo_ttl: u64,

    /// Minimum spacing between external geo lookups in milliseconds
    #[clap(long, default_value = "500")]
    pub geo_spacing_ms: u64,

    /// Timeout for a single geo lookup in seconds
    #[clap(long, default_value = "5")]
    pub geo_timeout: u64,

    /// Maximum number of concurrent geo resolutions
    #[clap(long, default_value = "8")]
    pub geo_concurrency: usize,

    /// Offline geo database file (JSON map of address to [lat, lon]);
    /// when set, no external geo API is contacted
    #[clap(long, env = "GEO_DATABASE")]
    pub geo_database: Option<PathBuf>,

    /// Redis URL for persisted caching (in-memory cache when unset)
    #[clap(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,
}

impl Cli {
    /// Get the discovery command timeout as a Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    /// Get the snapshot refresh interval as a Duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}
