use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::{GeoApiResponse, GeoRecord};
use crate::store::{geo_key, KvStore};

/// Lookup backend mapping an address to coordinates. `Ok(None)` means
/// the backend answered but knows nothing about the address.
#[async_trait]
pub trait GeoBackend: Send + Sync {
    async fn lookup(&self, address: &str) -> Result<Option<(f64, f64)>, AppError>;
}

/// Remote lookups against ip-api.com
pub struct IpApiBackend {
    client: Client,
}

impl IpApiBackend {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Request(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GeoBackend for IpApiBackend {
    async fn lookup(&self, address: &str) -> Result<Option<(f64, f64)>, AppError> {
        let url = format!("http://ip-api.com/json/{}?fields=status,lat,lon", address);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::Request(format!("Geo API request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Request(format!(
                "Geo API returned error status: {}",
                response.status()
            )));
        }

        let geo: GeoApiResponse = response
            .json()
            .await
            .map_err(|e| AppError::Request(format!("Failed to parse geo API response: {}", e)))?;

        if geo.status != "success" {
            return Ok(None);
        }

        match (geo.lat, geo.lon) {
            (Some(lat), Some(lon)) => Ok(Some((lat, lon))),
            _ => Ok(None),
        }
    }
}

/// Offline lookups from a JSON file mapping address to `[lat, lon]`
pub struct FileBackend {
    entries: HashMap<String, (f64, f64)>,
}

impl FileBackend {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read geo database {}: {}",
                path.display(),
                e
            ))
        })?;

        let entries: HashMap<String, (f64, f64)> = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!(
                "Failed to parse geo database {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::info!("Loaded {} entries from geo database", entries.len());
        Ok(Self { entries })
    }
}

#[async_trait]
impl GeoBackend for FileBackend {
    async fn lookup(&self, address: &str) -> Result<Option<(f64, f64)>, AppError> {
        Ok(self.entries.get(address).copied())
    }
}

/// Spaces external calls so at most one starts per interval while the
/// calls themselves may overlap. Callers claim the next free slot and
/// sleep until it comes up.
pub struct Pacer {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        if self.interval.is_zero() {
            return;
        }

        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = if *next > now { *next } else { now };
            *next = slot + self.interval;
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}

/// Cache-first resolver. Lookup failures are absorbed into negative
/// cache entries so a flaky backend degrades peers to "no location"
/// instead of failing the refresh.
pub struct GeoResolver {
    backend: Arc<dyn GeoBackend>,
    store: Arc<dyn KvStore>,
    ttl: Duration,
    lookup_timeout: Duration,
    pacer: Pacer,
}

impl GeoResolver {
    pub fn new(
        backend: Arc<dyn GeoBackend>,
        store: Arc<dyn KvStore>,
        ttl: Duration,
        lookup_timeout: Duration,
        spacing: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            ttl,
            lookup_timeout,
            pacer: Pacer::new(spacing),
        }
    }

    pub async fn resolve(&self, address: &str) -> GeoRecord {
        if let Some(record) = self.cached(address).await {
            if record.is_fresh(self.ttl) {
                return record;
            }
        }

        self.pacer.wait_turn().await;

        let looked_up =
            tokio::time::timeout(self.lookup_timeout, self.backend.lookup(address)).await;

        let record = match looked_up {
            Ok(Ok(Some((lat, lon)))) => GeoRecord::located(address, lat, lon),
            Ok(Ok(None)) => {
                tracing::debug!("No location known for {}", address);
                GeoRecord::unresolved(address)
            }
            Ok(Err(e)) => {
                tracing::warn!("Geo lookup failed for {}: {}", address, e);
                GeoRecord::unresolved(address)
            }
            Err(_) => {
                tracing::warn!(
                    "Geo lookup for {} timed out after {:?}",
                    address,
                    self.lookup_timeout
                );
                GeoRecord::unresolved(address)
            }
        };

        self.remember(&record).await;
        record
    }

    /// Store failures degrade to an uncached lookup, never to a
    /// resolution error.
    async fn cached(&self, address: &str) -> Option<GeoRecord> {
        match self.store.get(&geo_key(address)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Discarding unreadable geo record for {}: {}", address, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Geo cache read failed for {}: {}", address, e);
                None
            }
        }
    }

    async fn remember(&self, record: &GeoRecord) {
        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Failed to serialize geo record for {}: {}", record.address, e);
                return;
            }
        };

        if let Err(e) = self.store.set(&geo_key(&record.address), &raw, Some(self.ttl)).await {
            tracing::warn!("Geo cache write failed for {}: {}", record.address, e);
        }
    }
}
