use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::error::AppError;
use crate::geo::GeoResolver;
use crate::gossip::PeerSource;
use crate::models::{EnrichedNode, GeoRecord, GossipPeer, Snapshot};
use crate::store::{KvStore, SNAPSHOT_KEY};

/// Orchestrates the fetch → enrich → cache pipeline around one
/// snapshot.
///
/// Refresh is lazy: a read that finds the snapshot missing or older
/// than the refresh interval triggers it, serialized through a guard so
/// concurrent stale readers share a single fetch. A failed refresh
/// never disturbs the previous snapshot; availability wins over
/// freshness.
pub struct NodeCache {
    source: Arc<dyn PeerSource>,
    resolver: GeoResolver,
    store: Arc<dyn KvStore>,
    refresh_interval: Duration,
    concurrency: usize,
    snapshot: RwLock<Option<Snapshot>>,
    /// Completion time of the most recent refresh attempt, successful
    /// or not. Guarded data doubles as the single-flight lock.
    refresh_guard: Mutex<Option<Instant>>,
}

impl NodeCache {
    pub fn new(
        source: Arc<dyn PeerSource>,
        resolver: GeoResolver,
        store: Arc<dyn KvStore>,
        refresh_interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            resolver,
            store,
            refresh_interval,
            concurrency: concurrency.max(1),
            snapshot: RwLock::new(None),
            refresh_guard: Mutex::new(None),
        }
    }

    /// Restore a previously persisted snapshot into the in-memory
    /// mirror so a restart can serve immediately.
    pub async fn warm(&self) {
        match self.store.get(SNAPSHOT_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<Snapshot>(&raw) {
                Ok(snapshot) => {
                    tracing::info!(
                        "Restored snapshot with {} nodes from cache store",
                        snapshot.nodes.len()
                    );
                    *self.snapshot.write().await = Some(snapshot);
                }
                Err(e) => tracing::warn!("Discarding unreadable persisted snapshot: {}", e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Snapshot restore failed: {}", e),
        }
    }

    /// Current snapshot, refreshed first when stale. `None` only before
    /// the first successful refresh ever.
    pub async fn get(&self) -> Option<Snapshot> {
        if let Some(snapshot) = self.current_if_fresh().await {
            return Some(snapshot);
        }

        let arrived = Instant::now();

        // One refresh in flight at a time; whoever holds the guard does
        // the work and everyone queued behind it takes that attempt's
        // outcome. A failed attempt counts too, so a burst of stale
        // readers during an outage still means one fetch.
        let mut last_attempt = self.refresh_guard.lock().await;
        if let Some(snapshot) = self.current_if_fresh().await {
            return Some(snapshot);
        }
        if last_attempt.map_or(false, |at| at >= arrived) {
            return self.snapshot.read().await.clone();
        }

        let outcome = self.refresh().await;
        *last_attempt = Some(Instant::now());

        match outcome {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                let previous = self.snapshot.read().await.clone();
                match previous {
                    Some(snapshot) => {
                        tracing::warn!(
                            "Refresh failed, serving stale snapshot from {}: {}",
                            snapshot.last_updated,
                            e
                        );
                        Some(snapshot)
                    }
                    None => {
                        tracing::error!("Refresh failed with no prior snapshot: {}", e);
                        None
                    }
                }
            }
        }
    }

    async fn current_if_fresh(&self) -> Option<Snapshot> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .as_ref()
            .filter(|s| !s.is_stale(self.refresh_interval))
            .cloned()
    }

    async fn refresh(&self) -> Result<Snapshot, AppError> {
        let started = Instant::now();

        let peers = self.source.fetch().await?;
        let locations = self.locate(&peers).await;

        let observed_at = Utc::now();
        let located = peers
            .iter()
            .filter(|p| {
                locations
                    .get(&p.address)
                    .and_then(|r| r.coordinates())
                    .is_some()
            })
            .count();

        // Coordinates are joined back by address, so resolution
        // completion order never reorders the peer list.
        let nodes = peers
            .into_iter()
            .map(|peer| {
                let coords = locations.get(&peer.address).and_then(|r| r.coordinates());
                EnrichedNode {
                    address: peer.address,
                    identity: peer.identity,
                    gossip_endpoint: peer.gossip_endpoint,
                    tpu_endpoint: peer.tpu_endpoint,
                    version: peer.version,
                    lat: coords.map(|c| c.0),
                    lon: coords.map(|c| c.1),
                    observed_at,
                }
            })
            .collect();

        let snapshot = Snapshot {
            nodes,
            last_updated: observed_at,
        };

        self.persist(&snapshot).await;
        *self.snapshot.write().await = Some(snapshot.clone());

        tracing::info!(
            "Refreshed snapshot: {} nodes ({} located) in {:?}",
            snapshot.nodes.len(),
            located,
            started.elapsed()
        );

        Ok(snapshot)
    }

    /// Resolve every distinct address with bounded concurrency.
    async fn locate(&self, peers: &[GossipPeer]) -> HashMap<String, GeoRecord> {
        let mut addresses: Vec<String> = peers.iter().map(|p| p.address.clone()).collect();
        addresses.sort();
        addresses.dedup();

        stream::iter(addresses)
            .map(|address| {
                let resolver = &self.resolver;
                async move {
                    let record = resolver.resolve(&address).await;
                    (address, record)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<HashMap<_, _>>()
            .await
    }

    /// Persisting is best effort; the in-memory snapshot is
    /// authoritative within the process lifetime.
    async fn persist(&self, snapshot: &Snapshot) {
        let raw = match serde_json::to_string(snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Failed to serialize snapshot: {}", e);
                return;
            }
        };

        if let Err(e) = self.store.set(SNAPSHOT_KEY, &raw, None).await {
            tracing::warn!("Failed to persist snapshot: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoBackend;
    use crate::gossip::parse_peer_listing;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted peer source: pops one pre-programmed result per fetch.
    struct StubSource {
        calls: AtomicUsize,
        delay: Duration,
        results: Mutex<VecDeque<Result<Vec<GossipPeer>, AppError>>>,
    }

    impl StubSource {
        fn new(results: Vec<Result<Vec<GossipPeer>, AppError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                results: Mutex::new(results.into()),
            })
        }

        fn slow(results: Vec<Result<Vec<GossipPeer>, AppError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                results: Mutex::new(results.into()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PeerSource for StubSource {
        async fn fetch(&self) -> Result<Vec<GossipPeer>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.results
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(AppError::Dependency("script exhausted".to_string())))
        }
    }

    /// Backend with fixed coordinates per address; unknown addresses
    /// fail the lookup.
    struct MapBackend {
        coords: HashMap<String, (f64, f64)>,
    }

    impl MapBackend {
        fn new(entries: &[(&str, f64, f64)]) -> Arc<Self> {
            Arc::new(Self {
                coords: entries
                    .iter()
                    .map(|(a, lat, lon)| (a.to_string(), (*lat, *lon)))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl GeoBackend for MapBackend {
        async fn lookup(&self, address: &str) -> Result<Option<(f64, f64)>, AppError> {
            match self.coords.get(address) {
                Some(coords) => Ok(Some(*coords)),
                None => Err(AppError::Dependency(format!("no route to {}", address))),
            }
        }
    }

    fn cache_with(
        source: Arc<StubSource>,
        backend: Arc<MapBackend>,
        refresh_interval: Duration,
    ) -> NodeCache {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let resolver = GeoResolver::new(
            backend,
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
            Duration::ZERO,
        );
        NodeCache::new(source, resolver, store, refresh_interval, 4)
    }

    fn peers(addresses: &[&str]) -> Vec<GossipPeer> {
        addresses
            .iter()
            .map(|a| GossipPeer {
                address: a.to_string(),
                identity: format!("id-{}", a),
                gossip_endpoint: Some(format!("{}:8000", a)),
                tpu_endpoint: Some(format!("{}:8001", a)),
                version: Some("1.18.0".to_string()),
            })
            .collect()
    }

    #[tokio::test]
    async fn unpopulated_before_first_success() {
        let source = StubSource::new(vec![Err(AppError::Dependency("down".to_string()))]);
        let cache = cache_with(source, MapBackend::new(&[]), Duration::from_secs(60));

        assert_eq!(cache.get().await, None);
    }

    #[tokio::test]
    async fn failed_refresh_serves_prior_snapshot_unchanged() {
        let source = StubSource::new(vec![
            Ok(peers(&["203.0.113.1"])),
            Err(AppError::Dependency("down".to_string())),
        ]);
        // zero interval: every read sees a stale snapshot
        let cache = cache_with(
            source.clone(),
            MapBackend::new(&[("203.0.113.1", 1.0, 2.0)]),
            Duration::ZERO,
        );

        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();

        assert_eq!(source.calls(), 2);
        assert_eq!(second.last_updated, first.last_updated);
        assert_eq!(second.nodes, first.nodes);
    }

    #[tokio::test]
    async fn fresh_snapshot_is_served_without_fetching() {
        let source = StubSource::new(vec![Ok(peers(&["203.0.113.1"]))]);
        let cache = cache_with(
            source.clone(),
            MapBackend::new(&[("203.0.113.1", 1.0, 2.0)]),
            Duration::from_secs(60),
        );

        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_stale_reads_share_one_fetch() {
        let source = StubSource::slow(
            vec![Ok(peers(&["203.0.113.1", "203.0.113.2"]))],
            Duration::from_millis(50),
        );
        let cache = Arc::new(cache_with(
            source.clone(),
            MapBackend::new(&[("203.0.113.1", 1.0, 2.0), ("203.0.113.2", 3.0, 4.0)]),
            Duration::from_secs(60),
        ));

        let reads = (0..8).map(|_| {
            let cache = cache.clone();
            async move { cache.get().await }
        });
        let results = join_all(reads).await;

        assert_eq!(source.calls(), 1);
        let first = results[0].clone().unwrap();
        for result in results {
            assert_eq!(result.unwrap(), first);
        }
    }

    #[tokio::test]
    async fn concurrent_stale_reads_share_one_failed_fetch() {
        // An hour-old snapshot restored from the store, and a source
        // that is down: a burst of readers must trigger exactly one
        // fetch attempt and all fall back to the stale snapshot.
        let stale = Snapshot {
            nodes: peers(&["203.0.113.1"])
                .into_iter()
                .map(|p| EnrichedNode {
                    address: p.address,
                    identity: p.identity,
                    gossip_endpoint: p.gossip_endpoint,
                    tpu_endpoint: p.tpu_endpoint,
                    version: p.version,
                    lat: Some(1.0),
                    lon: Some(2.0),
                    observed_at: Utc::now() - chrono::Duration::hours(1),
                })
                .collect(),
            last_updated: Utc::now() - chrono::Duration::hours(1),
        };

        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store
            .set(SNAPSHOT_KEY, &serde_json::to_string(&stale).unwrap(), None)
            .await
            .unwrap();

        // empty script: every fetch fails, slowly enough to overlap
        let source = StubSource::slow(vec![], Duration::from_millis(50));
        let resolver = GeoResolver::new(
            MapBackend::new(&[]),
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
            Duration::ZERO,
        );
        let cache = Arc::new(NodeCache::new(
            source.clone(),
            resolver,
            store,
            Duration::from_secs(60),
            4,
        ));
        cache.warm().await;

        let reads = (0..8).map(|_| {
            let cache = cache.clone();
            async move { cache.get().await }
        });
        let results = join_all(reads).await;

        assert_eq!(source.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap().last_updated, stale.last_updated);
        }
    }

    #[tokio::test]
    async fn peer_order_survives_concurrent_resolution() {
        let addresses = [
            "203.0.113.9",
            "203.0.113.1",
            "203.0.113.5",
            "203.0.113.3",
            "203.0.113.7",
        ];
        let coords: Vec<(&str, f64, f64)> =
            addresses.iter().map(|a| (*a, 1.0, 2.0)).collect();

        let source = StubSource::new(vec![Ok(peers(&addresses))]);
        let cache = cache_with(source, MapBackend::new(&coords), Duration::from_secs(60));

        let snapshot = cache.get().await.unwrap();
        let served: Vec<&str> = snapshot.nodes.iter().map(|n| n.address.as_str()).collect();
        assert_eq!(served, addresses);
    }

    #[tokio::test]
    async fn warm_restores_persisted_snapshot() {
        let source = StubSource::new(vec![Ok(peers(&["203.0.113.1"]))]);
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let resolver = GeoResolver::new(
            MapBackend::new(&[("203.0.113.1", 1.0, 2.0)]),
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
            Duration::ZERO,
        );
        let cache = NodeCache::new(source, resolver, store.clone(), Duration::from_secs(60), 4);
        let snapshot = cache.get().await.unwrap();

        // a second cache over the same store starts out already serving
        let source2 = StubSource::new(vec![]);
        let resolver2 = GeoResolver::new(
            MapBackend::new(&[]),
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
            Duration::ZERO,
        );
        let cache2 = NodeCache::new(source2.clone(), resolver2, store, Duration::from_secs(60), 4);
        cache2.warm().await;

        assert_eq!(cache2.get().await.unwrap(), snapshot);
        assert_eq!(source2.calls(), 0);
    }

    #[tokio::test]
    async fn mixed_resolution_yields_partial_coordinates() {
        // Discovery output straight from the wire format: the second
        // peer reports no version and its address does not resolve.
        let listing =
            "203.0.113.5 abc123 8000 8001 1.18.0\n203.0.113.9 def456 8000 8001 none\n";
        let source = StubSource::new(vec![parse_peer_listing(listing)]);
        let cache = cache_with(
            source,
            MapBackend::new(&[("203.0.113.5", 37.77, -122.41)]),
            Duration::from_secs(60),
        );

        let snapshot = cache.get().await.unwrap();
        assert_eq!(snapshot.nodes.len(), 2);

        let located = &snapshot.nodes[0];
        assert_eq!(located.address, "203.0.113.5");
        assert_eq!(located.version.as_deref(), Some("1.18.0"));
        assert_eq!(located.lat, Some(37.77));
        assert_eq!(located.lon, Some(-122.41));

        let unlocated = &snapshot.nodes[1];
        assert_eq!(unlocated.address, "203.0.113.9");
        assert_eq!(unlocated.version, None);
        assert_eq!(unlocated.lat, None);
        assert_eq!(unlocated.lon, None);
    }
}
