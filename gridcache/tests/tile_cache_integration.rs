//! Integration tests for the tile cache.
//!
//! These tests drive `TileService` end to end against an in-process search
//! backend:
//! - cold request → live query + background population → cached serve
//! - concurrent population runs → a single aggregation fetch
//! - oversized grids → no fetch, now or before the marker expires
//! - count deduplication across services sharing a coordination store
//!
//! Run with: `cargo test --test tile_cache_integration`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use gridcache::backend::{BackendError, SearchBackend, SearchOptions, SearchResponse};
use gridcache::cache::{CacheStore, DEFAULT_DATA_TTL, DEFAULT_LOCK_TTL};
use gridcache::geo;
use gridcache::pipeline::PopulationOutcome;
use gridcache::query::DEFAULT_CACHE_BUCKET_SIZE;
use gridcache::request::TileRequest;
use gridcache::reservation::ReservationConfig;
use gridcache::service::{RecordSource, ServiceContext, TileService};
use gridcache::store::{CoordinationStore, FileStore, MemoryStore};
use gridcache::BoxFuture;

// ============================================================================
// Test Backend
// ============================================================================

/// Search backend that answers every search with one canned grid response.
struct MockBackend {
    response: Value,
    count: u64,
    fetch_delay: Duration,
    count_delay: Duration,
    live_searches: AtomicUsize,
    cache_fetches: AtomicUsize,
    counts: AtomicUsize,
}

impl MockBackend {
    fn new(count: u64) -> Self {
        Self {
            response: grid_response(),
            count,
            fetch_delay: Duration::ZERO,
            count_delay: Duration::ZERO,
            live_searches: AtomicUsize::new(0),
            cache_fetches: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
        }
    }

    fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    fn with_count_delay(mut self, delay: Duration) -> Self {
        self.count_delay = delay;
        self
    }

    fn is_cache_fetch(body: &Value) -> bool {
        body["aggregations"]["zoom1"]["geohash_grid"]["size"] == json!(DEFAULT_CACHE_BUCKET_SIZE)
    }

    fn live_searches(&self) -> usize {
        self.live_searches.load(Ordering::SeqCst)
    }

    fn cache_fetches(&self) -> usize {
        self.cache_fetches.load(Ordering::SeqCst)
    }

    fn counts(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }
}

impl SearchBackend for MockBackend {
    fn search(&self, body: Value, _options: SearchOptions) -> BoxFuture<'_, Result<SearchResponse, BackendError>> {
        Box::pin(async move {
            if Self::is_cache_fetch(&body) {
                self.cache_fetches.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.fetch_delay).await;
            } else {
                self.live_searches.fetch_add(1, Ordering::SeqCst);
            }
            serde_json::from_value(self.response.clone()).map_err(|e| BackendError::Malformed(e.to_string()))
        })
    }

    fn count(&self, _body: Value, _options: SearchOptions) -> BoxFuture<'_, Result<u64, BackendError>> {
        Box::pin(async move {
            self.counts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.count_delay).await;
            Ok(self.count)
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

const PARIS: (f64, f64) = (2.35, 48.85);
const SAN_FRANCISCO: (f64, f64) = (-122.42, 37.77);

fn bucket(key: &str, id: u64, (lon, lat): (f64, f64)) -> Value {
    json!({
        "key": key,
        "doc_count": 1,
        "geohash": { "hits": { "total": { "value": 1 }, "hits": [
            { "_id": id.to_string(), "_source": { "id": id, "location": { "lat": lat, "lon": lon } }, "sort": [id] }
        ] } }
    })
}

fn grid_response() -> Value {
    json!({
        "hits": { "total": { "value": 2, "relation": "eq" }, "hits": [] },
        "aggregations": { "zoom1": { "buckets": [
            bucket("u09t", 1, PARIS),
            bucket("9q8y", 2, SAN_FRANCISCO),
        ] } }
    })
}

/// Cache-eligible geohash request for the tile containing Paris.
fn paris_request(zoom: u8) -> TileRequest {
    let tile = geo::tile_for_point(PARIS.0, PARIS.1, zoom).unwrap();
    TileRequest::builder("geohash", zoom as i64, tile.x as i64, tile.y as i64, "png")
        .param("taxon_id", "47")
        .param("cache", "true")
        .build()
        .unwrap()
}

fn make_service(backend: &Arc<MockBackend>, root: &TempDir, coordination: Arc<dyn CoordinationStore>) -> TileService {
    let context = ServiceContext::new(backend.clone(), coordination)
        .with_cache(CacheStore::new(root.path(), DEFAULT_DATA_TTL, DEFAULT_LOCK_TTL))
        .with_reservations(ReservationConfig::default().with_poll_interval(Duration::from_millis(5)));
    TileService::new(context)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_cold_request_goes_live_then_serves_from_cache() {
    let root = TempDir::new().unwrap();
    let backend = Arc::new(MockBackend::new(2));
    let service = make_service(&backend, &root, Arc::new(MemoryStore::new()));
    let request = paris_request(10);

    let first = service.records_for(&request).await.unwrap();
    assert_eq!(first.source, RecordSource::Live);
    assert!(service.shutdown(Duration::from_secs(10)).await, "population did not finish");
    assert_eq!(backend.cache_fetches(), 1);
    assert_eq!(backend.live_searches(), 1);

    let second = service.records_for(&request).await.unwrap();
    assert_eq!(second.source, RecordSource::Cached);
    assert_eq!(second.records.len(), 1);
    assert_eq!(second.records[0].get("id"), Some(&json!(1)));
    assert_eq!(backend.live_searches(), 1, "cached serve must not query the backend");
    assert_eq!(backend.cache_fetches(), 1);

    let snapshot = service.metrics().snapshot();
    assert_eq!(snapshot.cache_hits, 1);
    assert_eq!(snapshot.cache_misses, 1);
    assert_eq!(snapshot.populations_completed, 1);
}

#[tokio::test]
async fn test_cached_empty_cell_is_not_a_miss() {
    let root = TempDir::new().unwrap();
    let backend = Arc::new(MockBackend::new(2));
    let service = make_service(&backend, &root, Arc::new(MemoryStore::new()));

    let populated = service.populate(&paris_request(6)).await.unwrap();
    assert!(populated.is_populated(), "{:?}", populated);

    // Same fingerprint and zoom, a tile with no records.
    let empty = TileRequest::builder("geohash", 6, 0, 0, "png")
        .param("taxon_id", "47")
        .param("cache", "true")
        .build()
        .unwrap();
    let tile = service.records_for(&empty).await.unwrap();
    assert_eq!(tile.source, RecordSource::Cached);
    assert!(tile.records.is_empty());
    assert_eq!(backend.live_searches(), 0);
}

#[tokio::test]
async fn test_concurrent_populations_fetch_once() {
    let root = TempDir::new().unwrap();
    let backend = Arc::new(MockBackend::new(2).with_fetch_delay(Duration::from_millis(100)));
    let request = paris_request(5);

    // Independent services model independent server processes sharing the
    // cache volume.
    let services: Vec<TileService> = (0..4)
        .map(|_| make_service(&backend, &root, Arc::new(MemoryStore::new())))
        .collect();
    let outcomes = futures::future::join_all(services.iter().map(|s| s.populate(&request))).await;
    let outcomes: Vec<PopulationOutcome> = outcomes.into_iter().map(Option::unwrap).collect();

    assert_eq!(backend.cache_fetches(), 1);
    assert_eq!(outcomes.iter().filter(|o| matches!(o, PopulationOutcome::Populated { .. })).count(), 1);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        PopulationOutcome::Populated { .. } | PopulationOutcome::Locked | PopulationOutcome::AlreadyPopulated
    )));

    // Every caller eventually observes the populated grid.
    for service in &services {
        assert_eq!(service.populate(&request).await, Some(PopulationOutcome::AlreadyPopulated));
    }
    assert_eq!(backend.cache_fetches(), 1);
}

#[tokio::test]
async fn test_oversized_grid_is_never_fetched() {
    let root = TempDir::new().unwrap();
    let backend = Arc::new(MockBackend::new(3_000_000));
    let service = make_service(&backend, &root, Arc::new(MemoryStore::new()));
    let request = paris_request(6);

    assert_eq!(
        service.populate(&request).await,
        Some(PopulationOutcome::MarkedOversized { count: Some(3_000_000) })
    );

    // Later requests keep going live without another fetch attempt.
    for _ in 0..3 {
        let tile = service.records_for(&request).await.unwrap();
        assert_eq!(tile.source, RecordSource::Live);
    }
    assert!(service.shutdown(Duration::from_secs(10)).await);
    assert_eq!(backend.cache_fetches(), 0);
    assert_eq!(backend.live_searches(), 3);
    assert_eq!(service.metrics().snapshot().populations_oversized, 1);
}

#[tokio::test]
async fn test_counts_are_deduplicated_across_services() {
    let coordination_dir = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let backend = Arc::new(MockBackend::new(1234).with_count_delay(Duration::from_millis(100)));
    let request = paris_request(8);

    let services: Vec<TileService> = (0..4)
        .map(|_| {
            let store: Arc<dyn CoordinationStore> = Arc::new(FileStore::new(coordination_dir.path()));
            make_service(&backend, &root, store)
        })
        .collect();
    let totals = futures::future::join_all(services.iter().map(|s| s.total_hits(&request))).await;

    for total in totals {
        assert_eq!(total.unwrap(), 1234);
    }
    assert_eq!(backend.counts(), 1);

    // Reused afterwards without another count.
    assert_eq!(services[0].total_hits(&request).await.unwrap(), 1234);
    assert_eq!(backend.counts(), 1);
}

#[tokio::test]
async fn test_filters_do_not_share_cached_cells() {
    let root = TempDir::new().unwrap();
    let backend = Arc::new(MockBackend::new(2));
    let service = make_service(&backend, &root, Arc::new(MemoryStore::new()));

    let tile = geo::tile_for_point(PARIS.0, PARIS.1, 6).unwrap();
    let with_taxon = |taxon: u64| {
        TileRequest::builder("geohash", 6, tile.x as i64, tile.y as i64, "png")
            .param("quality_grade", "research")
            .param("cache", "true")
            .filter(json!({ "term": { "taxon_id": taxon } }))
            .build()
            .unwrap()
    };
    let taxon_47 = with_taxon(47);
    let taxon_3 = with_taxon(3);

    assert!(service.populate(&taxon_47).await.unwrap().is_populated());
    assert_eq!(service.records_for(&taxon_47).await.unwrap().source, RecordSource::Cached);

    // Same params, different filter: a separate grid, not taxon 47's cells.
    let other = service.records_for(&taxon_3).await.unwrap();
    assert_eq!(other.source, RecordSource::Live);
    assert_eq!(backend.live_searches(), 1);
    assert!(service.shutdown(Duration::from_secs(10)).await);
    assert_eq!(backend.cache_fetches(), 2);
    assert_eq!(backend.counts(), 2, "counts must not be shared across filters");
}

#[tokio::test]
async fn test_ineligible_request_skips_cache() {
    let root = TempDir::new().unwrap();
    let backend = Arc::new(MockBackend::new(2));
    let service = make_service(&backend, &root, Arc::new(MemoryStore::new()));

    // No `cache=true` opt-in.
    let tile = geo::tile_for_point(PARIS.0, PARIS.1, 4).unwrap();
    let request = TileRequest::builder("geohash", 4, tile.x as i64, tile.y as i64, "png")
        .param("taxon_id", "47")
        .build()
        .unwrap();
    let records = service.records_for(&request).await.unwrap();
    assert_eq!(records.source, RecordSource::Live);
    assert!(service.shutdown(Duration::from_secs(1)).await);
    assert_eq!(backend.cache_fetches(), 0);
    assert_eq!(service.pending_populations(), 0);
}
