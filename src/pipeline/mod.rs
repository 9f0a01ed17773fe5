//! # Resolution Pipeline
//!
//! Per record: normalize → cache lookup → geocode (structured, then
//! free-text) → cache write → point-in-polygon → output record.
//!
//! The cache is passed in by `&mut` and only ever mutated by the calling
//! task. [`ResolutionPipeline::process_batch`] geocodes unique cache misses
//! concurrently (bounded by [`PipelineOptions::concurrency`]) and writes
//! their results back once the lookups settle, so identical addresses in one
//! batch cost a single external call.
//!
//! What gets cached:
//! - resolved coordinates and the `Unresolved` marker (negative caching);
//! - address-specific failures (`BadRequest`, `Timeout`) as `Unresolved`. The
//!   record is still flagged [`ResolutionOutcome::GeocodeFailed`] on the run
//!   that hit the error;
//! - never credential faults or retryable errors that ran out of attempts.
//!   Those surface as `GeocodeFailed` and are retried on the next run.

pub mod retry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use metrics::{counter, gauge};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::address::{normalize, AddressFieldMap, AddressRole, NormalizedAddress, Record};
use crate::boundary::BoundaryIndex;
use crate::cache::ResultCache;
use crate::error::{GeocodeError, Result};
use crate::geocode::{GeocodeResult, GeocodingGateway};

pub use retry::RetryPolicy;

pub const DEFAULT_TRACT_FIELD: &str = "census_tract";

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Skip cache reads; results are still written (cache invalidation runs).
    pub bypass_cache: bool,
    /// Leave the postal code field in the output record.
    pub keep_postal_code: bool,
    pub tract_field: String,
    /// Max in-flight geocoding requests in a batch.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            bypass_cache: false,
            keep_postal_code: false,
            tract_field: DEFAULT_TRACT_FIELD.to_string(),
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// Geocoded and inside a tract.
    Resolved,
    /// No geocoding candidate for the address.
    Unresolved,
    /// Geocoded, but the coordinate lies outside every tract.
    NoTract,
    /// The geocoding capability failed for this record.
    GeocodeFailed(GeocodeError),
}

#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    /// Input record minus its address fields, plus the tract field.
    pub record: Record,
    pub tract: Option<String>,
    pub outcome: ResolutionOutcome,
    pub cache_hit: bool,
    pub anon_id: String,
}

impl ResolvedRecord {
    pub fn into_record(self) -> Record {
        self.record
    }

    pub fn is_flagged(&self) -> bool {
        matches!(self.outcome, ResolutionOutcome::GeocodeFailed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub records: usize,
    /// Records that received a tract.
    pub resolved: usize,
    /// No candidate, or a coordinate outside every tract.
    pub unresolved: usize,
    /// Configuration errors plus geocoding failures.
    pub errors: usize,
    pub geocode_failures: usize,
    pub cache_hits: usize,
    /// Unique addresses sent to the geocoding gateway.
    pub geocode_calls: usize,
}

impl BatchSummary {
    fn tally(&mut self, outcome: &Result<ResolvedRecord>) {
        self.records += 1;
        match outcome {
            Err(_) => self.errors += 1,
            Ok(r) => {
                if r.cache_hit {
                    self.cache_hits += 1;
                }
                match r.outcome {
                    ResolutionOutcome::Resolved => self.resolved += 1,
                    ResolutionOutcome::Unresolved | ResolutionOutcome::NoTract => self.unresolved += 1,
                    ResolutionOutcome::GeocodeFailed(_) => {
                        self.errors += 1;
                        self.geocode_failures += 1;
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct BatchReport {
    /// One entry per input record, in input order.
    pub outcomes: Vec<Result<ResolvedRecord>>,
    pub summary: BatchSummary,
}

pub struct ResolutionPipeline {
    gateway: GeocodingGateway,
    boundaries: Arc<BoundaryIndex>,
    options: PipelineOptions,
}

impl ResolutionPipeline {
    pub fn new(gateway: GeocodingGateway, boundaries: Arc<BoundaryIndex>, options: PipelineOptions) -> Self {
        Self {
            gateway,
            boundaries,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Resolve a single record against `cache`.
    ///
    /// Configuration errors (`MissingField`, `NoAddressData`) are returned
    /// before any external call. Geocoding failures are not errors here: they
    /// come back as [`ResolutionOutcome::GeocodeFailed`].
    pub async fn process(
        &self,
        record: &Record,
        field_map: &AddressFieldMap,
        cache: &mut ResultCache,
    ) -> Result<ResolvedRecord> {
        counter!("tract_records_total").increment(1);
        let addr = normalize(record, field_map).inspect_err(|_| {
            counter!("tract_record_errors_total").increment(1);
        })?;
        let key = addr.cache_key();

        let (geocoded, cache_hit) = match self.cached(cache, &key) {
            Some(hit) => (Ok(hit), true),
            None => {
                let fresh = self.geocode(&addr).await;
                if let Some(value) = cacheable(&fresh) {
                    cache.put(key, value);
                }
                (fresh, false)
            }
        };
        count_cache_lookup(cache_hit);
        gauge!("tract_cache_entries").set(cache.len() as f64);

        Ok(self.assemble(record, field_map, &addr, geocoded, cache_hit))
    }

    /// Resolve a batch. Output order equals input order.
    pub async fn process_batch(
        &self,
        records: &[Record],
        field_map: &AddressFieldMap,
        cache: &mut ResultCache,
    ) -> BatchReport {
        counter!("tract_records_total").increment(records.len() as u64);

        let normalized: Vec<Result<(NormalizedAddress, String)>> = records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                normalize(record, field_map)
                    .map(|addr| {
                        let key = addr.cache_key();
                        (addr, key)
                    })
                    .inspect_err(|e| {
                        counter!("tract_record_errors_total").increment(1);
                        warn!(target: "pipeline", index, error = %e, "record skipped");
                    })
            })
            .collect();

        // Cache reads, then one pending lookup per distinct missing key.
        let mut hits: HashMap<String, GeocodeResult> = HashMap::new();
        let mut pending: Vec<(String, NormalizedAddress)> = Vec::new();
        let mut queued: HashSet<&str> = HashSet::new();
        for (addr, key) in normalized.iter().flatten() {
            if hits.contains_key(key) || queued.contains(key.as_str()) {
                continue;
            }
            match self.cached(cache, key) {
                Some(hit) => {
                    hits.insert(key.clone(), hit);
                }
                None => {
                    queued.insert(key.as_str());
                    pending.push((key.clone(), addr.clone()));
                }
            }
        }

        let geocode_calls = pending.len();
        let concurrency = self.options.concurrency.max(1);
        debug!(target: "pipeline", lookups = geocode_calls, concurrency, "geocoding cache misses");
        let fetched: HashMap<String, std::result::Result<GeocodeResult, GeocodeError>> =
            stream::iter(pending)
                .map(|(key, addr)| async move {
                    let result = self.geocode(&addr).await;
                    (key, result)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        // Single writer: only this task touches the cache.
        for (key, result) in &fetched {
            if let Some(value) = cacheable(result) {
                cache.put(key.clone(), value);
            }
        }
        gauge!("tract_cache_entries").set(cache.len() as f64);

        let mut summary = BatchSummary {
            geocode_calls,
            ..Default::default()
        };
        let mut outcomes = Vec::with_capacity(records.len());
        for (record, norm) in records.iter().zip(normalized) {
            let outcome = norm.map(|(addr, key)| {
                let (geocoded, cache_hit) = match hits.get(key.as_str()) {
                    Some(hit) => (Ok(hit.clone()), true),
                    None => match fetched.get(key.as_str()) {
                        Some(result) => (result.clone(), false),
                        None => (Ok(GeocodeResult::Unresolved), false),
                    },
                };
                count_cache_lookup(cache_hit);
                self.assemble(record, field_map, &addr, geocoded, cache_hit)
            });
            summary.tally(&outcome);
            outcomes.push(outcome);
        }

        info!(
            target: "pipeline",
            records = summary.records,
            resolved = summary.resolved,
            unresolved = summary.unresolved,
            errors = summary.errors,
            cache_hits = summary.cache_hits,
            geocode_calls = summary.geocode_calls,
            "batch complete"
        );
        BatchReport { outcomes, summary }
    }

    fn cached(&self, cache: &ResultCache, key: &str) -> Option<GeocodeResult> {
        if self.options.bypass_cache {
            return None;
        }
        cache.get(key).cloned()
    }

    async fn geocode(&self, addr: &NormalizedAddress) -> std::result::Result<GeocodeResult, GeocodeError> {
        let gateway = &self.gateway;
        let out = self.options.retry.run(move || gateway.resolve(addr)).await;
        if let Err(e) = &out {
            warn!(target: "pipeline", id = %addr.anon_id(), error = %e, "geocoding failed; record left without tract");
        }
        out
    }

    fn assemble(
        &self,
        record: &Record,
        field_map: &AddressFieldMap,
        addr: &NormalizedAddress,
        geocoded: std::result::Result<GeocodeResult, GeocodeError>,
        cache_hit: bool,
    ) -> ResolvedRecord {
        let (tract, outcome) = match geocoded {
            Ok(GeocodeResult::Resolved(m)) => match self.boundaries.resolve(m.lat, m.lng) {
                Some(geoid) => (Some(geoid.to_string()), ResolutionOutcome::Resolved),
                None => (None, ResolutionOutcome::NoTract),
            },
            Ok(GeocodeResult::Unresolved) => {
                warn!(target: "pipeline", id = %addr.anon_id(), cache_hit, "address unresolved");
                (None, ResolutionOutcome::Unresolved)
            }
            Err(e) => (None, ResolutionOutcome::GeocodeFailed(e)),
        };

        let mut out = record.clone();
        for (role, field) in field_map.mapped() {
            if role == AddressRole::Zipcode && self.options.keep_postal_code {
                continue;
            }
            out.remove(field);
        }
        out.insert(
            self.options.tract_field.clone(),
            tract.clone().map(Value::String).unwrap_or(Value::Null),
        );

        ResolvedRecord {
            record: out,
            tract,
            outcome,
            cache_hit,
            anon_id: addr.anon_id(),
        }
    }
}

/// What to write back for a finished lookup, if anything.
fn cacheable(result: &std::result::Result<GeocodeResult, GeocodeError>) -> Option<GeocodeResult> {
    match result {
        Ok(value) => Some(value.clone()),
        Err(e) if e.is_address_specific() => Some(GeocodeResult::Unresolved),
        Err(_) => None,
    }
}

/// Counted per record, duplicates within a batch included.
fn count_cache_lookup(hit: bool) {
    if hit {
        counter!("tract_cache_hits_total").increment(1);
    } else {
        counter!("tract_cache_misses_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::mock::ScriptedGeocoder;
    use serde_json::json;

    const SQUARE: &str = r#"{"type":"FeatureCollection","features":[
        {"type":"Feature","properties":{"GEOID":"53033009000"},
         "geometry":{"type":"Polygon","coordinates":[[[-122.32,47.57],[-122.30,47.57],[-122.30,47.59],[-122.32,47.59],[-122.32,47.57]]]}}
    ]}"#;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn pipeline(svc: Arc<ScriptedGeocoder>, options: PipelineOptions) -> ResolutionPipeline {
        let idx = BoundaryIndex::from_geojson_str(SQUARE).unwrap();
        ResolutionPipeline::new(GeocodingGateway::new(svc), Arc::new(idx), options)
    }

    fn map() -> AddressFieldMap {
        AddressFieldMap {
            street: Some("street".into()),
            city: Some("city".into()),
            zipcode: Some("zip".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn postal_code_retention_is_explicit() {
        let svc = Arc::new(ScriptedGeocoder::new().with_street("1 MAIN ST", 47.58, -122.31));
        let r = rec(json!({"street": "1 Main St", "city": "Seattle", "zip": "98144", "id": 7}));

        let mut cache = ResultCache::new();
        let dropped = pipeline(svc.clone(), PipelineOptions::default())
            .process(&r, &map(), &mut cache)
            .await
            .unwrap();
        assert_eq!(
            Value::Object(dropped.record),
            json!({"id": 7, "census_tract": "53033009000"})
        );

        let opts = PipelineOptions {
            keep_postal_code: true,
            ..Default::default()
        };
        let kept = pipeline(svc, opts).process(&r, &map(), &mut cache).await.unwrap();
        assert_eq!(kept.record.get("zip"), Some(&json!("98144")));
        assert!(kept.cache_hit);
    }

    #[tokio::test]
    async fn coordinate_outside_every_tract_is_no_tract() {
        let svc = Arc::new(ScriptedGeocoder::new().with_street("1 MAIN ST", 10.0, 10.0));
        let p = pipeline(svc, PipelineOptions::default());
        let out = p
            .process(&rec(json!({"street": "1 main st", "city": "x", "zip": "1"})), &map(), &mut ResultCache::new())
            .await
            .unwrap();
        assert_eq!(out.outcome, ResolutionOutcome::NoTract);
        assert_eq!(out.record.get(DEFAULT_TRACT_FIELD), Some(&Value::Null));
    }

    #[tokio::test]
    async fn geocode_failures_are_flagged_and_not_cached() {
        let svc = Arc::new(ScriptedGeocoder::new().with_street_error(
            "1 MAIN ST",
            GeocodeError::Unauthorized { status: 401 },
            usize::MAX,
        ));
        let p = pipeline(svc.clone(), PipelineOptions::default());
        let mut cache = ResultCache::new();
        let out = p
            .process(&rec(json!({"street": "1 Main St", "city": "", "zip": ""})), &map(), &mut cache)
            .await
            .unwrap();
        assert!(out.is_flagged());
        assert_eq!(out.tract, None);
        assert!(cache.is_empty());
        // terminal: no retries
        assert_eq!(svc.street_calls(), 1);
    }

    #[tokio::test]
    async fn address_specific_failures_are_cached_as_unresolved() {
        let svc = Arc::new(ScriptedGeocoder::new().with_street_error(
            "BAD ADDR",
            GeocodeError::BadRequest {
                status: 422,
                body: "unparseable".into(),
            },
            usize::MAX,
        ));
        let p = pipeline(svc.clone(), PipelineOptions::default());
        let mut cache = ResultCache::new();
        let r = rec(json!({"street": "bad addr", "city": "", "zip": ""}));

        let first = p.process(&r, &map(), &mut cache).await.unwrap();
        assert!(first.is_flagged());
        assert!(!first.cache_hit);
        assert_eq!(cache.len(), 1);

        for _ in 0..2 {
            let again = p.process(&r, &map(), &mut cache).await.unwrap();
            assert!(again.cache_hit);
            assert_eq!(again.outcome, ResolutionOutcome::Unresolved);
            assert_eq!(again.record.get(DEFAULT_TRACT_FIELD), Some(&Value::Null));
        }
        assert_eq!(svc.street_calls(), 1);
    }

    #[tokio::test]
    async fn batch_caches_timeouts_but_not_credential_faults() {
        let svc = Arc::new(
            ScriptedGeocoder::new()
                .with_street_error("1 MAIN ST", GeocodeError::Timeout, usize::MAX)
                .with_street_error("2 MAIN ST", GeocodeError::Unauthorized { status: 401 }, usize::MAX),
        );
        let p = pipeline(svc, PipelineOptions::default());
        let mut cache = ResultCache::new();
        let records = vec![
            rec(json!({"street": "1 Main St", "city": "", "zip": ""})),
            rec(json!({"street": "2 Main St", "city": "", "zip": ""})),
        ];
        let report = p.process_batch(&records, &map(), &mut cache).await;
        assert_eq!(report.summary.geocode_failures, 2);
        assert_eq!(cache.len(), 1);
        let key = normalize(&records[0], &map()).unwrap().cache_key();
        assert_eq!(cache.get(&key), Some(&GeocodeResult::Unresolved));
    }

    #[test]
    fn cache_counters_count_every_record() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let svc = Arc::new(ScriptedGeocoder::new().with_street("1 MAIN ST", 47.58, -122.31));
        let p = pipeline(svc.clone(), PipelineOptions::default());
        let records: Vec<Record> = (0..3)
            .map(|i| rec(json!({"street": "1 Main St", "city": "Seattle", "zip": "98144", "seq": i})))
            .collect();

        metrics::with_local_recorder(&recorder, || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let mut cache = ResultCache::new();
                p.process_batch(&records, &map(), &mut cache).await;
                p.process_batch(&records, &map(), &mut cache).await;
            });
        });

        let text = handle.render();
        assert!(text.contains("tract_cache_misses_total 3"), "{text}");
        assert!(text.contains("tract_cache_hits_total 3"), "{text}");
        assert_eq!(svc.street_calls(), 1);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unresolved_addresses_are_logged_on_cache_hits_too() {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let svc = Arc::new(ScriptedGeocoder::new());
        let p = pipeline(svc.clone(), PipelineOptions::default());
        let mut cache = ResultCache::new();
        let r = rec(json!({"street": "9 Nowhere Rd", "city": "x", "zip": "1"}));
        let first = p.process(&r, &map(), &mut cache).await.unwrap();
        let second = p.process(&r, &map(), &mut cache).await.unwrap();
        assert_eq!(first.outcome, ResolutionOutcome::Unresolved);
        assert!(second.cache_hit);

        let logs = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.matches("address unresolved").count(), 2, "{logs}");
        assert!(logs.contains("cache_hit=true"), "{logs}");
        assert!(logs.contains(&first.anon_id));
    }

    #[tokio::test]
    async fn bypass_skips_reads_but_still_writes() {
        let svc = Arc::new(ScriptedGeocoder::new().with_street("1 MAIN ST", 47.58, -122.31));
        let opts = PipelineOptions {
            bypass_cache: true,
            ..Default::default()
        };
        let p = pipeline(svc.clone(), opts);
        let mut cache = ResultCache::new();
        let r = rec(json!({"street": "1 Main St", "city": "Seattle", "zip": "98144"}));
        p.process(&r, &map(), &mut cache).await.unwrap();
        p.process(&r, &map(), &mut cache).await.unwrap();
        assert_eq!(svc.street_calls(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn summary_counts_failures_as_errors() {
        let mut s = BatchSummary::default();
        let ok = |outcome| -> Result<ResolvedRecord> {
            Ok(ResolvedRecord {
                record: Record::new(),
                tract: None,
                outcome,
                cache_hit: false,
                anon_id: String::new(),
            })
        };
        s.tally(&ok(ResolutionOutcome::Resolved));
        s.tally(&ok(ResolutionOutcome::NoTract));
        s.tally(&ok(ResolutionOutcome::GeocodeFailed(GeocodeError::Timeout)));
        assert_eq!(s.records, 3);
        assert_eq!(s.resolved, 1);
        assert_eq!(s.unresolved, 1);
        assert_eq!(s.errors, 1);
        assert_eq!(s.geocode_failures, 1);
    }
}
