use std::path::Path;

use anyhow::Context;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up in the exposition).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("tract_records_total", "Records submitted to the pipeline.");
        describe_counter!(
            "tract_record_errors_total",
            "Records rejected for configuration errors (missing field / no address data)."
        );
        describe_counter!("tract_cache_hits_total", "Records answered from the geocode cache.");
        describe_counter!(
            "tract_cache_misses_total",
            "Records not answered from the geocode cache (bypass and in-batch duplicates included)."
        );
        describe_counter!("tract_geocode_calls_total", "Requests sent to the geocoding service.");
        describe_counter!(
            "tract_extract_fallbacks_total",
            "Structured lookups with no candidate that fell back to text extraction."
        );
        describe_counter!(
            "tract_geocode_unresolved_total",
            "Addresses with no candidate from either lookup."
        );
        describe_counter!("tract_geocode_errors_total", "Failed geocoding HTTP calls.");
        describe_counter!("tract_geocode_retries_total", "Retries after retryable geocoding errors.");
        describe_counter!(
            "tract_polygon_misses_total",
            "Coordinates that fell outside every tract polygon."
        );
        describe_histogram!("tract_geocode_ms", "Geocoding call latency in milliseconds.");
        describe_gauge!("tract_cache_entries", "Entries held in the geocode cache.");
    });
}

/// Install the global Prometheus recorder. Call at most once per process.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("prometheus: install recorder")?;
    ensure_metrics_described();
    Ok(handle)
}

/// Write the text exposition to `path` (node-exporter textfile style).
pub fn write_exposition(handle: &PrometheusHandle, path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, handle.render()).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}
