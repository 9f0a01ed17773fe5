//! Census tract de-identification CLI.
//! Reads records, replaces their address fields with a census tract GEOID and
//! writes the result. Logs go to stderr; stdout carries records only.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use census_tract_deid::address::config::{load_field_maps_default, load_field_maps_from, DEFAULT_INSTITUTE};
use census_tract_deid::boundary::{BoundaryIndex, DEFAULT_BOUNDARY_PATH, ENV_BOUNDARY_PATH};
use census_tract_deid::cache::file::{JsonFileBackend, DEFAULT_CACHE_PATH, ENV_CACHE_PATH};
use census_tract_deid::cache::CacheBackend;
use census_tract_deid::geocode::smarty::{SmartyClient, SmartyCredentials, SmartyOptions};
use census_tract_deid::geocode::GeocodingGateway;
use census_tract_deid::pii::PiiHasher;
use census_tract_deid::pipeline::{PipelineOptions, ResolutionPipeline, RetryPolicy, DEFAULT_TRACT_FIELD};
use census_tract_deid::{metrics, records, AddressFieldMap, DEFAULT_LOG_FILTER};

#[derive(Parser, Debug)]
#[command(
    name = "census-tract-deid",
    version,
    about = "Replace address fields with census tract identifiers"
)]
struct Args {
    /// Input records (.json array, .ndjson, .jsonl or .csv)
    input: PathBuf,

    /// Output file; line-delimited JSON on stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Institution whose field names the input uses
    #[arg(long, default_value = DEFAULT_INSTITUTE)]
    institute: String,

    /// Institution field map file (TOML or JSON)
    #[arg(long)]
    field_maps: Option<PathBuf>,

    /// Field holding the street. Any of the address overrides replaces the
    /// institutional map entirely.
    #[arg(long)]
    street: Option<String>,
    #[arg(long)]
    street2: Option<String>,
    #[arg(long)]
    secondary: Option<String>,
    #[arg(long)]
    city: Option<String>,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    zipcode: Option<String>,

    /// Ignore cached geocodes (results are still written back)
    #[arg(long)]
    invalidate_cache: bool,

    /// Keep the postal code field in the output
    #[arg(long)]
    keep_zipcode: bool,

    /// Replace identifying fields with a salted participant hash
    #[arg(long)]
    hash_pii: bool,

    /// Name of the output tract field
    #[arg(long, default_value = DEFAULT_TRACT_FIELD)]
    tract_field: String,

    #[arg(long, env = ENV_CACHE_PATH, default_value = DEFAULT_CACHE_PATH)]
    cache: PathBuf,

    #[arg(long, env = ENV_BOUNDARY_PATH, default_value = DEFAULT_BOUNDARY_PATH)]
    boundaries: PathBuf,

    /// Write records that could not be processed here, with an `error` field
    #[arg(long)]
    rejects: Option<PathBuf>,

    /// Max in-flight geocoding requests
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Retries after a rate-limit, 5xx or transport error
    #[arg(long, default_value_t = 3)]
    max_retries: u8,

    /// Per-request timeout; a timed-out lookup is not retried
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Client-side request rate cap (0 = unlimited)
    #[arg(long, default_value_t = 10)]
    rate_per_sec: u32,

    /// Write Prometheus text exposition here at the end of the run
    #[arg(long)]
    metrics_out: Option<PathBuf>,

    /// JSON log lines instead of compact text
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn address_override(&self) -> Option<AddressFieldMap> {
        let map = AddressFieldMap {
            street: self.street.clone(),
            street2: self.street2.clone(),
            secondary: self.secondary.clone(),
            city: self.city.clone(),
            state: self.state.clone(),
            zipcode: self.zipcode.clone(),
        };
        (!map.is_empty()).then_some(map)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Credentials and paths may come from .env in local runs.
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.log_json);

    let prometheus = match &args.metrics_out {
        Some(_) => Some(metrics::install_prometheus()?),
        None => {
            metrics::ensure_metrics_described();
            None
        }
    };

    // --- configuration (fail fast, before any external call) ---
    let registry = match &args.field_maps {
        Some(path) => load_field_maps_from(path)?,
        None => load_field_maps_default()?,
    };
    let institution = registry.get(&args.institute)?;
    let field_map = match args.address_override() {
        Some(map) => {
            map.validate().context("address field overrides")?;
            map
        }
        None => institution.address.clone(),
    };
    info!(institute = %args.institute, mapping = %field_map, "address field map selected");

    let hasher = if args.hash_pii {
        Some(PiiHasher::from_env(institution.pii.clone())?)
    } else {
        None
    };

    let boundaries = Arc::new(BoundaryIndex::load(&args.boundaries)?);

    let creds = SmartyCredentials::from_env().context("geocoding credentials")?;
    let client = SmartyClient::new(
        creds,
        SmartyOptions {
            timeout: Duration::from_secs(args.timeout_secs),
            rate_per_sec: args.rate_per_sec,
            ..Default::default()
        },
    )
    .context("building geocoding client")?;
    let gateway = GeocodingGateway::new(Arc::new(client));

    let backend = JsonFileBackend::new(&args.cache);
    let mut cache = backend.load().await?;

    // --- run ---
    let input = records::read_records(&args.input)?;
    let columns = records::read_columns(&args.input)?;
    info!(records = input.len(), input = %args.input.display(), "records loaded");

    let pipeline = ResolutionPipeline::new(
        gateway,
        boundaries,
        PipelineOptions {
            bypass_cache: args.invalidate_cache,
            keep_postal_code: args.keep_zipcode,
            tract_field: args.tract_field.clone(),
            concurrency: args.concurrency,
            retry: RetryPolicy::default().with_retries(args.max_retries),
        },
    );
    let report = pipeline.process_batch(&input, &field_map, &mut cache).await;

    let purged = cache.purge_expired(Utc::now());
    if purged > 0 {
        info!(target: "cache", purged, "expired cache entries dropped");
    }
    backend.flush(&cache).await?;

    // --- output ---
    let mut output = Vec::with_capacity(input.len());
    let mut rejects = Vec::new();
    for (index, (source, outcome)) in input.iter().zip(report.outcomes).enumerate() {
        match outcome {
            Ok(resolved) => {
                let record = resolved.into_record();
                output.push(match &hasher {
                    Some(h) => h.deidentify_from(source, record),
                    None => record,
                });
            }
            Err(e) => rejects.push(records::reject(index, source, &e)),
        }
    }

    records::write_records_ordered(args.output.as_deref(), &output, &columns)?;
    match &args.rejects {
        Some(path) => {
            records::write_records_ordered(Some(path), &rejects, &columns)?;
            if !rejects.is_empty() {
                warn!(rejected = rejects.len(), path = %path.display(), "rejected records written");
            }
        }
        None if !rejects.is_empty() => {
            warn!(rejected = rejects.len(), "records rejected; pass --rejects <path> to keep them");
        }
        None => {}
    }

    if let (Some(handle), Some(path)) = (&prometheus, &args.metrics_out) {
        metrics::write_exposition(handle, path)?;
    }

    let s = &report.summary;
    info!(
        records = s.records,
        resolved = s.resolved,
        unresolved = s.unresolved,
        errors = s.errors,
        geocode_failures = s.geocode_failures,
        cache_hits = s.cache_hits,
        geocode_calls = s.geocode_calls,
        "done"
    );
    Ok(())
}
