// src/lib.rs
// Public library surface for the CLI, the helper binary and integration tests.

pub mod address;
pub mod boundary;
pub mod cache;
pub mod error;
pub mod geocode;
pub mod metrics;
pub mod pii;
pub mod pipeline;
pub mod records;

// ---- Re-exports for stable public API ----
pub use crate::address::config::{load_field_maps_default, load_field_maps_from, FieldMapRegistry};
pub use crate::address::{normalize, AddressFieldMap, AddressRole, NormalizedAddress, Record};
pub use crate::boundary::BoundaryIndex;
pub use crate::cache::{file::JsonFileBackend, CacheBackend, MemoryBackend, ResultCache};
pub use crate::error::{GeocodeError, PipelineError};
pub use crate::geocode::{GeocodeMatch, GeocodeResult, GeocodingGateway, GeocodingService};
pub use crate::pipeline::{
    BatchReport, BatchSummary, PipelineOptions, ResolutionOutcome, ResolutionPipeline, ResolvedRecord,
    RetryPolicy,
};

/// Default `tracing` filter for the binaries: info for this crate's log
/// targets, warn for everything else.
pub const DEFAULT_LOG_FILTER: &str =
    "census_tract_deid=info,pipeline=info,geocode=info,cache=info,boundary=info,warn";
