//! Geocoding: service abstraction + two-tier gateway.
//!
//! The gateway first submits the address as a structured lookup. Only when
//! that yields no candidate does it fall back to free-text extraction over
//! the concatenated address. Transport failures are returned to the caller
//! untouched; the gateway never retries.

pub mod mock;
pub mod smarty;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::NormalizedAddress;
use crate::error::GeocodeError;

/// One geocoded candidate. Latitude and longitude are always both present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeMatch {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zipcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plus4_code: Option<String>,
}

impl GeocodeMatch {
    pub fn at(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            zipcode: None,
            plus4_code: None,
        }
    }
}

/// Outcome of geocoding one normalized address. `Unresolved` is cached like
/// any other result so failing addresses are not re-queried within the TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GeocodeResult {
    Resolved(GeocodeMatch),
    Unresolved,
}

impl GeocodeResult {
    /// `(lat, lng)` when resolved.
    pub fn coordinate(&self) -> Option<(f64, f64)> {
        match self {
            GeocodeResult::Resolved(m) => Some((m.lat, m.lng)),
            GeocodeResult::Unresolved => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, GeocodeResult::Resolved(_))
    }
}

/// How strictly the structured lookup must match a known address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchStrategy {
    Strict,
    Enhanced,
    /// Most permissive: returns a candidate even for undeliverable input.
    #[default]
    Invalid,
}

impl MatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStrategy::Strict => "strict",
            MatchStrategy::Enhanced => "enhanced",
            MatchStrategy::Invalid => "invalid",
        }
    }
}

/// Structured lookup request.
#[derive(Debug, Clone, PartialEq)]
pub struct StreetLookup {
    pub street: String,
    pub street2: Option<String>,
    pub secondary: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zipcode: Option<String>,
    pub candidates: u8,
    pub match_strategy: MatchStrategy,
}

impl StreetLookup {
    /// `None` when the address has no street; structured lookups need one.
    pub fn from_address(addr: &NormalizedAddress) -> Option<Self> {
        let street = addr.street.clone().filter(|s| !s.is_empty())?;
        Some(Self {
            street,
            street2: addr.street2.clone(),
            secondary: addr.secondary.clone(),
            city: addr.city.clone(),
            state: addr.state.clone(),
            zipcode: addr.zipcode.clone(),
            candidates: 1,
            match_strategy: MatchStrategy::Invalid,
        })
    }
}

/// One address found inside a free-text blob.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtractedAddress {
    pub candidates: Vec<GeocodeMatch>,
}

/// External geocoding capability.
#[async_trait]
pub trait GeocodingService: Send + Sync {
    /// Ranked candidates for a structured address; empty when nothing matched.
    async fn street_lookup(&self, lookup: &StreetLookup) -> Result<Vec<GeocodeMatch>, GeocodeError>;

    /// Addresses located inside `text`, each with its own candidates.
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedAddress>, GeocodeError>;

    fn name(&self) -> &'static str;
}

pub type DynGeocodingService = Arc<dyn GeocodingService>;

/// Structured lookup with free-text fallback.
#[derive(Clone)]
pub struct GeocodingGateway {
    service: DynGeocodingService,
}

impl GeocodingGateway {
    pub fn new(service: DynGeocodingService) -> Self {
        Self { service }
    }

    pub fn service_name(&self) -> &'static str {
        self.service.name()
    }

    pub async fn resolve(&self, addr: &NormalizedAddress) -> Result<GeocodeResult, GeocodeError> {
        let id = addr.anon_id();

        if let Some(first) = self.structured(addr, &id).await? {
            return Ok(GeocodeResult::Resolved(first));
        }

        info!(target: "geocode", %id, "no structured match; extracting address from text");
        counter!("tract_extract_fallbacks_total").increment(1);

        let text = addr.free_text();
        let t0 = Instant::now();
        counter!("tract_geocode_calls_total").increment(1);
        let found = self.service.extract(&text).await;
        histogram!("tract_geocode_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        let first = found?
            .into_iter()
            .find_map(|a| a.candidates.into_iter().next());
        match first {
            Some(m) => Ok(GeocodeResult::Resolved(m)),
            None => {
                warn!(target: "geocode", %id, "could not geocode address");
                counter!("tract_geocode_unresolved_total").increment(1);
                Ok(GeocodeResult::Unresolved)
            }
        }
    }

    async fn structured(
        &self,
        addr: &NormalizedAddress,
        id: &str,
    ) -> Result<Option<GeocodeMatch>, GeocodeError> {
        let Some(lookup) = StreetLookup::from_address(addr) else {
            warn!(
                target: "geocode",
                %id,
                "no street address; structured lookups are only possible with a street"
            );
            return Ok(None);
        };

        debug!(target: "geocode", %id, service = self.service.name(), "structured lookup");
        let t0 = Instant::now();
        counter!("tract_geocode_calls_total").increment(1);
        let candidates = self.service.street_lookup(&lookup).await;
        histogram!("tract_geocode_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        Ok(candidates?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::mock::ScriptedGeocoder;

    fn addr(street: Option<&str>, city: Option<&str>, zip: Option<&str>) -> NormalizedAddress {
        NormalizedAddress {
            street: street.map(str::to_string),
            city: city.map(str::to_string),
            zipcode: zip.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn result_serializes_with_status_tag() {
        let r = GeocodeResult::Resolved(GeocodeMatch::at(47.6, -122.3));
        let s = serde_json::to_string(&r).unwrap();
        assert_eq!(s, r#"{"status":"resolved","lat":47.6,"lng":-122.3}"#);
        let u: GeocodeResult = serde_json::from_str(r#"{"status":"unresolved"}"#).unwrap();
        assert_eq!(u, GeocodeResult::Unresolved);
    }

    #[tokio::test]
    async fn structured_hit_skips_extraction() {
        let svc = Arc::new(ScriptedGeocoder::new().with_street("1 MAIN ST", 47.6, -122.3));
        let gw = GeocodingGateway::new(svc.clone());
        let out = gw.resolve(&addr(Some("1 MAIN ST"), None, None)).await.unwrap();
        assert_eq!(out.coordinate(), Some((47.6, -122.3)));
        assert_eq!(svc.street_calls(), 1);
        assert_eq!(svc.extract_calls(), 0);
    }

    #[tokio::test]
    async fn missing_street_goes_straight_to_extraction() {
        let svc = Arc::new(ScriptedGeocoder::new());
        let gw = GeocodingGateway::new(svc.clone());
        let out = gw
            .resolve(&addr(None, Some("SEATTLE"), Some("98144")))
            .await
            .unwrap();
        assert_eq!(out, GeocodeResult::Unresolved);
        assert_eq!(svc.street_calls(), 0);
        assert_eq!(svc.extract_texts(), vec!["SEATTLE, 98144".to_string()]);
    }

    #[tokio::test]
    async fn transport_error_is_not_masked_by_fallback() {
        let svc = Arc::new(
            ScriptedGeocoder::new().with_street_error("1 MAIN ST", GeocodeError::Timeout, usize::MAX),
        );
        let gw = GeocodingGateway::new(svc.clone());
        let err = gw.resolve(&addr(Some("1 MAIN ST"), None, None)).await.unwrap_err();
        assert_eq!(err, GeocodeError::Timeout);
        assert_eq!(svc.extract_calls(), 0);
    }
}
