//! Scripted in-memory geocoder for tests and offline runs.
//!
//! Street lookups are answered by exact street value, extraction by exact
//! text. Anything unscripted yields no candidates. Every call is counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ExtractedAddress, GeocodeMatch, GeocodingService, StreetLookup};
use crate::error::GeocodeError;

#[derive(Default)]
pub struct ScriptedGeocoder {
    street: HashMap<String, Vec<GeocodeMatch>>,
    extract: HashMap<String, Vec<ExtractedAddress>>,
    // street -> (error, remaining failures)
    street_errors: Mutex<HashMap<String, (GeocodeError, usize)>>,
    delay: Option<Duration>,
    street_calls: AtomicUsize,
    extract_calls: AtomicUsize,
    extract_texts: Mutex<Vec<String>>,
}

impl ScriptedGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_street(mut self, street: &str, lat: f64, lng: f64) -> Self {
        self.street
            .entry(street.to_string())
            .or_default()
            .push(GeocodeMatch::at(lat, lng));
        self
    }

    pub fn with_extract(mut self, text: &str, lat: f64, lng: f64) -> Self {
        self.extract
            .entry(text.to_string())
            .or_default()
            .push(ExtractedAddress {
                candidates: vec![GeocodeMatch::at(lat, lng)],
            });
        self
    }

    /// Fail the next `times` lookups for `street` with `err`.
    pub fn with_street_error(self, street: &str, err: GeocodeError, times: usize) -> Self {
        self.street_errors
            .lock()
            .expect("script mutex poisoned")
            .insert(street.to_string(), (err, times));
        self
    }

    /// Sleep before answering, to hold requests in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn street_calls(&self) -> usize {
        self.street_calls.load(Ordering::SeqCst)
    }

    pub fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }

    pub fn extract_texts(&self) -> Vec<String> {
        self.extract_texts
            .lock()
            .expect("script mutex poisoned")
            .clone()
    }

    fn scripted_failure(&self, street: &str) -> Option<GeocodeError> {
        let mut errors = self.street_errors.lock().expect("script mutex poisoned");
        let (err, remaining) = errors.get_mut(street)?;
        if *remaining == 0 {
            return None;
        }
        *remaining = remaining.saturating_sub(1);
        Some(err.clone())
    }
}

#[async_trait]
impl GeocodingService for ScriptedGeocoder {
    async fn street_lookup(&self, lookup: &StreetLookup) -> Result<Vec<GeocodeMatch>, GeocodeError> {
        self.street_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if let Some(err) = self.scripted_failure(&lookup.street) {
            return Err(err);
        }
        Ok(self.street.get(&lookup.street).cloned().unwrap_or_default())
    }

    async fn extract(&self, text: &str) -> Result<Vec<ExtractedAddress>, GeocodeError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        self.extract_texts
            .lock()
            .expect("script mutex poisoned")
            .push(text.to_string());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        Ok(self.extract.get(text).cloned().unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
