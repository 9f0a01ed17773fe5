//! US Street / US Extract geocoding over HTTP.
//!
//! Requires `SMARTYSTREETS_AUTH_ID` and `SMARTYSTREETS_AUTH_TOKEN`.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::counter;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

use super::{ExtractedAddress, GeocodeMatch, GeocodingService, StreetLookup};
use crate::error::GeocodeError;

pub const ENV_AUTH_ID: &str = "SMARTYSTREETS_AUTH_ID";
pub const ENV_AUTH_TOKEN: &str = "SMARTYSTREETS_AUTH_TOKEN";

const DEFAULT_STREET_URL: &str = "https://us-street.api.smarty.com/street-address";
const DEFAULT_EXTRACT_URL: &str = "https://us-extract.api.smarty.com/";
const ERROR_BODY_MAX: usize = 200;

#[derive(Clone)]
pub struct SmartyCredentials {
    auth_id: String,
    auth_token: String,
}

impl SmartyCredentials {
    pub fn new(auth_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            auth_id: auth_id.into(),
            auth_token: auth_token.into(),
        }
    }

    pub fn from_env() -> Result<Self, GeocodeError> {
        let auth_id = non_empty_env(ENV_AUTH_ID)?;
        let auth_token = non_empty_env(ENV_AUTH_TOKEN)?;
        Ok(Self::new(auth_id, auth_token))
    }
}

// Never print the token.
impl std::fmt::Debug for SmartyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartyCredentials")
            .field("auth_id", &self.auth_id)
            .field("auth_token_len", &self.auth_token.len())
            .finish()
    }
}

fn non_empty_env(name: &'static str) -> Result<String, GeocodeError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(GeocodeError::MissingCredentials(name)),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SmartyOptions {
    /// Whole-request timeout; an elapsed timeout is terminal for the record.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Client-side cap on requests per second; `0` disables the limiter.
    pub rate_per_sec: u32,
}

impl Default for SmartyOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(4),
            rate_per_sec: 10,
        }
    }
}

pub struct SmartyClient {
    http: Client,
    creds: SmartyCredentials,
    street_url: String,
    extract_url: String,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl SmartyClient {
    pub fn new(creds: SmartyCredentials, opts: SmartyOptions) -> Result<Self, GeocodeError> {
        let http = Client::builder()
            .user_agent(concat!("census-tract-deid/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(opts.connect_timeout)
            .timeout(opts.timeout)
            .build()
            .map_err(|e| GeocodeError::Transport(e.to_string()))?;
        let limiter = NonZeroU32::new(opts.rate_per_sec)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        Ok(Self {
            http,
            creds,
            street_url: DEFAULT_STREET_URL.to_string(),
            extract_url: DEFAULT_EXTRACT_URL.to_string(),
            limiter,
        })
    }

    /// Point at a proxy or test server.
    pub fn with_base_urls(mut self, street_url: &str, extract_url: &str) -> Self {
        self.street_url = street_url.to_string();
        self.extract_url = extract_url.to_string();
        self
    }

    async fn send(&self, req: RequestBuilder) -> Result<String, GeocodeError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(target: "geocode", error = %e, "geocoding http error");
                counter!("tract_geocode_errors_total").increment(1);
                return Err(e.into());
            }
        };
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            counter!("tract_geocode_errors_total").increment(1);
            let snippet: String = body.chars().take(ERROR_BODY_MAX).collect();
            return Err(GeocodeError::from_status(status.as_u16(), snippet));
        }
        Ok(body)
    }

    fn auth_query(&self) -> [(&'static str, &str); 2] {
        [
            ("auth-id", self.creds.auth_id.as_str()),
            ("auth-token", self.creds.auth_token.as_str()),
        ]
    }
}

fn street_query(lookup: &StreetLookup) -> Vec<(&'static str, String)> {
    let mut q = vec![("street", lookup.street.clone())];
    let optional = [
        ("street2", &lookup.street2),
        ("secondary", &lookup.secondary),
        ("city", &lookup.city),
        ("state", &lookup.state),
        ("zipcode", &lookup.zipcode),
    ];
    for (name, value) in optional {
        if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
            q.push((name, v.to_string()));
        }
    }
    q.push(("candidates", lookup.candidates.to_string()));
    q.push(("match", lookup.match_strategy.as_str().to_string()));
    q
}

#[async_trait]
impl GeocodingService for SmartyClient {
    async fn street_lookup(&self, lookup: &StreetLookup) -> Result<Vec<GeocodeMatch>, GeocodeError> {
        let req = self
            .http
            .get(&self.street_url)
            .query(&self.auth_query())
            .query(&street_query(lookup));
        let body = self.send(req).await?;
        parse_street_response(&body)
    }

    async fn extract(&self, text: &str) -> Result<Vec<ExtractedAddress>, GeocodeError> {
        let req = self
            .http
            .post(&self.extract_url)
            .query(&self.auth_query())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text.to_string());
        let body = self.send(req).await?;
        parse_extract_response(&body)
    }

    fn name(&self) -> &'static str {
        "smartystreets"
    }
}

// --- wire format ---

#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    components: RawComponents,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawComponents {
    zipcode: Option<String>,
    plus4_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawExtractResponse {
    #[serde(default)]
    addresses: Vec<RawExtractAddress>,
}

#[derive(Debug, Deserialize)]
struct RawExtractAddress {
    #[serde(default)]
    candidates: Vec<RawCandidate>,
}

impl RawCandidate {
    /// Candidates without a full coordinate pair are dropped.
    fn into_match(self) -> Option<GeocodeMatch> {
        Some(GeocodeMatch {
            lat: self.metadata.latitude?,
            lng: self.metadata.longitude?,
            zipcode: self.components.zipcode,
            plus4_code: self.components.plus4_code,
        })
    }
}

/// Decode a US Street response body (a JSON array of candidates).
pub fn parse_street_response(body: &str) -> Result<Vec<GeocodeMatch>, GeocodeError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<RawCandidate> =
        serde_json::from_str(trimmed).map_err(|e| GeocodeError::Decode(e.to_string()))?;
    Ok(raw.into_iter().filter_map(RawCandidate::into_match).collect())
}

/// Decode a US Extract response body.
pub fn parse_extract_response(body: &str) -> Result<Vec<ExtractedAddress>, GeocodeError> {
    let raw: RawExtractResponse =
        serde_json::from_str(body.trim()).map_err(|e| GeocodeError::Decode(e.to_string()))?;
    Ok(raw
        .addresses
        .into_iter()
        .map(|a| ExtractedAddress {
            candidates: a
                .candidates
                .into_iter()
                .filter_map(RawCandidate::into_match)
                .collect(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::MatchStrategy;

    #[test]
    fn street_query_skips_absent_roles_and_is_most_permissive() {
        let lookup = StreetLookup {
            street: "2718 14TH AVE S".into(),
            street2: None,
            secondary: Some("APT B".into()),
            city: Some("SEATTLE".into()),
            state: None,
            zipcode: Some("98144".into()),
            candidates: 1,
            match_strategy: MatchStrategy::Invalid,
        };
        let q = street_query(&lookup);
        let names: Vec<&str> = q.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["street", "secondary", "city", "zipcode", "candidates", "match"]
        );
        assert_eq!(q.last().unwrap().1, "invalid");
    }

    #[test]
    fn partial_coordinates_are_dropped() {
        let body = r#"[{"metadata":{"latitude":47.6}},{"metadata":{"latitude":47.5,"longitude":-122.3}}]"#;
        let out = parse_street_response(body).unwrap();
        assert_eq!(out, vec![GeocodeMatch::at(47.5, -122.3)]);
    }

    #[test]
    fn empty_body_is_no_candidates() {
        assert!(parse_street_response("  ").unwrap().is_empty());
        assert!(parse_street_response("[]").unwrap().is_empty());
    }

    #[test]
    fn credentials_debug_hides_token() {
        let c = SmartyCredentials::new("id-123", "very-secret");
        let s = format!("{c:?}");
        assert!(s.contains("id-123"));
        assert!(!s.contains("very-secret"));
    }
}
