//! Error taxonomy for the resolution pipeline.
//!
//! Configuration errors are detected before any external call and carry the
//! offending keys plus a snapshot of the field mapping, so an operator can fix
//! an institutional configuration from the message alone.

use std::path::PathBuf;

use thiserror::Error;

use crate::address::{AddressFieldMap, AddressRole};

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A role names a source field the record does not carry.
    #[error(
        "address map assigns {role} to field '{field}', which is not present in the record \
         (record keys: {record_keys:?}; mapping: {mapping})"
    )]
    MissingField {
        role: AddressRole,
        field: String,
        record_keys: Vec<String>,
        mapping: AddressFieldMap,
    },

    /// Nothing geocodable could be extracted from the record.
    #[error("no address data found in record (record keys: {record_keys:?}; mapping: {mapping})")]
    NoAddressData {
        record_keys: Vec<String>,
        mapping: AddressFieldMap,
    },

    #[error("failed to load boundary file {}: {reason}", path.display())]
    BoundaryLoad { path: PathBuf, reason: String },

    #[error("invalid address field map: {reason}")]
    InvalidFieldMap { reason: String },

    #[error(transparent)]
    Geocode(#[from] GeocodeError),

    #[error("cache persistence failed for {}: {reason}", path.display())]
    CachePersist { path: PathBuf, reason: String },
}

impl PipelineError {
    /// Per-record configuration errors; the batch continues past these.
    pub fn is_record_config_error(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingField { .. } | PipelineError::NoAddressData { .. }
        )
    }
}

/// Failures talking to the external geocoding capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeocodeError {
    #[error("geocoding request timed out")]
    Timeout,
    #[error("geocoding service rate limit exceeded")]
    RateLimited,
    #[error("geocoding service rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("geocoding service rejected request (HTTP {status}): {body}")]
    BadRequest { status: u16, body: String },
    #[error("geocoding service error (HTTP {status})")]
    Server { status: u16 },
    #[error("geocoding transport error: {0}")]
    Transport(String),
    #[error("could not decode geocoding response: {0}")]
    Decode(String),
    #[error("missing geocoding credential {0}")]
    MissingCredentials(&'static str),
}

impl GeocodeError {
    /// Rate limits, 5xx and connection failures may succeed on a later attempt.
    /// Timeouts are terminal for the record to keep batch runtime bounded.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GeocodeError::RateLimited | GeocodeError::Server { .. } | GeocodeError::Transport(_)
        )
    }

    /// Failures tied to the address itself rather than to the service or the
    /// credentials. Another attempt with the same input fails the same way, so
    /// the pipeline caches these as `Unresolved`.
    pub fn is_address_specific(&self) -> bool {
        matches!(self, GeocodeError::BadRequest { .. } | GeocodeError::Timeout)
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 402 | 403 => GeocodeError::Unauthorized { status },
            429 => GeocodeError::RateLimited,
            500..=599 => GeocodeError::Server { status },
            _ => GeocodeError::BadRequest { status, body },
        }
    }
}

impl From<reqwest::Error> for GeocodeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GeocodeError::Timeout
        } else if e.is_decode() {
            GeocodeError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            GeocodeError::from_status(status.as_u16(), String::new())
        } else {
            GeocodeError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_distinguishes_retryable() {
        assert_eq!(
            GeocodeError::from_status(401, String::new()),
            GeocodeError::Unauthorized { status: 401 }
        );
        assert!(GeocodeError::from_status(429, String::new()).is_retryable());
        assert!(GeocodeError::from_status(503, String::new()).is_retryable());
        assert!(!GeocodeError::from_status(402, String::new()).is_retryable());
        assert!(!GeocodeError::from_status(400, "bad".into()).is_retryable());
        assert!(!GeocodeError::Timeout.is_retryable());
    }

    #[test]
    fn only_address_level_failures_are_address_specific() {
        assert!(GeocodeError::from_status(422, "bad".into()).is_address_specific());
        assert!(GeocodeError::Timeout.is_address_specific());
        assert!(!GeocodeError::Unauthorized { status: 401 }.is_address_specific());
        assert!(!GeocodeError::MissingCredentials("SMARTY_AUTH_ID").is_address_specific());
        assert!(!GeocodeError::RateLimited.is_address_specific());
        assert!(!GeocodeError::Server { status: 503 }.is_address_specific());
        assert!(!GeocodeError::Transport("reset".into()).is_address_specific());
    }
}
