// src/address/mod.rs
//! Address roles, institutional field maps and normalization.
//!
//! A raw record is any JSON object. Only the fields named by an
//! [`AddressFieldMap`] are read; every extracted value is upper-cased and
//! trimmed so the same address spelled with different casing or padding
//! yields an identical [`NormalizedAddress`] and cache key.

pub mod config;

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Key/value record as consumed and produced by the pipeline.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressRole {
    Street,
    Street2,
    Secondary,
    City,
    State,
    Zipcode,
}

impl AddressRole {
    /// Fixed role order; the free-text fallback concatenates in this order.
    pub const ALL: [AddressRole; 6] = [
        AddressRole::Street,
        AddressRole::Street2,
        AddressRole::Secondary,
        AddressRole::City,
        AddressRole::State,
        AddressRole::Zipcode,
    ];

    pub fn key(self) -> &'static str {
        match self {
            AddressRole::Street => "street",
            AddressRole::Street2 => "street2",
            AddressRole::Secondary => "secondary",
            AddressRole::City => "city",
            AddressRole::State => "state",
            AddressRole::Zipcode => "zipcode",
        }
    }
}

impl fmt::Display for AddressRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Maps each address role to the name of the source field carrying it.
/// An unset role means the source simply has no such field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressFieldMap {
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub street2: Option<String>,
    #[serde(default)]
    pub secondary: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zipcode: Option<String>,
}

impl AddressFieldMap {
    /// Street-only map: the whole address lives in one `address` field.
    pub fn single_field(field: impl Into<String>) -> Self {
        Self {
            street: Some(field.into()),
            ..Self::default()
        }
    }

    pub fn get(&self, role: AddressRole) -> Option<&str> {
        let slot = match role {
            AddressRole::Street => &self.street,
            AddressRole::Street2 => &self.street2,
            AddressRole::Secondary => &self.secondary,
            AddressRole::City => &self.city,
            AddressRole::State => &self.state,
            AddressRole::Zipcode => &self.zipcode,
        };
        slot.as_deref()
    }

    /// Set roles in role order.
    pub fn mapped(&self) -> impl Iterator<Item = (AddressRole, &str)> + '_ {
        AddressRole::ALL
            .into_iter()
            .filter_map(move |role| self.get(role).map(|field| (role, field)))
    }

    pub fn source_fields(&self) -> Vec<&str> {
        self.mapped().map(|(_, field)| field).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mapped().next().is_none()
    }

    /// Reject maps that could never produce a usable record.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(PipelineError::InvalidFieldMap {
                reason: "no address role is mapped to a source field".into(),
            });
        }
        let mut seen = HashSet::new();
        for (role, field) in self.mapped() {
            if field.trim().is_empty() {
                return Err(PipelineError::InvalidFieldMap {
                    reason: format!("role {role} is mapped to an empty field name"),
                });
            }
            if !seen.insert(field) {
                return Err(PipelineError::InvalidFieldMap {
                    reason: format!("field '{field}' is mapped to more than one role"),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for AddressFieldMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, role) in AddressRole::ALL.into_iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match self.get(role) {
                Some(field) => write!(f, "{role}={field:?}")?,
                None => write!(f, "{role}=<unset>")?,
            }
        }
        f.write_str("}")
    }
}

/// Canonical role-keyed address. `None` marks an absent role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedAddress {
    pub street: Option<String>,
    pub street2: Option<String>,
    pub secondary: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zipcode: Option<String>,
}

impl NormalizedAddress {
    pub fn get(&self, role: AddressRole) -> Option<&str> {
        let slot = match role {
            AddressRole::Street => &self.street,
            AddressRole::Street2 => &self.street2,
            AddressRole::Secondary => &self.secondary,
            AddressRole::City => &self.city,
            AddressRole::State => &self.state,
            AddressRole::Zipcode => &self.zipcode,
        };
        slot.as_deref()
    }

    fn slot_mut(&mut self, role: AddressRole) -> &mut Option<String> {
        match role {
            AddressRole::Street => &mut self.street,
            AddressRole::Street2 => &mut self.street2,
            AddressRole::Secondary => &mut self.secondary,
            AddressRole::City => &mut self.city,
            AddressRole::State => &mut self.state,
            AddressRole::Zipcode => &mut self.zipcode,
        }
    }

    /// Present, non-empty values in role order.
    pub fn present_values(&self) -> impl Iterator<Item = (AddressRole, &str)> + '_ {
        AddressRole::ALL.into_iter().filter_map(move |role| {
            self.get(role)
                .filter(|v| !v.is_empty())
                .map(|v| (role, v))
        })
    }

    pub fn is_blank(&self) -> bool {
        self.present_values().next().is_none()
    }

    /// Single text blob for free-text extraction.
    pub fn free_text(&self) -> String {
        self.present_values()
            .map(|(_, v)| v)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Stable cache key: JSON object with every role, keys sorted.
    pub fn cache_key(&self) -> String {
        let canonical: BTreeMap<&'static str, Option<&str>> = AddressRole::ALL
            .into_iter()
            .map(|role| (role.key(), self.get(role)))
            .collect();
        // A map of &str to Option<&str> always serializes.
        serde_json::to_string(&canonical).unwrap_or_default()
    }

    /// Short non-reversible id for logs. Never log the address itself.
    pub fn anon_id(&self) -> String {
        anon_hash(&self.cache_key())
    }
}

pub(crate) fn anon_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn record_keys(record: &Record) -> Vec<String> {
    record.keys().cloned().collect()
}

/// Text form of a field value: upper-cased and trimmed. `null` and blank
/// values are absent.
fn normalize_value(value: &Value) -> Option<String> {
    let raw = match value {
        Value::Null => return None,
        Value::String(s) => s.to_uppercase(),
        other => other.to_string().to_uppercase(),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Extract the mapped address fields of `record`.
///
/// A role mapped to a field the record lacks is a [`PipelineError::MissingField`];
/// a record in which none of the mapped fields exist, or all of them are
/// blank, is a [`PipelineError::NoAddressData`].
pub fn normalize(record: &Record, map: &AddressFieldMap) -> Result<NormalizedAddress> {
    let mut out = NormalizedAddress::default();
    let mut missing: Option<(AddressRole, &str)> = None;
    let mut found = 0usize;

    for (role, field) in map.mapped() {
        match record.get(field) {
            Some(value) => {
                found += 1;
                *out.slot_mut(role) = normalize_value(value);
            }
            None => {
                missing.get_or_insert((role, field));
            }
        }
    }

    if found == 0 {
        return Err(PipelineError::NoAddressData {
            record_keys: record_keys(record),
            mapping: map.clone(),
        });
    }
    if let Some((role, field)) = missing {
        return Err(PipelineError::MissingField {
            role,
            field: field.to_string(),
            record_keys: record_keys(record),
            mapping: map.clone(),
        });
    }
    if out.is_blank() {
        return Err(PipelineError::NoAddressData {
            record_keys: record_keys(record),
            mapping: map.clone(),
        });
    }
    Ok(out)
}
