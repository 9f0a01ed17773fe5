// src/address/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::AddressFieldMap;
use crate::pii::PiiFieldMap;

pub const ENV_PATH: &str = "CENSUS_TRACT_FIELD_MAP_PATH";
pub const DEFAULT_INSTITUTE: &str = "default";

/// Field names used by one institution's exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstitutionConfig {
    pub address: AddressFieldMap,
    #[serde(default)]
    pub pii: PiiFieldMap,
}

/// Institution name (lowercase) → field names. Every entry is validated on
/// insertion, so a malformed configuration fails at load time.
#[derive(Debug, Clone, Default)]
pub struct FieldMapRegistry {
    institutions: BTreeMap<String, InstitutionConfig>,
}

impl FieldMapRegistry {
    /// Built-in institutional configurations.
    pub fn builtin() -> Self {
        let mut reg = Self::default();
        let entries = [
            (
                "default",
                InstitutionConfig {
                    address: AddressFieldMap::single_field("address"),
                    pii: PiiFieldMap {
                        name: Some("Patient Name".into()),
                        birth_date: Some("DOB".into()),
                        gender: Some("Gender".into()),
                        postal_code: Some("Postal Code".into()),
                    },
                },
            ),
            (
                "uw",
                InstitutionConfig {
                    address: AddressFieldMap {
                        street: Some("AddressLine1".into()),
                        street2: Some("AddressLine2".into()),
                        secondary: Some("AddressLine3".into()),
                        city: Some("City".into()),
                        state: Some("StateText".into()),
                        zipcode: Some("PostalCode".into()),
                    },
                    pii: PiiFieldMap::default(),
                },
            ),
            (
                "sch",
                InstitutionConfig {
                    address: AddressFieldMap {
                        street: Some("ADD_LINE_1".into()),
                        street2: Some("ADD_LINE_2".into()),
                        secondary: Some("ADD_LINE_3".into()),
                        city: Some("CITY".into()),
                        state: Some("ABBR".into()),
                        zipcode: Some("ZIP".into()),
                    },
                    pii: PiiFieldMap::default(),
                },
            ),
        ];
        for (name, cfg) in entries {
            reg.institutions.insert(name.to_string(), cfg);
        }
        reg
    }

    pub fn insert(&mut self, name: &str, cfg: InstitutionConfig) -> Result<()> {
        let key = name.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(anyhow!("institution name must not be empty"));
        }
        cfg.address
            .validate()
            .with_context(|| format!("institution '{key}'"))?;
        self.institutions.insert(key, cfg);
        Ok(())
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Result<&InstitutionConfig> {
        self.institutions
            .get(&name.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                anyhow!(
                    "unknown institution '{name}'; known institutions: {:?}",
                    self.names()
                )
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.institutions.keys().map(String::as_str).collect()
    }
}

/// Load institution maps from an explicit path (TOML or JSON) on top of the
/// built-ins. File entries replace built-ins of the same name.
pub fn load_field_maps_from(path: &Path) -> Result<FieldMapRegistry> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading field maps from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let parsed = parse_field_maps(&content, ext.as_str())
        .with_context(|| format!("parsing field maps from {}", path.display()))?;

    let mut reg = FieldMapRegistry::builtin();
    for (name, cfg) in parsed {
        reg.insert(&name, cfg)?;
    }
    Ok(reg)
}

/// Load institution maps using env var + fallbacks:
/// 1) $CENSUS_TRACT_FIELD_MAP_PATH
/// 2) config/field_maps.toml
/// 3) config/field_maps.json
/// 4) built-ins only
pub fn load_field_maps_default() -> Result<FieldMapRegistry> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_field_maps_from(&pb);
        } else {
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/field_maps.toml");
    if toml_p.exists() {
        return load_field_maps_from(&toml_p);
    }
    let json_p = PathBuf::from("config/field_maps.json");
    if json_p.exists() {
        return load_field_maps_from(&json_p);
    }
    Ok(FieldMapRegistry::builtin())
}

type RawMaps = BTreeMap<String, InstitutionConfig>;

fn parse_field_maps(s: &str, hint_ext: &str) -> Result<RawMaps> {
    match hint_ext {
        "toml" => return toml::from_str(s).map_err(Into::into),
        "json" => return serde_json::from_str(s).map_err(Into::into),
        _ => {}
    }
    // No usable extension: JSON first, then TOML.
    if let Ok(v) = serde_json::from_str::<RawMaps>(s) {
        return Ok(v);
    }
    if let Ok(v) = toml::from_str::<RawMaps>(s) {
        return Ok(v);
    }
    Err(anyhow!("unsupported field map format"))
}
