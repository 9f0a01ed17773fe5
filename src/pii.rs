//! Participant identifier hashing.
//!
//! Replaces direct identifiers (name, birth date, gender, postal code) with a
//! salted SHA-256 digest so records from the same participant can be linked
//! without carrying the identifiers themselves.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::address::Record;

pub const ENV_SECRET: &str = "PARTICIPANT_DEIDENTIFIER_SECRET";
pub const INDIVIDUAL_FIELD: &str = "individual";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PiiFieldMap {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

impl PiiFieldMap {
    fn fields(&self) -> [(PiiKind, Option<&str>); 4] {
        [
            (PiiKind::Name, self.name.as_deref()),
            (PiiKind::BirthDate, self.birth_date.as_deref()),
            (PiiKind::Gender, self.gender.as_deref()),
            (PiiKind::PostalCode, self.postal_code.as_deref()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, f)| f.is_none())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PiiKind {
    Name,
    BirthDate,
    Gender,
    PostalCode,
}

pub struct PiiHasher {
    map: PiiFieldMap,
    secret: String,
}

impl PiiHasher {
    pub fn new(map: PiiFieldMap, secret: impl Into<String>) -> Self {
        Self {
            map,
            secret: secret.into(),
        }
    }

    /// Secret from `PARTICIPANT_DEIDENTIFIER_SECRET`.
    pub fn from_env(map: PiiFieldMap) -> anyhow::Result<Self> {
        let secret = std::env::var(ENV_SECRET)
            .map_err(|_| anyhow::anyhow!("Missing {ENV_SECRET} env var"))?;
        if secret.trim().is_empty() {
            anyhow::bail!("{ENV_SECRET} is empty");
        }
        Ok(Self::new(map, secret))
    }

    /// Upper-cased, trimmed identifier values present in `record`, in the
    /// fixed order name, birth date, gender, postal code.
    pub fn standardize(&self, record: &Record) -> Vec<String> {
        let mut out = Vec::new();
        for (kind, field) in self.map.fields() {
            let Some(field) = field else { continue };
            let Some(value) = record.get(field) else {
                continue;
            };
            let text = match value {
                Value::Null => continue,
                Value::String(s) => s.to_uppercase(),
                other => other.to_string().to_uppercase(),
            };
            let mut text = text.trim().to_string();
            if kind == PiiKind::Name {
                text = non_letters().replace_all(&text, "").into_owned();
            }
            if !text.is_empty() {
                out.push(text);
            }
        }
        out
    }

    /// Lowercase hex SHA-256 over the standardized values and the secret.
    /// `None` when the record carries no identifiers at all.
    pub fn hash(&self, record: &Record) -> Option<String> {
        let values = self.standardize(record);
        if values.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(values.join(" ").as_bytes());
        hasher.update(self.secret.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        Some(out)
    }

    /// Drop the mapped identifier fields and attach the `individual` hash.
    pub fn deidentify(&self, record: Record) -> Record {
        let id = self.hash(&record);
        self.attach(record, id)
    }

    /// Hash identifiers read from `source` into `output`. Used when the
    /// output has already lost some identifier fields (e.g. a postal code
    /// stripped with the address).
    pub fn deidentify_from(&self, source: &Record, output: Record) -> Record {
        let id = self.hash(source);
        self.attach(output, id)
    }

    fn attach(&self, mut record: Record, id: Option<String>) -> Record {
        for (_, field) in self.map.fields() {
            if let Some(field) = field {
                record.remove(field);
            }
        }
        record.insert(
            INDIVIDUAL_FIELD.to_string(),
            id.map(Value::String).unwrap_or(Value::Null),
        );
        record
    }
}

fn non_letters() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"[^A-Z]+").expect("non-letter regex"))
}
