//! Record file adapter for the CLI.
//!
//! Input: `.json` (array of objects), `.ndjson` / `.jsonl` (one object per
//! line, blank lines skipped) or `.csv` (header row, empty cells read as null).
//! Output to a file follows the same extensions; output to stdout is always
//! line-delimited.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::address::Record;

pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["json", "ndjson", "jsonl", "csv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    JsonArray,
    Lines,
    Csv,
}

impl RecordFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(RecordFormat::JsonArray),
            "ndjson" | "jsonl" => Ok(RecordFormat::Lines),
            "csv" => Ok(RecordFormat::Csv),
            other => bail!(
                "unsupported file extension '{other}' for {}; supported: {}",
                path.display(),
                SUPPORTED_EXTENSIONS.join(", ")
            ),
        }
    }
}

pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    let format = RecordFormat::from_path(path)?;
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    match format {
        RecordFormat::JsonArray => {
            let values: Vec<Value> = serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("parse JSON array in {}", path.display()))?;
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| into_object(v).with_context(|| format!("{} element {i}", path.display())))
                .collect()
        }
        RecordFormat::Lines => read_lines(BufReader::new(file))
            .with_context(|| format!("read {}", path.display())),
        RecordFormat::Csv => read_csv(BufReader::new(file))
            .with_context(|| format!("read {}", path.display())),
    }
}

/// Column order of a CSV input; empty for the JSON formats, whose objects
/// carry no order.
pub fn read_columns(path: &Path) -> Result<Vec<String>> {
    if RecordFormat::from_path(path)? != RecordFormat::Csv {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("read header of {}", path.display()))?;
    Ok(headers.iter().map(str::to_string).collect())
}

/// Parse CSV rows into records keyed by the header row. Cells stay strings.
pub fn read_csv(reader: impl Read) -> Result<Vec<Record>> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers().context("header row")?.clone();
    let mut out = Vec::new();
    for (i, row) in reader.records().enumerate() {
        // header is line 1
        let row = row.with_context(|| format!("line {}", i + 2))?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .map(|(name, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (name.to_string(), value)
            })
            .collect();
        out.push(record);
    }
    Ok(out)
}

/// Parse line-delimited JSON objects.
pub fn read_lines(reader: impl BufRead) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(&line).with_context(|| format!("line {}: invalid JSON", i + 1))?;
        out.push(into_object(value).with_context(|| format!("line {}", i + 1))?);
    }
    Ok(out)
}

fn into_object(value: Value) -> Result<Record> {
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, found {}", kind(&other)),
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Write to `path`, or line-delimited to stdout when `path` is `None`.
pub fn write_records(path: Option<&Path>, records: &[Record]) -> Result<()> {
    write_records_ordered(path, records, &[])
}

/// Like [`write_records`], with CSV columns following `columns` first. Fields
/// no input column names (the tract field, `error`) come after them.
pub fn write_records_ordered(path: Option<&Path>, records: &[Record], columns: &[String]) -> Result<()> {
    match path {
        None => {
            let stdout = std::io::stdout();
            let mut w = BufWriter::new(stdout.lock());
            write_lines(&mut w, records)?;
            w.flush()?;
            Ok(())
        }
        Some(path) => {
            let format = RecordFormat::from_path(path)?;
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            }
            let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
            let mut w = BufWriter::new(file);
            match format {
                RecordFormat::JsonArray => serde_json::to_writer_pretty(&mut w, records)?,
                RecordFormat::Lines => write_lines(&mut w, records)?,
                RecordFormat::Csv => write_csv(&mut w, records, columns)?,
            }
            w.flush().with_context(|| format!("flush {}", path.display()))?;
            Ok(())
        }
    }
}

pub fn write_lines(w: &mut impl Write, records: &[Record]) -> Result<()> {
    for r in records {
        serde_json::to_writer(&mut *w, r)?;
        w.write_all(b"\n")?;
    }
    Ok(())
}

pub fn write_csv(w: &mut impl Write, records: &[Record], columns: &[String]) -> Result<()> {
    let header = output_columns(records, columns);
    let mut writer = csv::Writer::from_writer(w);
    writer.write_record(&header)?;
    for r in records {
        writer.write_record(header.iter().map(|c| cell(r.get(c))))?;
    }
    writer.flush()?;
    Ok(())
}

/// Known columns still present in some record, in input order, then every
/// other key in order of first appearance.
fn output_columns(records: &[Record], columns: &[String]) -> Vec<String> {
    let mut out: Vec<String> = columns
        .iter()
        .filter(|c| records.iter().any(|r| r.contains_key(c.as_str())))
        .cloned()
        .collect();
    for r in records {
        for key in r.keys() {
            if !out.contains(key) {
                out.push(key.clone());
            }
        }
    }
    out
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// A rejected input record with the reason attached under `error`.
pub fn reject(index: usize, record: &Record, error: &impl std::fmt::Display) -> Record {
    let mut out = record.clone();
    out.insert("error".to_string(), Value::String(error.to_string()));
    out.insert("index".to_string(), Value::from(index));
    out
}
