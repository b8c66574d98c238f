//! Writing datasets out.
//!
//! Three layouts are supported: a pretty JSON object keyed by group, a JSON
//! array of group records, and NDJSON with one group record per line.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::dataset::{Dataset, GroupFields};

/// Error type for serialization operations
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output layout for datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `{ group: { path: value } }`, pretty-printed
    #[default]
    Json,
    /// `[ { group, fields }, ... ]`
    JsonArray,
    /// one `{ group, fields }` object per line
    Ndjson,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "json-array" | "array" => Ok(OutputFormat::JsonArray),
            "ndjson" | "jsonl" => Ok(OutputFormat::Ndjson),
            other => Err(format!("unknown output format '{}' (json, json-array, ndjson)", other)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Json => "json",
            OutputFormat::JsonArray => "json-array",
            OutputFormat::Ndjson => "ndjson",
        };
        f.write_str(name)
    }
}

/// One group of one term, as written to NDJSON and JSON arrays.
#[derive(Debug, Serialize)]
pub struct TermRecord<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<&'a str>,
    pub group: &'a str,
    pub fields: &'a GroupFields,
}

/// NDJSON (Newline Delimited JSON) writer
///
/// Writes records as NDJSON, one JSON object per line.
pub struct NdjsonWriter<W: Write> {
    writer: W,
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a single record as an NDJSON line
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<(), SerializationError> {
        let json = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", json)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SerializationError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// JSON array writer
///
/// Streams records into a JSON array without collecting them first.
pub struct JsonArrayWriter<W: Write> {
    writer: W,
    first: bool,
}

impl<W: Write> JsonArrayWriter<W> {
    /// Create a new JSON array writer and write the opening bracket
    pub fn new(mut writer: W) -> Result<Self, SerializationError> {
        write!(writer, "[")?;
        Ok(Self {
            writer,
            first: true,
        })
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<(), SerializationError> {
        if !self.first {
            write!(self.writer, ",")?;
        }
        self.first = false;

        let json = serde_json::to_string(record)?;
        write!(self.writer, "{}", json)?;
        Ok(())
    }

    /// Finish writing the array and close the bracket
    pub fn finish(mut self) -> Result<(), SerializationError> {
        write!(self.writer, "]")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Write one dataset. Returns the number of groups written.
pub fn write_dataset<W: Write>(
    dataset: &Dataset,
    format: OutputFormat,
    writer: W,
) -> Result<usize, SerializationError> {
    let mut single = BTreeMap::new();
    single.insert(None, dataset.snapshot());
    write_sorted(&single, format, writer)
}

/// Write datasets keyed by term. Returns the number of groups written.
///
/// JSON nests groups under their term; the record layouts carry a `term`
/// field instead.
pub fn write_terms<W: Write>(
    datasets: &BTreeMap<String, Dataset>,
    format: OutputFormat,
    writer: W,
) -> Result<usize, SerializationError> {
    let sorted = datasets
        .iter()
        .map(|(term, dataset)| (Some(term.as_str()), dataset.snapshot()))
        .collect();
    write_sorted(&sorted, format, writer)
}

fn write_sorted<W: Write>(
    datasets: &BTreeMap<Option<&str>, BTreeMap<String, GroupFields>>,
    format: OutputFormat,
    mut writer: W,
) -> Result<usize, SerializationError> {
    let records = datasets.iter().flat_map(|(term, groups)| {
        groups.iter().map(move |(group, fields)| TermRecord {
            term: *term,
            group,
            fields,
        })
    });

    let mut written = 0;
    match format {
        OutputFormat::Json => {
            written = datasets.values().map(BTreeMap::len).sum();
            match datasets.iter().next() {
                Some((None, groups)) if datasets.len() == 1 => {
                    serde_json::to_writer_pretty(&mut writer, groups)?
                }
                _ => {
                    let by_term: BTreeMap<&str, _> = datasets
                        .iter()
                        .map(|(term, groups)| (term.unwrap_or_default(), groups))
                        .collect();
                    serde_json::to_writer_pretty(&mut writer, &by_term)?
                }
            }
            writeln!(writer)?;
            writer.flush()?;
        }
        OutputFormat::JsonArray => {
            let mut array = JsonArrayWriter::new(writer)?;
            for record in records {
                array.write(&record)?;
                written += 1;
            }
            array.finish()?;
        }
        OutputFormat::Ndjson => {
            let mut lines = NdjsonWriter::new(writer);
            for record in records {
                lines.write(&record)?;
                written += 1;
            }
            lines.flush()?;
        }
    }
    Ok(written)
}
