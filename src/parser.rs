//! Raw CSV loading for the PRF accident exports.
//!
//! The exports are semicolon-delimited and ISO-8859-1 encoded, and every
//! field is wrapped in literal double quotes. Quote interpretation is
//! disabled at this stage on purpose: the quotes survive into the raw table
//! (headers included) and are only stripped by the normalization pipeline.

use anyhow::Result;
use csv::ReaderBuilder;
use tracing::{debug, warn};

/// One source file as loaded from disk or the network: header names and rows
/// exactly as they appear in the export, quotes and all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Lines dropped during load because their field count did not match the
    /// header, typically an unescaped `;` inside a free-text field.
    pub skipped_lines: usize,
}

/// Decodes ISO-8859-1 bytes into a `String`.
///
/// Every Latin-1 byte maps to the Unicode code point of the same value, so
/// this is a total function.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Parses one raw export into a [`RawTable`].
///
/// The first record is taken as the header. Data rows with a different field
/// count are skipped and counted rather than failing the load; an input with
/// no header line at all is an error.
pub fn parse_source(bytes: &[u8]) -> Result<RawTable> {
    let text = decode_latin1(bytes);

    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .quoting(false)
        .flexible(true)
        .has_headers(false)
        .from_reader(text.as_bytes());

    let mut records = reader.records();
    let headers: Vec<String> = match records.next() {
        Some(first) => first?.iter().map(|f| f.to_string()).collect(),
        None => anyhow::bail!("empty source: no header line"),
    };

    let mut rows = Vec::new();
    let mut skipped_lines = 0usize;

    for record in records {
        let record = record?;
        if record.len() != headers.len() {
            skipped_lines += 1;
            continue;
        }
        rows.push(record.iter().map(|f| f.to_string()).collect());
    }

    if skipped_lines > 0 {
        warn!(skipped_lines, "Dropped malformed lines during load");
    }
    debug!(
        rows = rows.len(),
        columns = headers.len(),
        "Source loaded"
    );

    Ok(RawTable {
        headers,
        rows,
        skipped_lines,
    })
}
