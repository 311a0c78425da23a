//! Output formatting and persistence for analysis results.
//!
//! Supports pretty-printing, JSON serialization, a run-log CSV append, and
//! per-view CSV exports for the external charting layer.

use anyhow::Result;
use tracing::{debug, info};

use crate::stats::{AccidentSummary, GeoPoint, KeyCount, RunRecord};
use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::Path;

/// Logs a summary using Rust's debug pretty-print format.
pub fn print_pretty(summary: &AccidentSummary) {
    debug!("{:#?}", summary);
}

/// Logs a summary as pretty-printed JSON.
pub fn print_json(summary: &AccidentSummary) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

/// Appends a [`RunRecord`] as a row to the run log CSV.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, record: &RunRecord) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending run record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}

/// Writes one grouped-count view as a two-column CSV.
pub fn write_counts_csv(path: &str, key_header: &str, entries: &[KeyCount]) -> Result<()> {
    let mut writer = WriterBuilder::new().from_path(path)?;

    writer.write_record([key_header, "count"])?;
    for entry in entries {
        writer.write_record([entry.key.clone(), entry.count.to_string()])?;
    }
    writer.flush()?;

    debug!(path, rows = entries.len(), "View written");
    Ok(())
}

/// Writes the full-table map points as a latitude/longitude CSV.
pub fn write_geo_csv(path: &str, points: &[GeoPoint]) -> Result<()> {
    let mut writer = WriterBuilder::new().from_path(path)?;

    writer.write_record(["latitude", "longitude"])?;
    for point in points {
        writer.write_record([point.latitude.to_string(), point.longitude.to_string()])?;
    }
    writer.flush()?;

    debug!(path, rows = points.len(), "Map points written");
    Ok(())
}
