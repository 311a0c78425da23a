//! Aggregation views over the derived table.
//!
//! These are the four access patterns the charting layer consumes: geospatial
//! points, grouped counts (age, vehicle type, municipality, month), and the
//! weather proportions. Every view degrades to empty output on an empty
//! table.

use crate::model::{DerivedTable, Scope};
use crate::pipeline::QualityReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Ages above this are sentinel values: kept in the table, excluded from the
/// age view.
pub const AGE_SENTINEL_CEILING: i64 = 100;

/// Explicit "unknown" weather sentinel, excluded from the weather view.
pub const UNKNOWN_WEATHER: &str = "Ignorado";

/// How many municipalities the fatality ranking keeps.
pub const TOP_MUNICIPALITIES: usize = 10;

/// One map point, keyed on latitude/longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A labelled count, the common shape of the grouped views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCount {
    pub key: String,
    pub count: u64,
}

/// One bucket of the age histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgeCount {
    pub age: i64,
    pub count: u64,
}

/// Full-table lat/long pairs for the density and scatter map layers.
pub fn geo_points(table: &DerivedTable) -> Vec<GeoPoint> {
    table
        .records
        .iter()
        .map(|r| GeoPoint {
            latitude: r.latitude,
            longitude: r.longitude,
        })
        .collect()
}

/// Involvement counts per age, sorted by age. Rows without a parseable age
/// and the >100 sentinels are excluded here but stay in the table.
pub fn age_distribution(table: &DerivedTable) -> Vec<AgeCount> {
    let mut counts: HashMap<i64, u64> = HashMap::new();
    for record in &table.records {
        if let Some(age) = record.age {
            if age <= AGE_SENTINEL_CEILING {
                *counts.entry(age).or_default() += 1;
            }
        }
    }

    let mut buckets: Vec<AgeCount> = counts
        .into_iter()
        .map(|(age, count)| AgeCount { age, count })
        .collect();
    buckets.sort_by_key(|b| b.age);
    buckets
}

/// Accident counts per vehicle type, nulls dropped, singleton categories
/// dropped, sorted ascending by count.
pub fn vehicle_type_counts(table: &DerivedTable) -> Vec<KeyCount> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for record in &table.records {
        if let Some(vehicle) = &record.vehicle_type {
            *counts.entry(vehicle.as_str()).or_default() += 1;
        }
    }

    let mut entries: Vec<KeyCount> = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(key, count)| KeyCount {
            key: key.to_string(),
            count,
        })
        .collect();
    entries.sort_by(|a, b| a.count.cmp(&b.count).then_with(|| a.key.cmp(&b.key)));
    entries
}

/// The ten municipalities with the most accident deaths, smallest of the ten
/// first. Rows without deaths contribute nothing.
pub fn top_fatal_municipalities(table: &DerivedTable) -> Vec<KeyCount> {
    let mut totals: HashMap<&str, u64> = HashMap::new();
    for record in &table.records {
        if record.fatalities > 0 {
            *totals.entry(record.municipality.as_str()).or_default() += u64::from(record.fatalities);
        }
    }

    let mut entries: Vec<KeyCount> = totals
        .into_iter()
        .map(|(key, count)| KeyCount {
            key: key.to_string(),
            count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(TOP_MUNICIPALITIES);
    entries.reverse();
    entries
}

/// Accident counts per two-digit month, sorted by month.
pub fn monthly_counts(table: &DerivedTable) -> Vec<KeyCount> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for record in &table.records {
        *counts.entry(record.month.as_str()).or_default() += 1;
    }

    let mut entries: Vec<KeyCount> = counts
        .into_iter()
        .map(|(key, count)| KeyCount {
            key: key.to_string(),
            count,
        })
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
}

/// Accident counts per weather condition, the `"Ignorado"` sentinel and
/// nulls excluded, largest share first.
pub fn weather_distribution(table: &DerivedTable) -> Vec<KeyCount> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for record in &table.records {
        if let Some(weather) = &record.weather_condition {
            if weather != UNKNOWN_WEATHER {
                *counts.entry(weather.as_str()).or_default() += 1;
            }
        }
    }

    let mut entries: Vec<KeyCount> = counts
        .into_iter()
        .map(|(key, count)| KeyCount {
            key: key.to_string(),
            count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries
}

/// Everything one run produces for the charting layer, JSON-ready.
#[derive(Debug, Serialize)]
pub struct AccidentSummary {
    pub generated_at: DateTime<Utc>,
    pub scope: Scope,
    pub total_records: usize,
    pub municipalities: usize,
    pub total_fatalities: u64,
    pub skipped_lines: usize,
    pub rejected_rows: usize,
    pub age_distribution: Vec<AgeCount>,
    pub vehicle_types: Vec<KeyCount>,
    pub top_fatal_municipalities: Vec<KeyCount>,
    pub monthly_counts: Vec<KeyCount>,
    pub weather_distribution: Vec<KeyCount>,
}

impl AccidentSummary {
    pub fn from_table(scope: Scope, table: &DerivedTable, report: &QualityReport) -> Self {
        let mut municipalities: Vec<&str> = table
            .records
            .iter()
            .map(|r| r.municipality.as_str())
            .collect();
        municipalities.sort_unstable();
        municipalities.dedup();

        Self {
            generated_at: Utc::now(),
            scope,
            total_records: table.len(),
            municipalities: municipalities.len(),
            total_fatalities: table
                .records
                .iter()
                .map(|r| u64::from(r.fatalities))
                .sum(),
            skipped_lines: report.skipped_lines,
            rejected_rows: report.rejected_rows,
            age_distribution: age_distribution(table),
            vehicle_types: vehicle_type_counts(table),
            top_fatal_municipalities: top_fatal_municipalities(table),
            monthly_counts: monthly_counts(table),
            weather_distribution: weather_distribution(table),
        }
    }
}

/// Flat per-run row appended to the run log CSV.
#[derive(Debug, Serialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub scope: Scope,
    pub total_records: usize,
    pub municipalities: usize,
    pub total_fatalities: u64,
    pub skipped_lines: usize,
    pub rejected_rows: usize,
}

impl RunRecord {
    pub fn from_summary(summary: &AccidentSummary) -> Self {
        Self {
            timestamp: summary.generated_at,
            scope: summary.scope,
            total_records: summary.total_records,
            municipalities: summary.municipalities,
            total_fatalities: summary.total_fatalities,
            skipped_lines: summary.skipped_lines,
            rejected_rows: summary.rejected_rows,
        }
    }
}
