//! Normalization pipeline: two raw exports in, one derived table out.
//!
//! Stages run in the same order the upstream dataset is conventionally
//! cleaned: union of both sources, locality filter (metropolitan scope only,
//! on the still-quoted values), de-quote, coordinate decimal repair, column
//! canonicalization, temporal derivation.
//!
//! Failure policy is uniform and per-row: malformed lines were already
//! skipped at load time, and a row whose required fields do not coerce is
//! rejected, counted by kind in the [`QualityReport`], and logged. Only
//! structural problems (an empty source, a metropolitan run over sources
//! with no municipality column) fail the whole run.

use crate::model::{
    AccidentRecord, DerivedTable, METROPOLITAN_MUNICIPALITIES, MonthPeriod, Scope,
};
use crate::parser::{RawTable, parse_source};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Columns present in the raw exports but never used downstream. Absence is
/// a no-op.
const DROPPED_COLUMNS: &[&str] = &["pesid", "ano_fabricacao_veiculo", "marca"];

/// Raw, still-quoted name of the column the locality filter keys on.
const RAW_MUNICIPALITY_COLUMN: &str = "\"municipio\"";

/// Why a single row was rejected during normalization.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RowError {
    #[error("missing value in column `{0}`")]
    MissingValue(&'static str),
    #[error("invalid coordinate `{value}` in column `{column}`")]
    BadCoordinate { column: &'static str, value: String },
    #[error("coordinate {value} out of range in column `{column}`")]
    CoordinateOutOfRange { column: &'static str, value: f64 },
    #[error("unparseable date `{0}`")]
    BadDate(String),
    #[error("invalid fatality count `{0}`")]
    BadFatalities(String),
}

impl RowError {
    /// Short label used to bucket rejections in the quality report.
    pub fn kind(&self) -> &'static str {
        match self {
            RowError::MissingValue(_) => "missing_value",
            RowError::BadCoordinate { .. } => "bad_coordinate",
            RowError::CoordinateOutOfRange { .. } => "coordinate_out_of_range",
            RowError::BadDate(_) => "bad_date",
            RowError::BadFatalities(_) => "bad_fatalities",
        }
    }
}

/// Data-quality counters for one pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    /// Malformed lines dropped at load time, summed over both sources.
    pub skipped_lines: usize,
    /// Rows rejected during normalization.
    pub rejected_rows: usize,
    /// Rejection counts bucketed by [`RowError::kind`].
    pub rejections: BTreeMap<&'static str, usize>,
}

impl QualityReport {
    fn record(&mut self, error: &RowError) {
        self.rejected_rows += 1;
        *self.rejections.entry(error.kind()).or_default() += 1;
    }
}

/// Indices into the union row for every column the record model consumes,
/// plus the retained leftovers.
struct ColumnLayout {
    municipality: usize,
    latitude: usize,
    longitude: usize,
    date: usize,
    fatalities: usize,
    age: Option<usize>,
    vehicle_type: Option<usize>,
    weather: Option<usize>,
    /// `(output name, union index)` for every retained column not consumed
    /// by a named field.
    extra: Vec<(String, usize)>,
}

impl ColumnLayout {
    fn resolve(columns: &[String]) -> Result<Self> {
        let find = |name: &str| columns.iter().position(|c| c == name);
        let require = |name: &'static str| {
            find(name).with_context(|| format!("source has no `{name}` column"))
        };

        let named = [
            "municipio",
            "latitude",
            "longitude",
            "data_inversa",
            "mortos",
            "idade",
            "tipo_veiculo",
            "condicao_metereologica",
        ];

        let extra = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                !named.contains(&c.as_str()) && !DROPPED_COLUMNS.contains(&c.as_str())
            })
            .map(|(i, c)| (c.clone(), i))
            .collect();

        Ok(Self {
            municipality: require("municipio")?,
            latitude: require("latitude")?,
            longitude: require("longitude")?,
            date: require("data_inversa")?,
            fatalities: require("mortos")?,
            age: find("idade"),
            vehicle_type: find("tipo_veiculo"),
            weather: find("condicao_metereologica"),
            extra,
        })
    }
}

/// Builds the derived table for a scope. Pure and idempotent: the same
/// sources and scope always produce the same table and report.
pub fn build_table(sources: &[RawTable], scope: Scope) -> Result<(DerivedTable, QualityReport)> {
    let mut report = QualityReport {
        skipped_lines: sources.iter().map(|s| s.skipped_lines).sum(),
        ..QualityReport::default()
    };

    // Union of columns in first-seen order. No deduplication of rows.
    let mut union_columns: Vec<String> = Vec::new();
    for source in sources {
        for header in &source.headers {
            if !union_columns.contains(header) {
                union_columns.push(header.clone());
            }
        }
    }
    if union_columns.is_empty() {
        anyhow::bail!("no columns in any source");
    }

    // Align every row to the union; a source lacking a column contributes no
    // value for it.
    let mut raw_rows: Vec<Vec<Option<String>>> = Vec::new();
    for source in sources {
        let targets: Vec<usize> = source
            .headers
            .iter()
            .map(|h| {
                union_columns
                    .iter()
                    .position(|c| c == h)
                    .unwrap_or_else(|| unreachable!("header present in union by construction"))
            })
            .collect();

        for row in &source.rows {
            let mut aligned: Vec<Option<String>> = vec![None; union_columns.len()];
            for (value, &target) in row.iter().zip(&targets) {
                aligned[target] = Some(value.clone());
            }
            raw_rows.push(aligned);
        }
    }

    // Locality filter runs before de-quoting: the allow-list carries the raw
    // export's literal quotes, so values are compared as loaded.
    if scope == Scope::Metropolitan {
        let muni = union_columns
            .iter()
            .position(|c| c == RAW_MUNICIPALITY_COLUMN)
            .context("metropolitan scope requires a municipality column")?;

        let before = raw_rows.len();
        raw_rows.retain(|row| match &row[muni] {
            Some(value) => METROPOLITAN_MUNICIPALITIES.contains(&value.as_str()),
            None => false,
        });
        debug!(
            before,
            after = raw_rows.len(),
            "Applied metropolitan locality filter"
        );
    }

    // De-quote and canonicalize headers, de-quote every cell.
    let columns: Vec<String> = union_columns
        .iter()
        .map(|h| h.replace('"', "").to_lowercase())
        .collect();
    for row in &mut raw_rows {
        for cell in row.iter_mut().flatten() {
            if cell.contains('"') {
                *cell = cell.replace('"', "");
            }
        }
    }

    let layout = ColumnLayout::resolve(&columns)?;

    let mut records = Vec::with_capacity(raw_rows.len());
    for row in &raw_rows {
        match normalize_row(row, &layout) {
            Ok(record) => records.push(record),
            Err(error) => {
                debug!(%error, "Rejected row");
                report.record(&error);
            }
        }
    }

    let mut out_columns: Vec<String> = columns
        .iter()
        .filter(|c| !DROPPED_COLUMNS.contains(&c.as_str()))
        .cloned()
        .collect();
    out_columns.push("mes".to_string());

    if report.rejected_rows > 0 {
        warn!(
            rejected = report.rejected_rows,
            rejections = ?report.rejections,
            "Rows rejected during normalization"
        );
    }
    info!(
        scope = ?scope,
        records = records.len(),
        skipped_lines = report.skipped_lines,
        rejected_rows = report.rejected_rows,
        "Derived table built"
    );

    Ok((
        DerivedTable {
            columns: out_columns,
            records,
        },
        report,
    ))
}

fn normalize_row(row: &[Option<String>], layout: &ColumnLayout) -> Result<AccidentRecord, RowError> {
    let required = |index: usize, column: &'static str| {
        row[index]
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or(RowError::MissingValue(column))
    };
    let optional = |index: Option<usize>| {
        index
            .and_then(|i| row[i].as_deref())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let municipality = required(layout.municipality, "municipio")?.to_string();

    let latitude = parse_coordinate(required(layout.latitude, "latitude")?, "latitude", 90.0)?;
    let longitude = parse_coordinate(required(layout.longitude, "longitude")?, "longitude", 180.0)?;

    let date_text = required(layout.date, "data_inversa")?;
    let date = parse_accident_date(date_text).ok_or_else(|| RowError::BadDate(date_text.to_string()))?;
    let occurred_at = MonthPeriod::from_date(date);
    let month = occurred_at.month_label();

    // A row from a source without a fatality column counts as zero deaths;
    // an unparseable value rejects the row.
    let fatalities = match row[layout.fatalities].as_deref().filter(|v| !v.is_empty()) {
        Some(value) => value
            .trim()
            .parse::<u32>()
            .map_err(|_| RowError::BadFatalities(value.to_string()))?,
        None => 0,
    };

    // Ages that do not parse become nulls rather than rejections; the age
    // view drops them along with the >100 sentinels.
    let age = optional(layout.age).and_then(|v| v.trim().parse::<i64>().ok());

    let mut extra = BTreeMap::new();
    for (name, index) in &layout.extra {
        if let Some(value) = &row[*index] {
            extra.insert(name.clone(), value.clone());
        }
    }

    Ok(AccidentRecord {
        occurred_at,
        month,
        municipality,
        latitude,
        longitude,
        age,
        vehicle_type: optional(layout.vehicle_type),
        fatalities,
        weather_condition: optional(layout.weather),
        extra,
    })
}

/// Repairs the comma decimal separator and parses a coordinate, enforcing
/// the geographic range for the axis.
fn parse_coordinate(text: &str, column: &'static str, bound: f64) -> Result<f64, RowError> {
    let repaired = text.replace(',', ".");
    let value: f64 = repaired.trim().parse().map_err(|_| RowError::BadCoordinate {
        column,
        value: text.to_string(),
    })?;

    if !value.is_finite() || value.abs() > bound {
        return Err(RowError::CoordinateOutOfRange { column, value });
    }
    Ok(value)
}

/// `data_inversa` is ISO-dated in the current exports; older vintages used
/// day-first.
fn parse_accident_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%d/%m/%Y"))
        .ok()
}

/// Explicit replacement for the dashboard's re-run-everything model: the
/// sources are parsed once, and the derived table for each scope is built on
/// first request and cached until the pipeline is dropped.
pub struct AccidentPipeline {
    sources: Vec<RawTable>,
    cache: HashMap<Scope, Arc<(DerivedTable, QualityReport)>>,
}

impl AccidentPipeline {
    pub fn new(sources: Vec<RawTable>) -> Self {
        Self {
            sources,
            cache: HashMap::new(),
        }
    }

    /// Parses each raw source document and assembles the pipeline.
    pub fn from_bytes<B: AsRef<[u8]>>(sources: &[B]) -> Result<Self> {
        let parsed = sources
            .iter()
            .map(|bytes| parse_source(bytes.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(parsed))
    }

    /// Derived table and quality report for a scope, built on first use.
    pub fn table(&mut self, scope: Scope) -> Result<Arc<(DerivedTable, QualityReport)>> {
        if let Some(cached) = self.cache.get(&scope) {
            return Ok(Arc::clone(cached));
        }

        let built = Arc::new(build_table(&self.sources, scope)?);
        self.cache.insert(scope, Arc::clone(&built));
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|v| v.to_string()).collect())
                .collect(),
            skipped_lines: 0,
        }
    }

    fn two_sources() -> Vec<RawTable> {
        let a = source(
            &[
                "\"id\"",
                "\"data_inversa\"",
                "\"municipio\"",
                "\"latitude\"",
                "\"longitude\"",
                "\"idade\"",
                "\"tipo_veiculo\"",
                "\"mortos\"",
                "\"condicao_metereologica\"",
                "\"pesid\"",
            ],
            &[
                &[
                    "\"1\"",
                    "\"2022-01-05\"",
                    "\"FORTALEZA\"",
                    "\"-3,71\"",
                    "\"-38,54\"",
                    "\"34\"",
                    "\"Automóvel\"",
                    "\"0\"",
                    "\"Céu Claro\"",
                    "\"9001\"",
                ],
                &[
                    "\"2\"",
                    "\"2022-07-19\"",
                    "\"SOBRAL\"",
                    "\"-3,68\"",
                    "\"-40,34\"",
                    "\"150\"",
                    "\"Motocicleta\"",
                    "\"2\"",
                    "\"Chuva\"",
                    "\"9002\"",
                ],
            ],
        );
        let b = source(
            &[
                "\"id\"",
                "\"data_inversa\"",
                "\"municipio\"",
                "\"latitude\"",
                "\"longitude\"",
                "\"idade\"",
                "\"tipo_veiculo\"",
                "\"mortos\"",
                "\"condicao_metereologica\"",
                "\"marca\"",
            ],
            &[&[
                "\"3\"",
                "\"2023-11-02\"",
                "\"CAUCAIA\"",
                "\"-3,73\"",
                "\"-38,65\"",
                "\"58\"",
                "\"Automóvel\"",
                "\"1\"",
                "\"Ignorado\"",
                "\"FIAT\"",
            ]],
        );
        vec![a, b]
    }

    #[test]
    fn test_state_scope_keeps_all_rows() {
        let (table, report) = build_table(&two_sources(), Scope::State).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(report.rejected_rows, 0);
    }

    #[test]
    fn test_metropolitan_scope_is_subset() {
        let sources = two_sources();
        let (state, _) = build_table(&sources, Scope::State).unwrap();
        let (metro, _) = build_table(&sources, Scope::Metropolitan).unwrap();

        assert_eq!(metro.len(), 2);
        for record in &metro.records {
            assert!(state.records.contains(record));
            let quoted = format!("\"{}\"", record.municipality);
            assert!(METROPOLITAN_MUNICIPALITIES.contains(&quoted.as_str()));
        }
    }

    #[test]
    fn test_no_quotes_survive_normalization() {
        let (table, _) = build_table(&two_sources(), Scope::State).unwrap();

        for column in &table.columns {
            assert!(!column.contains('"'));
        }
        for record in &table.records {
            assert!(!record.municipality.contains('"'));
            for (key, value) in &record.extra {
                assert!(!key.contains('"'));
                assert!(!value.contains('"'));
            }
        }
    }

    #[test]
    fn test_dropped_columns_never_appear() {
        let (table, _) = build_table(&two_sources(), Scope::State).unwrap();

        for dropped in DROPPED_COLUMNS {
            assert!(!table.columns.iter().any(|c| c == dropped));
        }
        for record in &table.records {
            for dropped in DROPPED_COLUMNS {
                assert!(!record.extra.contains_key(*dropped));
            }
        }
    }

    #[test]
    fn test_decimal_repair_and_month_derivation() {
        let (table, _) = build_table(&two_sources(), Scope::State).unwrap();
        let first = &table.records[0];

        assert!((first.latitude - -3.71).abs() < 1e-9);
        assert!((first.longitude - -38.54).abs() < 1e-9);
        assert_eq!(first.month, "01");
        assert_eq!(first.occurred_at.to_string(), "2022-01");
        assert!(table.columns.iter().any(|c| c == "mes"));
    }

    #[test]
    fn test_column_union_with_missing_values() {
        let (table, _) = build_table(&two_sources(), Scope::State).unwrap();

        // `marca` is dropped; `id` exists in both; rows from the first
        // source never gained a value for columns unique to the second.
        let caucaia = table
            .records
            .iter()
            .find(|r| r.municipality == "CAUCAIA")
            .unwrap();
        assert_eq!(caucaia.extra.get("id").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_bad_coordinate_rejects_only_that_row() {
        let bad = source(
            &[
                "\"data_inversa\"",
                "\"municipio\"",
                "\"latitude\"",
                "\"longitude\"",
                "\"mortos\"",
            ],
            &[
                &["\"2022-03-01\"", "\"SOBRAL\"", "\"abc\"", "\"-40,1\"", "\"0\""],
                &["\"2022-03-02\"", "\"SOBRAL\"", "\"-3,6\"", "\"-40,2\"", "\"0\""],
            ],
        );
        let (table, report) = build_table(&[bad], Scope::State).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(report.rejected_rows, 1);
        assert_eq!(report.rejections.get("bad_coordinate"), Some(&1));
    }

    #[test]
    fn test_out_of_range_coordinate_rejected() {
        let bad = source(
            &[
                "\"data_inversa\"",
                "\"municipio\"",
                "\"latitude\"",
                "\"longitude\"",
                "\"mortos\"",
            ],
            &[&["\"2022-03-01\"", "\"SOBRAL\"", "\"-95,0\"", "\"-40,1\"", "\"0\""]],
        );
        let (table, report) = build_table(&[bad], Scope::State).unwrap();

        assert!(table.is_empty());
        assert_eq!(report.rejections.get("coordinate_out_of_range"), Some(&1));
    }

    #[test]
    fn test_bad_date_rejected() {
        let bad = source(
            &[
                "\"data_inversa\"",
                "\"municipio\"",
                "\"latitude\"",
                "\"longitude\"",
                "\"mortos\"",
            ],
            &[&["\"not-a-date\"", "\"SOBRAL\"", "\"-3,6\"", "\"-40,1\"", "\"0\""]],
        );
        let (table, report) = build_table(&[bad], Scope::State).unwrap();

        assert!(table.is_empty());
        assert_eq!(report.rejections.get("bad_date"), Some(&1));
    }

    #[test]
    fn test_day_first_date_fallback() {
        let old = source(
            &[
                "\"data_inversa\"",
                "\"municipio\"",
                "\"latitude\"",
                "\"longitude\"",
                "\"mortos\"",
            ],
            &[&["\"05/09/2022\"", "\"SOBRAL\"", "\"-3,6\"", "\"-40,1\"", "\"0\""]],
        );
        let (table, _) = build_table(&[old], Scope::State).unwrap();

        assert_eq!(table.records[0].month, "09");
    }

    #[test]
    fn test_idempotent_rebuild() {
        let sources = two_sources();
        let first = build_table(&sources, Scope::State).unwrap();
        let second = build_table(&sources, Scope::State).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_pipeline_caches_per_scope() {
        let mut pipeline = AccidentPipeline::new(two_sources());
        let a = pipeline.table(Scope::Metropolitan).unwrap();
        let b = pipeline.table(Scope::Metropolitan).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        let state = pipeline.table(Scope::State).unwrap();
        assert!(state.0.len() > a.0.len());
    }

    #[test]
    fn test_metropolitan_without_municipality_column_is_error() {
        let headerless = source(&["\"id\""], &[&["\"1\""]]);
        assert!(build_table(&[headerless], Scope::Metropolitan).is_err());
    }

    #[test]
    fn test_empty_metropolitan_match_yields_empty_table() {
        let interior = source(
            &[
                "\"data_inversa\"",
                "\"municipio\"",
                "\"latitude\"",
                "\"longitude\"",
                "\"mortos\"",
            ],
            &[&["\"2022-03-01\"", "\"CRATO\"", "\"-7,2\"", "\"-39,4\"", "\"0\""]],
        );
        let (table, report) = build_table(&[interior], Scope::Metropolitan).unwrap();

        assert!(table.is_empty());
        assert_eq!(report.rejected_rows, 0);
    }
}
