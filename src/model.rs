//! Data model for the derived accident table.

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Analysis scope selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Only the sixteen municipalities of the Fortaleza metropolitan area.
    Metropolitan,
    /// The whole state; no locality filter.
    State,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Metropolitan => write!(f, "metropolitan"),
            Scope::State => write!(f, "state"),
        }
    }
}

/// Municipalities making up the metropolitan scope.
///
/// The names carry the literal quote characters of the raw export because the
/// locality filter runs before the de-quote stage and compares cell values as
/// they appear on the wire.
pub static METROPOLITAN_MUNICIPALITIES: &[&str] = &[
    "\"FORTALEZA\"",
    "\"CAUCAIA\"",
    "\"EUSEBIO\"",
    "\"AQUIRAZ\"",
    "\"CASCAVEL\"",
    "\"CHOROZINHO\"",
    "\"HORIZONTE\"",
    "\"MARANGUAPE\"",
    "\"MARACANAU\"",
    "\"PACAJUS\"",
    "\"PARACURU\"",
    "\"PINDORETAMA\"",
    "\"PARAIPABA\"",
    "\"SAO GONÇALO DO AMARANTE\"",
    "\"SAO LUIZ DO CURU\"",
    "\"TRAIRI\"",
];

/// A calendar month: `data_inversa` truncated to year + month. The day
/// component is discarded on purpose; every time-based view works at month
/// granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MonthPeriod {
    pub year: i32,
    pub month: u32,
}

impl MonthPeriod {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Zero-padded two-digit month string, `"01"` through `"12"`.
    pub fn month_label(&self) -> String {
        format!("{:02}", self.month)
    }
}

impl fmt::Display for MonthPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// One normalized accident-involvement row.
///
/// Named fields cover the columns the views consume; everything else that
/// survives normalization is kept verbatim in `extra`. A column missing from
/// one of the two source files is simply absent from that source's rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccidentRecord {
    pub occurred_at: MonthPeriod,
    /// Two-digit month derived from `occurred_at`.
    pub month: String,
    pub municipality: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Age of the involved person. Values above 100 are sentinels: they stay
    /// in the table but are excluded from the age view.
    pub age: Option<i64>,
    pub vehicle_type: Option<String>,
    pub fatalities: u32,
    /// Includes the explicit `"Ignorado"` sentinel, which the weather view
    /// filters out.
    pub weather_condition: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// The single normalized table every view consumes. Built once per run and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedTable {
    /// Lower-cased, quote-free column names: the union of both sources'
    /// headers, minus the dropped columns, plus the derived `mes` column.
    pub columns: Vec<String>,
    pub records: Vec<AccidentRecord>,
}

impl DerivedTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_label_is_zero_padded() {
        let date = NaiveDate::from_ymd_opt(2022, 3, 17).unwrap();
        let period = MonthPeriod::from_date(date);

        assert_eq!(period.month_label(), "03");
        assert_eq!(period.to_string(), "2022-03");
    }

    #[test]
    fn test_month_period_discards_day() {
        let a = NaiveDate::from_ymd_opt(2023, 12, 1).unwrap();
        let b = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();

        assert_eq!(MonthPeriod::from_date(a), MonthPeriod::from_date(b));
    }

    #[test]
    fn test_allow_list_has_sixteen_quoted_names() {
        assert_eq!(METROPOLITAN_MUNICIPALITIES.len(), 16);
        for name in METROPOLITAN_MUNICIPALITIES {
            assert!(name.starts_with('"') && name.ends_with('"'));
        }
    }
}
