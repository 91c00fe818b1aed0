//! Core domain model for mortviz: mortality records, reference attributes and artifact keys.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod dataset;

pub use dataset::{clean_numeric, Dataset, DatasetFilter, LoadError};

pub const CRATE_NAME: &str = "mortviz-core";

/// Column names of the source CSV and of the enriched output table.
pub mod columns {
    pub const COUNTRY: &str = "Country";
    pub const YEAR: &str = "Year";
    pub const DEATHS: &str = "Deaths";
    pub const DEATHS_PER_100K: &str = "Deaths_per_100_000_population";
    pub const CODE: &str = "Code";
    pub const CAPITAL: &str = "Capital";
    pub const POPULATION: &str = "Population";
    pub const AREA: &str = "Area";
    pub const GINI: &str = "Gini";
    pub const DEATHS_PERCENT: &str = "Deaths_by_percent_of_population";
}

/// One cleaned (entity, year) observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity: String,
    pub year: i32,
    pub deaths: u64,
    pub deaths_per_100k: f64,
}

/// Static descriptive data about an entity, as served by the lookup service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceAttributes {
    pub code: String,
    pub capital: String,
    pub population: u64,
    pub area: Option<f64>,
    pub gini: Option<f64>,
}

/// A record with the five reference columns and the derived percent column appended.
///
/// All records of one entity share the same `reference` allocation within an enrichment pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub record: Record,
    pub reference: Arc<ReferenceAttributes>,
    pub deaths_percent_of_population: Option<f64>,
}

impl EnrichedRecord {
    pub fn new(record: Record, reference: Arc<ReferenceAttributes>) -> Self {
        let deaths_percent_of_population =
            percent_of_population(record.deaths, reference.population);
        Self {
            record,
            reference,
            deaths_percent_of_population,
        }
    }

    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::PercentOfPopulation => self.deaths_percent_of_population,
            other => other.of_record(&self.record),
        }
    }
}

/// `deaths / population * 100`; undefined for an empty population.
pub fn percent_of_population(deaths: u64, population: u64) -> Option<f64> {
    if population == 0 {
        None
    } else {
        Some(deaths as f64 / population as f64 * 100.0)
    }
}

/// Output of an enrichment pass, in the input dataset's row order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnrichedDataset {
    rows: Vec<EnrichedRecord>,
}

impl EnrichedDataset {
    pub fn from_rows(rows: Vec<EnrichedRecord>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[EnrichedRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct entity -> reference mapping carried by the rows.
    pub fn references(&self) -> BTreeMap<&str, &Arc<ReferenceAttributes>> {
        self.rows
            .iter()
            .map(|row| (row.record.entity.as_str(), &row.reference))
            .collect()
    }

    pub fn aggregate_by_entity<S: AsRef<str>>(
        &self,
        entities: &[S],
        metric: Metric,
    ) -> BTreeMap<String, Vec<SeriesPoint>> {
        series_by_entity(
            self.rows
                .iter()
                .map(|row| (row.record.entity.as_str(), row.record.year, row.metric(metric))),
            entities,
        )
    }
}

/// Numeric column selectable for chart series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Deaths,
    DeathsPer100k,
    PercentOfPopulation,
}

impl Metric {
    /// Value of this metric on a raw record; the derived percent needs enrichment first.
    pub fn of_record(self, record: &Record) -> Option<f64> {
        match self {
            Metric::Deaths => Some(record.deaths as f64),
            Metric::DeathsPer100k => Some(record.deaths_per_100k),
            Metric::PercentOfPopulation => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Metric::Deaths => columns::DEATHS,
            Metric::DeathsPer100k => columns::DEATHS_PER_100K,
            Metric::PercentOfPopulation => columns::DEATHS_PERCENT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub year: i32,
    pub value: f64,
}

pub(crate) fn series_by_entity<'a, I, S>(rows: I, entities: &[S]) -> BTreeMap<String, Vec<SeriesPoint>>
where
    I: Iterator<Item = (&'a str, i32, Option<f64>)>,
    S: AsRef<str>,
{
    let mut out: BTreeMap<String, Vec<SeriesPoint>> = BTreeMap::new();
    for (entity, year, value) in rows {
        let Some(value) = value else { continue };
        if !entities.iter().any(|e| e.as_ref() == entity) {
            continue;
        }
        out.entry(entity.to_string())
            .or_default()
            .push(SeriesPoint { year, value });
    }
    for series in out.values_mut() {
        series.sort_by_key(|p| p.year);
    }
    out
}

/// Explicit "nothing to visualize" marker, distinct from an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection<T> {
    Found(T),
    Empty,
}

impl<T> Selection<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Selection::Empty)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Selection::Found(value) => Some(value),
            Selection::Empty => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Selection<U> {
        match self {
            Selection::Found(value) => Selection::Found(f(value)),
            Selection::Empty => Selection::Empty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    WorldMap,
    Histogram,
    PerPeriodBars,
    CumulativeBars,
}

impl ChartKind {
    pub fn is_entity_keyed(self) -> bool {
        matches!(self, ChartKind::PerPeriodBars | ChartKind::CumulativeBars)
    }

    pub fn folder(self) -> &'static str {
        if self.is_entity_keyed() {
            "bars"
        } else {
            "maps"
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChartKind::WorldMap => "world_map",
            ChartKind::Histogram => "histogram",
            ChartKind::PerPeriodBars => "per_period_bars",
            ChartKind::CumulativeBars => "cumulative_bars",
        }
    }
}

/// Canonical cache key: chart kind plus a sorted, de-duplicated parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    kind: ChartKind,
    params: Vec<String>,
}

impl ArtifactKey {
    pub fn new<I, S>(kind: ChartKind, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut params = params.into_iter().map(Into::into).collect::<Vec<_>>();
        params.sort();
        params.dedup();
        Self { kind, params }
    }

    pub fn for_year(kind: ChartKind, year: i32) -> Self {
        Self::new(kind, [year.to_string()])
    }

    pub fn kind(&self) -> ChartKind {
        self.kind
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Path of the artifact relative to the cache root, e.g. `bars/Canada_France_d.html`.
    pub fn relative_path(&self) -> PathBuf {
        let joined = self
            .params
            .iter()
            .map(|p| file_fragment(p))
            .collect::<Vec<_>>()
            .join("_");
        let file_name = match self.kind {
            ChartKind::WorldMap => format!("map_{joined}.html"),
            ChartKind::Histogram => format!("hist_{joined}.html"),
            ChartKind::PerPeriodBars => format!("{joined}_d.html"),
            ChartKind::CumulativeBars => format!("{joined}_c.html"),
        };
        PathBuf::from(self.kind.folder()).join(file_name)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.params.join(","))
    }
}

/// Injective file-name encoding: alphanumerics pass through, a space becomes `-`, and any
/// other character becomes `~{hex code point}.`, so `Guinea Bissau` and `Guinea-Bissau`
/// land on different files.
fn file_fragment(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.trim().chars() {
        match c {
            c if c.is_alphanumeric() => out.push(c),
            ' ' => out.push('-'),
            other => out.push_str(&format!("~{:x}.", u32::from(other))),
        }
    }
    out
}
