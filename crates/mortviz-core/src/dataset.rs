//! Dataset Store: loads and cleans the mortality CSV into an in-memory table.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Trim};
use thiserror::Error;

use crate::{columns, series_by_entity, Metric, Record, Selection, SeriesPoint};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing dataset csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("dataset is missing required column `{0}`")]
    MissingColumn(&'static str),
    #[error("line {line}: column `{column}` is empty after cleaning")]
    EmptyField { line: u64, column: &'static str },
    #[error("line {line}: column `{column}` has invalid value `{value}`")]
    InvalidField {
        line: u64,
        column: &'static str,
        value: String,
    },
}

/// Strip a trailing `[...]` footnote marker and surrounding whitespace.
pub fn clean_numeric(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed.find('[') {
        Some(idx) => trimmed[..idx].trim_end(),
        None => trimmed,
    }
}

/// Ordered, immutable collection of records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    records: Vec<Record>,
}

struct ColumnIndex {
    country: usize,
    year: usize,
    deaths: usize,
    rate: usize,
}

impl ColumnIndex {
    fn from_headers(headers: &StringRecord) -> Result<Self, LoadError> {
        let find = |name: &'static str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or(LoadError::MissingColumn(name))
        };
        Ok(Self {
            country: find(columns::COUNTRY)?,
            year: find(columns::YEAR)?,
            deaths: find(columns::DEATHS)?,
            rate: find(columns::DEATHS_PER_100K)?,
        })
    }
}

impl Dataset {
    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, LoadError> {
        let mut rdr = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);
        let index = ColumnIndex::from_headers(rdr.headers()?)?;

        let mut records = Vec::new();
        for (row_no, row) in rdr.records().enumerate() {
            let row = row?;
            let line = row
                .position()
                .map(|p| p.line())
                .unwrap_or(row_no as u64 + 2);
            records.push(parse_row(&row, &index, line)?);
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sorted, de-duplicated entity names.
    pub fn entities(&self) -> Vec<String> {
        self.entity_set().into_iter().map(str::to_string).collect()
    }

    pub fn entity_set(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.entity.as_str()).collect()
    }

    pub fn years(&self) -> BTreeSet<i32> {
        self.records.iter().map(|r| r.year).collect()
    }

    pub fn filter(&self, filter: &DatasetFilter) -> Selection<Dataset> {
        let records = self
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        if records.is_empty() {
            Selection::Empty
        } else {
            Selection::Found(Dataset { records })
        }
    }

    /// Per-entity series of `metric`, sorted by year; entities without rows are omitted.
    pub fn aggregate_by_entity<S: AsRef<str>>(
        &self,
        entities: &[S],
        metric: Metric,
    ) -> BTreeMap<String, Vec<SeriesPoint>> {
        series_by_entity(
            self.records
                .iter()
                .map(|r| (r.entity.as_str(), r.year, metric.of_record(r))),
            entities,
        )
    }
}

fn parse_row(row: &StringRecord, index: &ColumnIndex, line: u64) -> Result<Record, LoadError> {
    let entity = row.get(index.country).unwrap_or_default().trim();
    if entity.is_empty() {
        return Err(LoadError::EmptyField {
            line,
            column: columns::COUNTRY,
        });
    }

    let year_raw = row.get(index.year).unwrap_or_default().trim();
    let year = year_raw.parse::<i32>().map_err(|_| LoadError::InvalidField {
        line,
        column: columns::YEAR,
        value: year_raw.to_string(),
    })?;

    let deaths_raw = cleaned_field(row, index.deaths, columns::DEATHS, line)?;
    let deaths = deaths_raw
        .parse::<u64>()
        .map_err(|_| LoadError::InvalidField {
            line,
            column: columns::DEATHS,
            value: deaths_raw.to_string(),
        })?;

    let rate_raw = cleaned_field(row, index.rate, columns::DEATHS_PER_100K, line)?;
    let deaths_per_100k = rate_raw
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| LoadError::InvalidField {
            line,
            column: columns::DEATHS_PER_100K,
            value: rate_raw.to_string(),
        })?;

    Ok(Record {
        entity: entity.to_string(),
        year,
        deaths,
        deaths_per_100k,
    })
}

fn cleaned_field<'a>(
    row: &'a StringRecord,
    idx: usize,
    column: &'static str,
    line: u64,
) -> Result<&'a str, LoadError> {
    let cleaned = clean_numeric(row.get(idx).unwrap_or_default());
    if cleaned.is_empty() {
        Err(LoadError::EmptyField { line, column })
    } else {
        Ok(cleaned)
    }
}

/// Entity and year restriction; an empty set means "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetFilter {
    entities: BTreeSet<String>,
    years: BTreeSet<i32>,
}

impl DatasetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities.extend(entities.into_iter().map(Into::into));
        self
    }

    pub fn with_years(mut self, years: impl IntoIterator<Item = i32>) -> Self {
        self.years.extend(years);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        (self.entities.is_empty() || self.entities.contains(&record.entity))
            && (self.years.is_empty() || self.years.contains(&record.year))
    }
}
