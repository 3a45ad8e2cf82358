use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use ts_core::{timestamp_of, Ohlcv, SeriesError, TimeSeries, Timestamp};

/// Date format used by mark feeds.
pub const MARK_DATE_FORMAT: &str = "%m/%d/%Y";
/// Date format used by record feeds.
pub const RECORD_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid record date: {0:?}")]
    InvalidDate(String),
    #[error("invalid volume {volume} on {date:?}")]
    InvalidVolume { date: String, volume: f64 },
    #[error("series error: {0}")]
    Series(#[from] SeriesError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkDirection {
    Over,
    Under,
}

/// A calendar-anchored signal mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateMark {
    /// "MM/DD/YYYY".
    pub date: String,
    pub direction: MarkDirection,
    pub color: String,
}

impl DateMark {
    /// `None` when the date string does not name a real day.
    pub fn parsed_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.date.trim(), MARK_DATE_FORMAT).ok()
    }
}

/// Support/resistance levels plus dated marks for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Marks {
    #[serde(rename = "R1", default, skip_serializing_if = "Option::is_none")]
    pub r1: Option<f64>,
    #[serde(rename = "R2", default, skip_serializing_if = "Option::is_none")]
    pub r2: Option<f64>,
    #[serde(rename = "S1", default, skip_serializing_if = "Option::is_none")]
    pub s1: Option<f64>,
    #[serde(rename = "S2", default, skip_serializing_if = "Option::is_none")]
    pub s2: Option<f64>,
    #[serde(default)]
    pub marks: Vec<DateMark>,
}

impl Marks {
    /// Present levels as (label, price), resistances first.
    pub fn levels(&self) -> Vec<(&'static str, f64)> {
        [("R1", self.r1), ("R2", self.r2), ("S1", self.s1), ("S2", self.s2)]
            .into_iter()
            .filter_map(|(label, price)| price.map(|p| (label, p)))
            .collect()
    }
}

/// Supplier of already-resolved chart inputs. Fetching is the
/// implementor's business; nothing here performs I/O.
pub trait DataSource {
    fn records(&self) -> Result<Vec<Ohlcv>, FeedError>;
    fn marks(&self) -> Result<Marks, FeedError>;
}

/// In-memory source, mostly for tests and demos.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Vec<Ohlcv>,
    marks: Marks,
}

impl StaticSource {
    pub fn new(records: Vec<Ohlcv>, marks: Marks) -> Self {
        Self { records, marks }
    }
}

impl DataSource for StaticSource {
    fn records(&self) -> Result<Vec<Ohlcv>, FeedError> {
        Ok(self.records.clone())
    }

    fn marks(&self) -> Result<Marks, FeedError> {
        Ok(self.marks.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RecordDate {
    Millis(Timestamp),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
struct RecordRow {
    date: RecordDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl TryFrom<RecordRow> for Ohlcv {
    type Error = FeedError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let date = match row.date {
            RecordDate::Millis(ms) => ms,
            RecordDate::Text(text) => {
                let day = NaiveDate::parse_from_str(text.trim(), RECORD_DATE_FORMAT)
                    .map_err(|_| FeedError::InvalidDate(text.clone()))?;
                timestamp_of(day)
            }
        };
        if !row.volume.is_finite() || row.volume < 0.0 {
            return Err(FeedError::InvalidVolume {
                date: date.to_string(),
                volume: row.volume,
            });
        }
        Ok(Ohlcv {
            date,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume.round() as u64,
        })
    }
}

/// Source over JSON payloads already fetched by the caller.
///
/// Records are an array of `{date, open, high, low, close, volume}` where
/// `date` is either epoch milliseconds or "YYYY-MM-DD". Marks use the
/// `{R1, R2, S1, S2, marks}` shape.
#[derive(Debug, Clone)]
pub struct JsonSource {
    records_json: String,
    marks_json: String,
}

impl JsonSource {
    pub fn new(records_json: impl Into<String>, marks_json: impl Into<String>) -> Self {
        Self {
            records_json: records_json.into(),
            marks_json: marks_json.into(),
        }
    }
}

impl DataSource for JsonSource {
    fn records(&self) -> Result<Vec<Ohlcv>, FeedError> {
        let rows: Vec<RecordRow> = serde_json::from_str(&self.records_json)?;
        rows.into_iter().map(Ohlcv::try_from).collect()
    }

    fn marks(&self) -> Result<Marks, FeedError> {
        Ok(serde_json::from_str(&self.marks_json)?)
    }
}

/// Pull records from `source` into an ordered, duplicate-free series.
pub fn load_series(source: &dyn DataSource) -> Result<TimeSeries<Ohlcv>, FeedError> {
    let records = source.records()?;
    let series = TimeSeries::from_unsorted(records)?;
    debug!(
        records = series.len(),
        first = series.first().map(|r| r.date),
        last = series.last().map(|r| r.date),
        "series loaded"
    );
    Ok(series)
}
