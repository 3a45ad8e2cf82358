use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Range;
use thiserror::Error;

/// Milliseconds since Unix epoch (UTC).
pub type Timestamp = i64;

/// Number of milliseconds in common units.
pub const MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60 * MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// One daily (or intraday) price bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub date: Timestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Up/down classification used by adapters to colour bars and volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleDirection {
    Up,
    Down,
    Flat,
}

impl Ohlcv {
    pub fn direction(&self) -> CandleDirection {
        match self.close.partial_cmp(&self.open) {
            Some(Ordering::Greater) => CandleDirection::Up,
            Some(Ordering::Less) => CandleDirection::Down,
            _ => CandleDirection::Flat,
        }
    }

    /// Calendar date (UTC) of this bar.
    pub fn calendar_date(&self) -> Option<NaiveDate> {
        date_of(self.date)
    }
}

pub trait HasTimestamp {
    fn ts(&self) -> Timestamp;
}

impl HasTimestamp for Ohlcv {
    fn ts(&self) -> Timestamp {
        self.date
    }
}

/// UTC calendar date of a timestamp.
pub fn date_of(ts: Timestamp) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ts).map(|dt| dt.date_naive())
}

/// Midnight UTC of a calendar date.
pub fn timestamp_of(date: NaiveDate) -> Timestamp {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN);
    date.signed_duration_since(epoch).num_days() * DAY_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeriesError {
    #[error("duplicate timestamp {0}")]
    Duplicate(Timestamp),
    #[error("timestamp {next} is older than the last sample at {previous}")]
    OutOfOrder { previous: Timestamp, next: Timestamp },
}

/// Time-series with strictly increasing timestamps. Samples only get in
/// through the validating constructors and `append`.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSeries<T> {
    data: Vec<T>,
}

impl<T> Default for TimeSeries<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

impl<T: HasTimestamp> TimeSeries<T> {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Build from samples that must already be in strictly increasing order.
    pub fn from_vec(data: Vec<T>) -> Result<Self, SeriesError> {
        let mut series = Self::new();
        series.append_batch(data)?;
        Ok(series)
    }

    /// Build from unsorted samples; sorts first, duplicates are still rejected.
    pub fn from_unsorted(mut data: Vec<T>) -> Result<Self, SeriesError> {
        data.sort_by_key(|s| s.ts());
        Self::from_vec(data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn first(&self) -> Option<&T> {
        self.data.first()
    }

    pub fn last(&self) -> Option<&T> {
        self.data.last()
    }

    pub fn get(&self, ordinal: usize) -> Option<&T> {
        self.data.get(ordinal)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn append(&mut self, sample: T) -> Result<(), SeriesError> {
        if let Some(last) = self.data.last() {
            match sample.ts().cmp(&last.ts()) {
                Ordering::Greater => {}
                Ordering::Equal => return Err(SeriesError::Duplicate(sample.ts())),
                Ordering::Less => {
                    return Err(SeriesError::OutOfOrder {
                        previous: last.ts(),
                        next: sample.ts(),
                    })
                }
            }
        }
        self.data.push(sample);
        Ok(())
    }

    pub fn append_batch<I: IntoIterator<Item = T>>(&mut self, iter: I) -> Result<(), SeriesError> {
        for s in iter {
            self.append(s)?;
        }
        Ok(())
    }

    /// Returns a slice of samples whose timestamps are in [start_ts, end_ts).
    pub fn range(&self, start_ts: Timestamp, end_ts: Timestamp) -> &[T] {
        let start_idx = self.lower_bound(start_ts);
        let end_idx = self.lower_bound(end_ts).max(start_idx);
        &self.data[start_idx..end_idx]
    }

    /// The most recent `n` samples.
    pub fn tail(&self, n: usize) -> &[T] {
        let start = self.data.len().saturating_sub(n);
        &self.data[start..]
    }

    /// Ordinal of the sample stamped exactly `ts`.
    pub fn position_of(&self, ts: Timestamp) -> Option<usize> {
        let idx = self.lower_bound(ts);
        match self.data.get(idx) {
            Some(s) if s.ts() == ts => Some(idx),
            _ => None,
        }
    }

    fn lower_bound(&self, ts: Timestamp) -> usize {
        let mut left = 0usize;
        let mut right = self.data.len();
        while left < right {
            let mid = (left + right) / 2;
            match self.data[mid].ts().cmp(&ts) {
                Ordering::Less => left = mid + 1,
                Ordering::Equal | Ordering::Greater => right = mid,
            }
        }
        left
    }
}

/// Ordinals of every sample in time-ordered `samples` that falls on `date` (UTC).
pub fn ordinals_on<T: HasTimestamp>(samples: &[T], date: NaiveDate) -> Range<usize> {
    let start = timestamp_of(date);
    let from = samples.partition_point(|s| s.ts() < start);
    let to = samples.partition_point(|s| s.ts() < start + DAY_MS).max(from);
    from..to
}
