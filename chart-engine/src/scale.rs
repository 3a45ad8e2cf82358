use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ta_engine::{AugmentedRecord, SourceField};
use thiserror::Error;
use ts_core::{HasTimestamp, Timestamp};

use crate::PanelId;

/// Half-height added around a flat price extent.
const FLAT_EXTENT_PAD: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScaleError {
    #[error("scale requested over an empty domain")]
    EmptyDomain,
    #[error("pixel range is empty or not finite: {0}")]
    InvalidGeometry(f64),
}

/// Inclusive range of record ordinals currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleRange {
    start: usize,
    end: usize,
}

impl VisibleRange {
    /// Range over `len` records, clamped into `0..len`. Reversed bounds are swapped.
    pub fn new(start: usize, end: usize, len: usize) -> Result<Self, ScaleError> {
        if len == 0 {
            return Err(ScaleError::EmptyDomain);
        }
        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
        let last = len - 1;
        Ok(Self {
            start: lo.min(last),
            end: hi.min(last),
        })
    }

    /// The most recent `n` records (at least one).
    pub fn last_n(len: usize, n: usize) -> Result<Self, ScaleError> {
        if len == 0 {
            return Err(ScaleError::EmptyDomain);
        }
        let n = n.clamp(1, len);
        Self::new(len - n, len - 1, len)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, ordinal: usize) -> bool {
        (self.start..=self.end).contains(&ordinal)
    }

    /// Pan by whole bars (negative = back in time), keeping the width and
    /// staying inside `0..len`.
    pub fn shifted(&self, bars: isize, len: usize) -> Self {
        if len == 0 {
            return *self;
        }
        let width = self.len().min(len);
        let max_start = len - width;
        let start = (self.start as isize)
            .saturating_add(bars)
            .clamp(0, max_start as isize) as usize;
        Self {
            start,
            end: start + width - 1,
        }
    }
}

/// Discontinuous time axis: x is driven by record ordinal, so gaps such as
/// weekends take no width. Every visible ordinal owns an equal band and maps
/// to the band centre.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeScale {
    dates: Vec<Timestamp>,
    visible: VisibleRange,
    width: f64,
    band: f64,
}

impl TimeScale {
    pub fn build<T: HasTimestamp>(
        records: &[T],
        visible: VisibleRange,
        width: f64,
    ) -> Result<Self, ScaleError> {
        if records.is_empty() {
            return Err(ScaleError::EmptyDomain);
        }
        if !width.is_finite() || width <= 0.0 {
            return Err(ScaleError::InvalidGeometry(width));
        }
        let visible = VisibleRange::new(visible.start, visible.end, records.len())?;
        let band = width / visible.len() as f64;
        Ok(Self {
            dates: records.iter().map(|r| r.ts()).collect(),
            visible,
            width,
            band,
        })
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn visible(&self) -> VisibleRange {
        self.visible
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn band_width(&self) -> f64 {
        self.band
    }

    /// Pixel x of an ordinal. Off-screen ordinals land outside `0..width`.
    pub fn x_of(&self, ordinal: usize) -> f64 {
        self.position_to_x(ordinal as f64)
    }

    /// Continuous inverse of [`TimeScale::x_of`].
    pub fn position_at(&self, x: f64) -> f64 {
        x / self.band - 0.5 + self.visible.start as f64
    }

    /// Nearest record ordinal to pixel `x`; ties go to the earlier record.
    pub fn ordinal_at(&self, x: f64) -> usize {
        let pos = self.position_at(x);
        let nearest = (pos - 0.5).ceil();
        let last = (self.dates.len() - 1) as f64;
        nearest.clamp(0.0, last) as usize
    }

    pub fn date_at(&self, ordinal: usize) -> Option<Timestamp> {
        self.dates.get(ordinal).copied()
    }

    pub fn ordinal_of(&self, date: Timestamp) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    pub fn x_of_date(&self, date: Timestamp) -> Option<f64> {
        self.ordinal_of(date).map(|o| self.x_of(o))
    }

    fn position_to_x(&self, pos: f64) -> f64 {
        (pos - self.visible.start as f64 + 0.5) * self.band
    }
}

/// Pixel layout of one panel. Prices map into
/// `[top + padding_top, top + height - padding_bottom]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PanelGeometry {
    pub top: f64,
    pub height: f64,
    #[serde(default)]
    pub padding_top: f64,
    #[serde(default)]
    pub padding_bottom: f64,
}

impl PanelGeometry {
    pub fn new(top: f64, height: f64) -> Self {
        Self {
            top,
            height,
            padding_top: 0.0,
            padding_bottom: 0.0,
        }
    }

    pub fn with_padding(mut self, top: f64, bottom: f64) -> Self {
        self.padding_top = top;
        self.padding_bottom = bottom;
        self
    }

    fn pixel_range(&self) -> Result<(f64, f64), ScaleError> {
        let y_top = self.top + self.padding_top;
        let y_bottom = self.top + self.height - self.padding_bottom;
        let span = y_bottom - y_top;
        if !span.is_finite() || span <= 0.0 {
            return Err(ScaleError::InvalidGeometry(span));
        }
        Ok((y_top, y_bottom))
    }
}

/// Linear price axis of one panel; higher prices sit higher on screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceScale {
    min: f64,
    max: f64,
    y_top: f64,
    y_bottom: f64,
}

impl PriceScale {
    /// Extent is min/max of every accessor over `records`, padded on both
    /// sides by `padding_ratio` of its span.
    pub fn build(
        records: &[AugmentedRecord],
        accessors: &[SourceField],
        geometry: PanelGeometry,
        padding_ratio: f64,
    ) -> Result<Self, ScaleError> {
        let (min, max) = records
            .iter()
            .flat_map(|r| accessors.iter().filter_map(move |a| a.value(r)))
            .fold(None, |acc: Option<(f64, f64)>, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
            .ok_or(ScaleError::EmptyDomain)?;

        let span = max - min;
        let pad = if span > 0.0 {
            span * padding_ratio.max(0.0)
        } else {
            FLAT_EXTENT_PAD
        };
        Self::from_extent(min - pad, max + pad, geometry)
    }

    pub fn from_extent(min: f64, max: f64, geometry: PanelGeometry) -> Result<Self, ScaleError> {
        if !(min.is_finite() && max.is_finite()) || max <= min {
            return Err(ScaleError::EmptyDomain);
        }
        let (y_top, y_bottom) = geometry.pixel_range()?;
        Ok(Self {
            min,
            max,
            y_top,
            y_bottom,
        })
    }

    pub fn extent(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    pub fn y_of(&self, price: f64) -> f64 {
        let norm = (price - self.min) / (self.max - self.min);
        self.y_bottom - norm * (self.y_bottom - self.y_top)
    }

    /// Linear inverse of [`PriceScale::y_of`], not clamped to the extent.
    pub fn price_at(&self, y: f64) -> f64 {
        let rel = (self.y_bottom - y) / (self.y_bottom - self.y_top);
        self.min + rel * (self.max - self.min)
    }
}

/// Shared time scale plus one price scale per panel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartScales {
    pub time: TimeScale,
    prices: BTreeMap<PanelId, PriceScale>,
}

impl ChartScales {
    pub fn new(time: TimeScale) -> Self {
        Self {
            time,
            prices: BTreeMap::new(),
        }
    }

    pub fn with_price(mut self, panel: PanelId, scale: PriceScale) -> Self {
        self.prices.insert(panel, scale);
        self
    }

    pub fn insert_price(&mut self, panel: PanelId, scale: PriceScale) {
        self.prices.insert(panel, scale);
    }

    pub fn price(&self, panel: PanelId) -> Option<&PriceScale> {
        self.prices.get(&panel)
    }
}
