//! Chart-side engine behind a candlestick view: time/price scales, the
//! per-panel annotation model, and a command-driven session that a UI layer
//! feeds pointer, key and edit events into.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod annotation;
pub mod config;
pub mod scale;
pub mod session;

pub use annotation::{
    Anchor, Annotation, AnnotationError, AnnotationId, AnnotationKind, AnnotationModel, Placement,
    TextStyle, HOVER_TEXT,
};
pub use config::{ChartConfig, ConfigError, Margin, PanelConfig};
pub use scale::{ChartScales, PanelGeometry, PriceScale, ScaleError, TimeScale, VisibleRange};
pub use session::{
    ChartSession, CommandOutcome, KeyCommand, MarksReport, PendingEdit, PointerOutcome, KEY_D,
    KEY_DELETE, KEY_E, KEY_ESCAPE,
};

/// Identifies one chart panel (price pane, volume pane, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PanelId(pub u32);

impl PanelId {
    pub const PRICE: PanelId = PanelId(1);
    pub const VOLUME: PanelId = PanelId(2);
}

impl fmt::Display for PanelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("indicator config: {0}")]
    Indicator(#[from] ta_engine::ConfigError),
    #[error("chart config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
    #[error(transparent)]
    Annotation(#[from] AnnotationError),
    #[error("series error: {0}")]
    Series(#[from] ts_core::SeriesError),
    #[error("data feed: {0}")]
    Feed(#[from] data_feed::FeedError),
    #[error("no text edit is open")]
    NoPendingEdit,
}
