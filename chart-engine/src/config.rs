use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use ta_engine::{IndicatorDef, IndicatorKind, IndicatorPipeline, SourceField};
use thiserror::Error;

use crate::annotation::TextStyle;
use crate::scale::PanelGeometry;
use crate::PanelId;

const DEFAULT_VISIBLE_BARS: usize = 150;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("indicator config: {0}")]
    Indicator(#[from] ta_engine::ConfigError),
    #[error("panel {0} is configured twice")]
    DuplicatePanel(PanelId),
    #[error("mark panel {0} is not configured")]
    UnknownMarkPanel(PanelId),
    #[error("chart needs at least one panel")]
    NoPanels,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margin {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

impl Default for Margin {
    fn default() -> Self {
        Self {
            left: 70.0,
            right: 70.0,
            top: 10.0,
            bottom: 30.0,
        }
    }
}

/// One panel: where it sits inside the plot area, which fields drive its
/// price extent, and whether pointer placement is allowed on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelConfig {
    pub id: PanelId,
    #[serde(flatten)]
    pub geometry: PanelGeometry,
    pub extents: Vec<SourceField>,
    #[serde(default = "default_drawable")]
    pub drawable: bool,
}

fn default_drawable() -> bool {
    true
}

impl PanelConfig {
    pub fn new(id: PanelId, geometry: PanelGeometry, extents: Vec<SourceField>) -> Self {
        Self {
            id,
            geometry,
            extents,
            drawable: true,
        }
    }

    pub fn not_drawable(mut self) -> Self {
        self.drawable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    pub width: f64,
    pub height: f64,
    pub margin: Margin,
    pub visible_bars: usize,
    /// Fraction of the extent span added above and below each price scale.
    pub price_padding: f64,
    /// Pixel gap between a dated mark and its bar.
    pub mark_offset_px: f64,
    /// Panel receiving support/resistance levels and dated marks.
    pub mark_panel: PanelId,
    pub text_style: TextStyle,
    pub indicators: Vec<IndicatorDef>,
    pub panels: Vec<PanelConfig>,
}

impl Default for ChartConfig {
    fn default() -> Self {
        let margin = Margin::default();
        let height = 600.0;
        let plot_height = height - margin.top - margin.bottom;
        let volume_height = 100.0;
        Self {
            width: 900.0,
            height,
            margin,
            visible_bars: DEFAULT_VISIBLE_BARS,
            price_padding: 0.02,
            mark_offset_px: 10.0,
            mark_panel: PanelId::PRICE,
            text_style: TextStyle::default(),
            indicators: vec![
                IndicatorDef::new("smaVolume50", IndicatorKind::Sma, 20, "volume"),
                IndicatorDef::new("ema200", IndicatorKind::Ema, 200, "close"),
                IndicatorDef::new("ema50", IndicatorKind::Ema, 50, "close"),
            ],
            panels: vec![
                PanelConfig::new(
                    PanelId::PRICE,
                    PanelGeometry::new(0.0, plot_height).with_padding(10.0, volume_height),
                    vec![
                        SourceField::High,
                        SourceField::Low,
                        SourceField::indicator("ema50"),
                        SourceField::indicator("ema200"),
                    ],
                ),
                PanelConfig::new(
                    PanelId::VOLUME,
                    PanelGeometry::new(plot_height - volume_height, volume_height),
                    vec![SourceField::Volume, SourceField::indicator("smaVolume50")],
                )
                .not_drawable(),
            ],
        }
    }
}

impl ChartConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ChartConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn with_width(mut self, width: f64) -> Self {
        self.width = width;
        self
    }

    pub fn with_visible_bars(mut self, bars: usize) -> Self {
        self.visible_bars = bars.max(1);
        self
    }

    pub fn with_indicators(mut self, indicators: Vec<IndicatorDef>) -> Self {
        self.indicators = indicators;
        self
    }

    pub fn with_panels(mut self, panels: Vec<PanelConfig>) -> Self {
        self.panels = panels;
        self
    }

    /// Width available to bars once side margins are taken.
    pub fn plot_width(&self) -> f64 {
        self.width - self.margin.left - self.margin.right
    }

    pub fn plot_height(&self) -> f64 {
        self.height - self.margin.top - self.margin.bottom
    }

    pub fn panel(&self, id: PanelId) -> Option<&PanelConfig> {
        self.panels.iter().find(|p| p.id == id)
    }

    pub fn pipeline(&self) -> Result<IndicatorPipeline, ConfigError> {
        Ok(IndicatorPipeline::from_defs(self.indicators.iter().cloned())?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.panels.is_empty() {
            return Err(ConfigError::NoPanels);
        }
        let mut seen = HashSet::new();
        for p in &self.panels {
            if !seen.insert(p.id) {
                return Err(ConfigError::DuplicatePanel(p.id));
            }
        }
        if !seen.contains(&self.mark_panel) {
            return Err(ConfigError::UnknownMarkPanel(self.mark_panel));
        }
        self.pipeline()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_two_panel_layout() {
        let config = ChartConfig::default();
        config.validate().unwrap();
        assert_eq!(config.plot_height(), 560.0);
        assert_eq!(config.plot_width(), 760.0);
        let volume = config.panel(PanelId::VOLUME).unwrap();
        assert!(!volume.drawable);
        assert_eq!(volume.geometry.top, 460.0);
        let legend = config.pipeline().unwrap().legend();
        assert_eq!(legend.len(), 3);
        assert_eq!(legend[0].window, 20);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = ChartConfig::from_json_str(
            r#"{
                "width": 1200,
                "visible_bars": 60,
                "indicators": [{"key": "ema10", "kind": "ema", "window": 10}],
                "panels": [{
                    "id": 1, "top": 0, "height": 400, "padding_top": 5,
                    "extents": ["high", "low", {"indicator": "ema10"}]
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.width, 1200.0);
        assert_eq!(config.visible_bars, 60);
        assert_eq!(config.margin, Margin::default());
        let panel = config.panel(PanelId::PRICE).unwrap();
        assert!(panel.drawable);
        assert_eq!(panel.geometry.padding_top, 5.0);
        assert_eq!(panel.extents[2], SourceField::indicator("ema10"));
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chart.json");
        fs::write(&path, r#"{"width": 1000, "mark_offset_px": 14}"#).unwrap();
        let config = ChartConfig::from_json_file(&path).unwrap();
        assert_eq!(config.width, 1000.0);
        assert_eq!(config.mark_offset_px, 14.0);
        assert_eq!(config.panels, ChartConfig::default().panels);

        fs::write(&path, r#"{"panels": []}"#).unwrap();
        assert!(matches!(
            ChartConfig::from_json_file(&path),
            Err(ConfigError::NoPanels)
        ));
        assert!(matches!(
            ChartConfig::from_json_file(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let err = ChartConfig::from_json_str(
            r#"{"indicators": [{"key": "bad", "kind": "sma", "window": 0}]}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Indicator(ta_engine::ConfigError::InvalidWindow(0))
        ));

        let twice = ChartConfig::default().with_panels(vec![
            PanelConfig::new(PanelId::PRICE, PanelGeometry::new(0.0, 10.0), vec![]),
            PanelConfig::new(PanelId::PRICE, PanelGeometry::new(0.0, 10.0), vec![]),
        ]);
        assert!(matches!(
            twice.validate(),
            Err(ConfigError::DuplicatePanel(PanelId::PRICE))
        ));

        let no_mark_panel = ChartConfig::default().with_panels(vec![PanelConfig::new(
            PanelId::VOLUME,
            PanelGeometry::new(0.0, 10.0),
            vec![SourceField::Volume],
        )]);
        assert!(matches!(
            no_mark_panel.validate(),
            Err(ConfigError::UnknownMarkPanel(PanelId::PRICE))
        ));

        assert!(matches!(
            ChartConfig::from_json_str("{\"width\": \"wide\"}"),
            Err(ConfigError::Json(_))
        ));
    }
}
