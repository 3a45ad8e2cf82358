use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use data_feed::{DateMark, MarkDirection, Marks};
use serde::{Deserialize, Serialize};
use ta_engine::AugmentedRecord;
use thiserror::Error;
use tracing::{debug, warn};
use ts_core::{ordinals_on, Timestamp};

use crate::scale::{ChartScales, PriceScale, TimeScale};
use crate::PanelId;

pub type AnnotationId = u64;

/// Hint shown by adapters while hovering a movable annotation.
pub const HOVER_TEXT: &str = "Click here to move it";

const MARK_OVER_GLYPH: &str = "▼";
const MARK_UNDER_GLYPH: &str = "▲";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextStyle {
    pub font_size: f64,
    pub font_weight: String,
    pub text_fill: String,
    pub bg_fill: String,
    pub bg_stroke_width: f64,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_size: 15.0,
            font_weight: "bold".to_string(),
            text_fill: "#000000".to_string(),
            bg_fill: "rgba(0,0,0,0)".to_string(),
            bg_stroke_width: 0.0,
        }
    }
}

/// Data-space position. Levels carry only a price and span the panel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anchor {
    Point { date: Timestamp, price: f64 },
    Level { price: f64 },
}

impl Anchor {
    pub fn price(&self) -> f64 {
        match *self {
            Anchor::Point { price, .. } | Anchor::Level { price } => price,
        }
    }

    pub fn date(&self) -> Option<Timestamp> {
        match *self {
            Anchor::Point { date, .. } => Some(date),
            Anchor::Level { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Text,
    PriceLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    pub panel: PanelId,
    pub kind: AnnotationKind,
    pub anchor: Anchor,
    pub style: TextStyle,
    pub text: String,
    pub selected: bool,
    /// Screen-space nudge applied after mapping the anchor (negative = up).
    #[serde(default)]
    pub offset_px: f64,
}

impl Annotation {
    /// Pixel x of a point anchor; `None` for levels or dates off the scale.
    pub fn x(&self, time: &TimeScale) -> Option<f64> {
        self.anchor.date().and_then(|d| time.x_of_date(d))
    }

    pub fn y(&self, price: &PriceScale) -> f64 {
        price.y_of(self.anchor.price()) + self.offset_px
    }
}

/// Result of a placement that may legitimately do nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Placed(AnnotationId),
    NotPlaced,
}

impl Placement {
    pub fn id(&self) -> Option<AnnotationId> {
        match *self {
            Placement::Placed(id) => Some(id),
            Placement::NotPlaced => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotationError {
    #[error("annotation {0} not found")]
    NotFound(AnnotationId),
    #[error("no price scale for panel {0}")]
    UnknownPanel(PanelId),
    #[error("drag result for panel {panel} has {got} annotations, expected {expected}")]
    LengthChanged {
        panel: PanelId,
        expected: usize,
        got: usize,
    },
    #[error("drag result for panel {0} does not keep the same annotation ids")]
    IdsChanged(PanelId),
    #[error("date {date} matches {count} records")]
    AmbiguousDate { date: NaiveDate, count: usize },
}

/// Per-panel annotation lists. List order is draw order.
#[derive(Debug, Clone)]
pub struct AnnotationModel {
    panels: BTreeMap<PanelId, Vec<Annotation>>,
    next_id: AnnotationId,
    default_style: TextStyle,
    mark_offset_px: f64,
}

impl Default for AnnotationModel {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnotationModel {
    pub fn new() -> Self {
        Self {
            panels: BTreeMap::new(),
            next_id: 1,
            default_style: TextStyle::default(),
            mark_offset_px: 10.0,
        }
    }

    pub fn with_default_style(mut self, style: TextStyle) -> Self {
        self.default_style = style;
        self
    }

    pub fn with_mark_offset(mut self, px: f64) -> Self {
        self.mark_offset_px = px;
        self
    }

    pub fn annotations(&self, panel: PanelId) -> &[Annotation] {
        self.panels.get(&panel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.panels.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.panels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: AnnotationId) -> Option<&Annotation> {
        self.iter().find(|a| a.id == id)
    }

    fn get_mut(&mut self, id: AnnotationId) -> Option<&mut Annotation> {
        self.panels.values_mut().flatten().find(|a| a.id == id)
    }

    fn push(
        &mut self,
        panel: PanelId,
        kind: AnnotationKind,
        anchor: Anchor,
        text: String,
        style: TextStyle,
        offset_px: f64,
    ) -> AnnotationId {
        let id = self.next_id;
        self.next_id += 1;
        self.panels.entry(panel).or_default().push(Annotation {
            id,
            panel,
            kind,
            anchor,
            style,
            text,
            selected: false,
            offset_px,
        });
        id
    }

    /// Invert a pointer position through `scales` and append an empty text
    /// annotation there. x snaps to the nearest record.
    pub fn place_from_pointer(
        &mut self,
        panel: PanelId,
        x: f64,
        y: f64,
        scales: &ChartScales,
    ) -> Result<AnnotationId, AnnotationError> {
        let price_scale = scales
            .price(panel)
            .ok_or(AnnotationError::UnknownPanel(panel))?;
        let ordinal = scales.time.ordinal_at(x);
        let date = scales
            .time
            .date_at(ordinal)
            .ok_or(AnnotationError::UnknownPanel(panel))?;
        let price = price_scale.price_at(y);
        let id = self.place_text(panel, date, price, String::new());
        debug!(id, panel = %panel, ordinal, price, "annotation placed from pointer");
        Ok(id)
    }

    pub fn place_text(
        &mut self,
        panel: PanelId,
        date: Timestamp,
        price: f64,
        text: String,
    ) -> AnnotationId {
        let style = self.default_style.clone();
        self.push(
            panel,
            AnnotationKind::Text,
            Anchor::Point { date, price },
            text,
            style,
            0.0,
        )
    }

    pub fn place_level(&mut self, panel: PanelId, label: &str, price: f64) -> AnnotationId {
        let style = self.default_style.clone();
        self.push(
            panel,
            AnnotationKind::PriceLevel,
            Anchor::Level { price },
            label.to_string(),
            style,
            0.0,
        )
    }

    /// One level annotation per R1/R2/S1/S2 value present.
    pub fn place_levels(&mut self, panel: PanelId, marks: &Marks) -> Vec<AnnotationId> {
        marks
            .levels()
            .into_iter()
            .map(|(label, price)| self.place_level(panel, label, price))
            .collect()
    }

    /// Anchor a dated mark on the record whose calendar date matches.
    /// Unparseable or unmatched dates are not placed.
    pub fn place_at_date(
        &mut self,
        panel: PanelId,
        mark: &DateMark,
        records: &[AugmentedRecord],
    ) -> Result<Placement, AnnotationError> {
        let resolved = self.resolve_mark(mark, records)?;
        Ok(self.push_mark(panel, mark, resolved))
    }

    /// Place every dated mark, or none if any date is ambiguous.
    pub fn place_date_marks(
        &mut self,
        panel: PanelId,
        marks: &[DateMark],
        records: &[AugmentedRecord],
    ) -> Result<Vec<Placement>, AnnotationError> {
        let resolved = marks
            .iter()
            .map(|m| self.resolve_mark(m, records))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(marks
            .iter()
            .zip(resolved)
            .map(|(m, r)| self.push_mark(panel, m, r))
            .collect())
    }

    fn resolve_mark(
        &self,
        mark: &DateMark,
        records: &[AugmentedRecord],
    ) -> Result<Option<Anchor>, AnnotationError> {
        let Some(day) = mark.parsed_date() else {
            debug!(date = %mark.date, "mark date does not parse; not placed");
            return Ok(None);
        };
        match &records[ordinals_on(records, day)] {
            [] => {
                debug!(date = %mark.date, "no record on mark date; not placed");
                Ok(None)
            }
            [r] => {
                let price = match mark.direction {
                    MarkDirection::Over => r.record.high,
                    MarkDirection::Under => r.record.low,
                };
                Ok(Some(Anchor::Point {
                    date: r.record.date,
                    price,
                }))
            }
            many => Err(AnnotationError::AmbiguousDate {
                date: day,
                count: many.len(),
            }),
        }
    }

    fn push_mark(&mut self, panel: PanelId, mark: &DateMark, anchor: Option<Anchor>) -> Placement {
        let Some(anchor) = anchor else {
            return Placement::NotPlaced;
        };
        let (glyph, offset) = match mark.direction {
            MarkDirection::Over => (MARK_OVER_GLYPH, -self.mark_offset_px),
            MarkDirection::Under => (MARK_UNDER_GLYPH, self.mark_offset_px),
        };
        let style = TextStyle {
            text_fill: mark.color.clone(),
            ..self.default_style.clone()
        };
        Placement::Placed(self.push(
            panel,
            AnnotationKind::Text,
            anchor,
            glyph.to_string(),
            style,
            offset,
        ))
    }

    pub fn update_text(&mut self, id: AnnotationId, text: &str) -> Result<(), AnnotationError> {
        let annotation = self.get_mut(id).ok_or(AnnotationError::NotFound(id))?;
        annotation.text = text.to_string();
        Ok(())
    }

    /// Remove the panel's selected annotations; returns how many went.
    pub fn delete_selected(&mut self, panel: PanelId) -> usize {
        let Some(list) = self.panels.get_mut(&panel) else {
            return 0;
        };
        let before = list.len();
        list.retain(|a| !a.selected);
        before - list.len()
    }

    pub fn delete_selected_everywhere(&mut self) -> usize {
        let panels: Vec<PanelId> = self.panels.keys().copied().collect();
        panels.into_iter().map(|p| self.delete_selected(p)).sum()
    }

    /// Select exactly `ids` within `panel`; returns the number now selected.
    pub fn set_selection(&mut self, panel: PanelId, ids: &[AnnotationId]) -> usize {
        let wanted: HashSet<AnnotationId> = ids.iter().copied().collect();
        self.select_where(panel, |a| wanted.contains(&a.id))
    }

    pub fn select_where<F>(&mut self, panel: PanelId, predicate: F) -> usize
    where
        F: Fn(&Annotation) -> bool,
    {
        let Some(list) = self.panels.get_mut(&panel) else {
            return 0;
        };
        let mut selected = 0;
        for a in list.iter_mut() {
            a.selected = predicate(a);
            if a.selected {
                selected += 1;
            }
        }
        selected
    }

    /// Commit the result of an external drag: the whole panel list is
    /// replaced, provided it holds the same ids.
    pub fn on_drag_complete(
        &mut self,
        panel: PanelId,
        mut updated: Vec<Annotation>,
    ) -> Result<(), AnnotationError> {
        let current = self.annotations(panel);
        if updated.len() != current.len() {
            warn!(panel = %panel, expected = current.len(), got = updated.len(), "drag result rejected");
            return Err(AnnotationError::LengthChanged {
                panel,
                expected: current.len(),
                got: updated.len(),
            });
        }
        let before: HashSet<AnnotationId> = current.iter().map(|a| a.id).collect();
        let after: HashSet<AnnotationId> = updated.iter().map(|a| a.id).collect();
        if before != after || after.len() != updated.len() {
            warn!(panel = %panel, "drag result rejected: ids changed");
            return Err(AnnotationError::IdsChanged(panel));
        }
        for a in &mut updated {
            a.panel = panel;
        }
        if !updated.is_empty() {
            self.panels.insert(panel, updated);
        }
        Ok(())
    }
}
