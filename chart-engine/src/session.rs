use data_feed::{load_series, DataSource, Marks};
use serde::Serialize;
use ta_engine::{AugmentedRecord, IndicatorPipeline, LegendEntry};
use tracing::{debug, warn};
use ts_core::{Ohlcv, TimeSeries};

use crate::annotation::{Annotation, AnnotationId, AnnotationModel, Placement};
use crate::config::ChartConfig;
use crate::scale::{ChartScales, PriceScale, ScaleError, TimeScale, VisibleRange};
use crate::{ChartError, PanelId};

pub const KEY_DELETE: u32 = 46;
pub const KEY_ESCAPE: u32 = 27;
pub const KEY_D: u32 = 68;
pub const KEY_E: u32 = 69;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    DeleteSelected,
    CancelDrawing,
    EnableDrawing,
}

impl KeyCommand {
    pub fn from_key_code(code: u32) -> Option<Self> {
        match code {
            KEY_DELETE => Some(KeyCommand::DeleteSelected),
            KEY_ESCAPE => Some(KeyCommand::CancelDrawing),
            KEY_D | KEY_E => Some(KeyCommand::EnableDrawing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Deleted(usize),
    DrawModeChanged(bool),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerOutcome {
    Placed(AnnotationId),
    Ignored,
}

/// A freshly placed annotation waiting for its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEdit {
    pub id: AnnotationId,
    pub panel: PanelId,
}

/// What came of applying a feed's marks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarksReport {
    pub levels: Vec<AnnotationId>,
    pub placed: Vec<AnnotationId>,
    /// Raw date strings of marks that matched no record.
    pub not_placed: Vec<String>,
}

/// One chart's state: the record store, indicator output, scales for the
/// visible window, and the annotation model. Adapters drive it through the
/// `handle_*` methods and read it back for drawing.
#[derive(Debug, Clone)]
pub struct ChartSession {
    config: ChartConfig,
    pipeline: IndicatorPipeline,
    store: TimeSeries<Ohlcv>,
    records: Vec<AugmentedRecord>,
    visible: VisibleRange,
    scales: ChartScales,
    annotations: AnnotationModel,
    draw_mode: bool,
    pending_edit: Option<PendingEdit>,
}

impl ChartSession {
    pub fn new(store: TimeSeries<Ohlcv>, config: ChartConfig) -> Result<Self, ChartError> {
        config.validate()?;
        let pipeline = config.pipeline()?;
        let records = pipeline.run(store.as_slice());
        let visible = VisibleRange::last_n(records.len(), config.visible_bars)?;
        let scales = build_scales(&config, &records, visible)?;
        let annotations = AnnotationModel::new()
            .with_default_style(config.text_style.clone())
            .with_mark_offset(config.mark_offset_px);
        debug!(
            records = records.len(),
            indicators = pipeline.passes().len(),
            visible_start = visible.start(),
            visible_end = visible.end(),
            "chart session created"
        );
        Ok(Self {
            config,
            pipeline,
            store,
            records,
            visible,
            scales,
            annotations,
            draw_mode: true,
            pending_edit: None,
        })
    }

    /// Load records and marks from `source` and place the marks.
    pub fn from_source(
        source: &dyn DataSource,
        config: ChartConfig,
    ) -> Result<(Self, MarksReport), ChartError> {
        let store = load_series(source)?;
        let marks = source.marks()?;
        let mut session = Self::new(store, config)?;
        let report = session.apply_marks(&marks)?;
        Ok((session, report))
    }

    pub fn config(&self) -> &ChartConfig {
        &self.config
    }

    pub fn records(&self) -> &[AugmentedRecord] {
        &self.records
    }

    pub fn visible(&self) -> VisibleRange {
        self.visible
    }

    pub fn visible_records(&self) -> &[AugmentedRecord] {
        &self.records[self.visible.start()..=self.visible.end()]
    }

    pub fn scales(&self) -> &ChartScales {
        &self.scales
    }

    pub fn annotations(&self) -> &AnnotationModel {
        &self.annotations
    }

    pub fn legend(&self) -> Vec<LegendEntry> {
        self.pipeline.legend()
    }

    pub fn draw_mode(&self) -> bool {
        self.draw_mode
    }

    pub fn pending_edit(&self) -> Option<&PendingEdit> {
        self.pending_edit.as_ref()
    }

    /// Append new bars, recompute every indicator, and keep the window
    /// pinned to the newest bar if it was showing it. A rejected batch, or
    /// one that leaves a panel with nothing to scale, leaves the session
    /// untouched.
    pub fn append_records<I>(&mut self, bars: I) -> Result<(), ChartError>
    where
        I: IntoIterator<Item = Ohlcv>,
    {
        let old_len = self.records.len();
        let following = self.visible.end() + 1 == old_len;
        let mut store = self.store.clone();
        store.append_batch(bars)?;
        if store.len() == old_len {
            return Ok(());
        }
        let records = self.pipeline.run(store.as_slice());
        let len = records.len();
        let visible = if following {
            self.visible.shifted((len - old_len) as isize, len)
        } else {
            VisibleRange::new(self.visible.start(), self.visible.end(), len)?
        };
        self.scales = build_scales(&self.config, &records, visible)?;
        self.store = store;
        self.records = records;
        self.visible = visible;
        Ok(())
    }

    pub fn set_visible_range(&mut self, start: usize, end: usize) -> Result<(), ChartError> {
        let visible = VisibleRange::new(start, end, self.records.len())?;
        self.show(visible)
    }

    /// Pan by whole bars; negative values move back in time.
    pub fn pan(&mut self, bars: isize) -> Result<(), ChartError> {
        let visible = self.visible.shifted(bars, self.records.len());
        self.show(visible)
    }

    pub fn handle_key_command(&mut self, code: u32) -> CommandOutcome {
        if self.pending_edit.is_some() {
            return CommandOutcome::Ignored;
        }
        match KeyCommand::from_key_code(code) {
            Some(KeyCommand::DeleteSelected) => {
                let removed = self.annotations.delete_selected_everywhere();
                debug!(removed, "selected annotations deleted");
                CommandOutcome::Deleted(removed)
            }
            Some(KeyCommand::CancelDrawing) => self.set_draw_mode(false),
            Some(KeyCommand::EnableDrawing) => self.set_draw_mode(true),
            None => CommandOutcome::Ignored,
        }
    }

    /// Place an empty text annotation under the pointer and open an edit
    /// for it. Ignored outside draw mode, during an edit, and on panels
    /// that are not drawable.
    pub fn handle_pointer_down(
        &mut self,
        panel: PanelId,
        x: f64,
        y: f64,
    ) -> Result<PointerOutcome, ChartError> {
        if !self.draw_mode || self.pending_edit.is_some() {
            return Ok(PointerOutcome::Ignored);
        }
        match self.config.panel(panel) {
            Some(p) if p.drawable => {}
            _ => return Ok(PointerOutcome::Ignored),
        }
        let id = self
            .annotations
            .place_from_pointer(panel, x, y, &self.scales)?;
        self.pending_edit = Some(PendingEdit { id, panel });
        Ok(PointerOutcome::Placed(id))
    }

    /// Write `text` into the pending annotation and leave draw mode.
    pub fn commit_text(&mut self, text: &str) -> Result<AnnotationId, ChartError> {
        let edit = self.pending_edit.take().ok_or(ChartError::NoPendingEdit)?;
        self.annotations.update_text(edit.id, text)?;
        self.draw_mode = false;
        Ok(edit.id)
    }

    /// Close the edit; the placed annotation stays with empty text.
    pub fn cancel_edit(&mut self) -> Result<AnnotationId, ChartError> {
        let edit = self.pending_edit.take().ok_or(ChartError::NoPendingEdit)?;
        Ok(edit.id)
    }

    /// Commit a selection made by the adapter. Only honoured outside draw
    /// mode; returns the number selected, `None` when ignored.
    pub fn handle_selection(&mut self, panel: PanelId, ids: &[AnnotationId]) -> Option<usize> {
        if self.draw_mode || self.pending_edit.is_some() {
            return None;
        }
        Some(self.annotations.set_selection(panel, ids))
    }

    pub fn handle_drag_complete(
        &mut self,
        panel: PanelId,
        updated: Vec<Annotation>,
    ) -> Result<(), ChartError> {
        self.annotations.on_drag_complete(panel, updated)?;
        self.draw_mode = false;
        Ok(())
    }

    /// Place dated marks first, then levels, on the configured mark panel.
    /// An ambiguous date aborts before anything is placed.
    pub fn apply_marks(&mut self, marks: &Marks) -> Result<MarksReport, ChartError> {
        let panel = self.config.mark_panel;
        let placements = self
            .annotations
            .place_date_marks(panel, &marks.marks, &self.records)?;
        let mut report = MarksReport {
            levels: self.annotations.place_levels(panel, marks),
            ..MarksReport::default()
        };
        for (mark, placement) in marks.marks.iter().zip(placements) {
            match placement {
                Placement::Placed(id) => report.placed.push(id),
                Placement::NotPlaced => report.not_placed.push(mark.date.clone()),
            }
        }
        if !report.not_placed.is_empty() {
            warn!(dates = ?report.not_placed, "some marks were not placed");
        }
        Ok(report)
    }

    fn set_draw_mode(&mut self, on: bool) -> CommandOutcome {
        self.draw_mode = on;
        CommandOutcome::DrawModeChanged(on)
    }

    /// Switch to `visible`; on a scale error the current window is kept.
    fn show(&mut self, visible: VisibleRange) -> Result<(), ChartError> {
        self.scales = build_scales(&self.config, &self.records, visible)?;
        self.visible = visible;
        Ok(())
    }
}

fn build_scales(
    config: &ChartConfig,
    records: &[AugmentedRecord],
    visible: VisibleRange,
) -> Result<ChartScales, ScaleError> {
    let time = TimeScale::build(records, visible, config.plot_width())?;
    let window = &records[visible.start()..=visible.end()];
    let mut scales = ChartScales::new(time);
    for panel in &config.panels {
        let scale = PriceScale::build(window, &panel.extents, panel.geometry, config.price_padding)
            .map_err(|e| {
                warn!(panel = %panel.id, error = %e, "panel cannot be scaled over the visible window");
                e
            })?;
        scales.insert_price(panel.id, scale);
    }
    Ok(scales)
}
