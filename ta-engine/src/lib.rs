use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::{fmt, str::FromStr};
use thiserror::Error;
use tracing::{debug, warn};
use ts_core::{HasTimestamp, Ohlcv, Timestamp};

/// Rejected indicator configuration. Raised while building specs and
/// pipelines, never while computing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("window size must be positive, got {0}")]
    InvalidWindow(i64),
    #[error("unknown source field: {0:?}")]
    UnknownSourceField(String),
    #[error("unknown indicator kind: {0:?}")]
    UnknownKind(String),
    #[error("indicator key must not be empty")]
    EmptyKey,
    #[error("indicator key {0:?} is written by more than one pass")]
    DuplicateKey(String),
    #[error("indicator {0:?} sets both a price source and an indicator input")]
    ConflictingSource(String),
}

/// Which record field an indicator reads.
///
/// `Indicator` reads a value written by an earlier pass, which is how
/// passes are layered (e.g. an EMA of an SMA).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceField {
    Open,
    High,
    Low,
    Close,
    Volume,
    Indicator(String),
}

impl SourceField {
    pub fn indicator(key: impl Into<String>) -> Self {
        SourceField::Indicator(key.into())
    }

    /// Value of this field on `r`, `None` when missing or not finite.
    pub fn value(&self, r: &AugmentedRecord) -> Option<f64> {
        let v = match self {
            SourceField::Open => r.record.open,
            SourceField::High => r.record.high,
            SourceField::Low => r.record.low,
            SourceField::Close => r.record.close,
            SourceField::Volume => r.record.volume as f64,
            SourceField::Indicator(key) => r.get(key)?,
        };
        v.is_finite().then_some(v)
    }
}

impl fmt::Display for SourceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceField::Open => f.write_str("open"),
            SourceField::High => f.write_str("high"),
            SourceField::Low => f.write_str("low"),
            SourceField::Close => f.write_str("close"),
            SourceField::Volume => f.write_str("volume"),
            SourceField::Indicator(key) => f.write_str(key),
        }
    }
}

/// Parses the five record fields only; indicator inputs are named
/// explicitly with [`SourceField::indicator`].
impl FromStr for SourceField {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "open" => Ok(SourceField::Open),
            "high" => Ok(SourceField::High),
            "low" => Ok(SourceField::Low),
            "close" => Ok(SourceField::Close),
            "volume" => Ok(SourceField::Volume),
            _ => Err(ConfigError::UnknownSourceField(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Sma,
    Ema,
}

impl IndicatorKind {
    /// Short label shown in moving-average legends.
    pub fn label(&self) -> &'static str {
        match self {
            IndicatorKind::Sma => "SMA",
            IndicatorKind::Ema => "EMA",
        }
    }
}

impl FromStr for IndicatorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "sma" | "ma" | "simple_ma" => Ok(IndicatorKind::Sma),
            "ema" => Ok(IndicatorKind::Ema),
            _ => Err(ConfigError::UnknownKind(s.to_string())),
        }
    }
}

// ---------- records -----------------------------------------------------------

/// A source record plus every indicator value computed for it so far.
/// A key is absent when its value is undefined for this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentedRecord {
    #[serde(flatten)]
    pub record: Ohlcv,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub indicators: BTreeMap<String, f64>,
}

impl AugmentedRecord {
    pub fn new(record: Ohlcv) -> Self {
        Self {
            record,
            indicators: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.indicators.get(key).copied()
    }

    pub fn set(&mut self, key: &str, value: Option<f64>) {
        match value {
            Some(v) => {
                self.indicators.insert(key.to_string(), v);
            }
            None => {
                self.indicators.remove(key);
            }
        }
    }
}

impl HasTimestamp for AugmentedRecord {
    fn ts(&self) -> Timestamp {
        self.record.date
    }
}

pub fn augment(records: &[Ohlcv]) -> Vec<AugmentedRecord> {
    records.iter().copied().map(AugmentedRecord::new).collect()
}

// ---------- spec ---------------------------------------------------------------

/// How to compute a rolling average. Rendering concerns live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorSpec {
    window: usize,
    source: SourceField,
    skip_undefined: bool,
}

impl IndicatorSpec {
    /// `skip_undefined` defaults to true.
    pub fn new(window: i64, source: SourceField) -> Result<Self, ConfigError> {
        if window <= 0 {
            return Err(ConfigError::InvalidWindow(window));
        }
        let window = usize::try_from(window).map_err(|_| ConfigError::InvalidWindow(window))?;
        Ok(Self {
            window,
            source,
            skip_undefined: true,
        })
    }

    /// Like [`IndicatorSpec::new`] with the source given by name.
    pub fn parse(window: i64, source: &str) -> Result<Self, ConfigError> {
        Self::new(window, source.parse()?)
    }

    /// With `true`, records lacking an input are skipped and the window keeps
    /// filling from the defined inputs. With `false`, a missing input restarts
    /// the window.
    pub fn with_skip_undefined(mut self, skip: bool) -> Self {
        self.skip_undefined = skip;
        self
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn source(&self) -> &SourceField {
        &self.source
    }

    pub fn skip_undefined(&self) -> bool {
        self.skip_undefined
    }
}

// ---------- engines ------------------------------------------------------------

/// Rolling computation over defined input values. Engines never see a
/// missing input; [`drive`] handles those.
trait IndicatorEngine {
    fn reset(&mut self);
    fn next(&mut self, value: f64) -> Option<f64>;
}

struct SmaEngine {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl SmaEngine {
    fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::new(),
            sum: 0.0,
        }
    }
}

impl IndicatorEngine for SmaEngine {
    fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }

    fn next(&mut self, value: f64) -> Option<f64> {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        (self.window.len() == self.period).then(|| self.sum / self.period as f64)
    }
}

/// EMA seeded with the SMA of its first `period` inputs.
struct EmaEngine {
    period: usize,
    alpha: f64,
    seed_sum: f64,
    count: usize,
    ema: Option<f64>,
}

impl EmaEngine {
    fn new(period: usize) -> Self {
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            count: 0,
            ema: None,
        }
    }
}

impl IndicatorEngine for EmaEngine {
    fn reset(&mut self) {
        self.seed_sum = 0.0;
        self.count = 0;
        self.ema = None;
    }

    fn next(&mut self, value: f64) -> Option<f64> {
        let ema = match self.ema {
            Some(prev) => prev + self.alpha * (value - prev),
            None => {
                self.count += 1;
                self.seed_sum += value;
                if self.count < self.period {
                    return None;
                }
                self.seed_sum / self.period as f64
            }
        };
        self.ema = Some(ema);
        Some(ema)
    }
}

fn create_engine(kind: IndicatorKind, window: usize) -> Box<dyn IndicatorEngine> {
    match kind {
        IndicatorKind::Sma => Box::new(SmaEngine::new(window)),
        IndicatorKind::Ema => Box::new(EmaEngine::new(window)),
    }
}

fn drive(
    engine: &mut dyn IndicatorEngine,
    spec: &IndicatorSpec,
    records: &[AugmentedRecord],
) -> Vec<Option<f64>> {
    engine.reset();
    records
        .iter()
        .map(|r| match spec.source.value(r) {
            Some(v) => engine.next(v),
            None => {
                if !spec.skip_undefined {
                    engine.reset();
                }
                None
            }
        })
        .collect()
}

// ---------- indicators -----------------------------------------------------------

/// Legend row for a moving-average tooltip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegendEntry {
    pub key: String,
    pub label: String,
    pub window: usize,
}

/// One indicator pass: what to compute and the key it is merged under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indicator {
    key: String,
    kind: IndicatorKind,
    spec: IndicatorSpec,
}

impl Indicator {
    pub fn new(
        key: impl Into<String>,
        kind: IndicatorKind,
        spec: IndicatorSpec,
    ) -> Result<Self, ConfigError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ConfigError::EmptyKey);
        }
        Ok(Self { key, kind, spec })
    }

    pub fn sma(key: impl Into<String>, window: i64, source: SourceField) -> Result<Self, ConfigError> {
        Self::new(key, IndicatorKind::Sma, IndicatorSpec::new(window, source)?)
    }

    pub fn ema(key: impl Into<String>, window: i64, source: SourceField) -> Result<Self, ConfigError> {
        Self::new(key, IndicatorKind::Ema, IndicatorSpec::new(window, source)?)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> IndicatorKind {
        self.kind
    }

    pub fn spec(&self) -> &IndicatorSpec {
        &self.spec
    }

    /// Values parallel to `records`. Each call starts from fresh state.
    pub fn compute(&self, records: &[AugmentedRecord]) -> Vec<Option<f64>> {
        let mut engine = create_engine(self.kind, self.spec.window);
        drive(engine.as_mut(), &self.spec, records)
    }

    /// Compute and merge under this indicator's key.
    pub fn apply(&self, records: &mut [AugmentedRecord]) {
        let values = self.compute(records);
        for (r, v) in records.iter_mut().zip(values) {
            r.set(&self.key, v);
        }
    }

    pub fn legend(&self) -> LegendEntry {
        LegendEntry {
            key: self.key.clone(),
            label: self.kind.label().to_string(),
            window: self.spec.window,
        }
    }
}

/// Serialized form of an indicator pass.
///
/// `source` names a record field (default `close`); `of` names an indicator
/// key written by an earlier pass. Setting both is an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDef {
    pub key: String,
    pub kind: IndicatorKind,
    pub window: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub of: Option<String>,
    #[serde(default = "default_skip_undefined")]
    pub skip_undefined: bool,
}

fn default_skip_undefined() -> bool {
    true
}

impl IndicatorDef {
    pub fn new(key: impl Into<String>, kind: IndicatorKind, window: i64, source: &str) -> Self {
        Self {
            key: key.into(),
            kind,
            window,
            source: Some(source.to_string()),
            of: None,
            skip_undefined: true,
        }
    }
}

impl TryFrom<IndicatorDef> for Indicator {
    type Error = ConfigError;

    fn try_from(def: IndicatorDef) -> Result<Self, Self::Error> {
        let source = match (def.source.as_deref(), def.of) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingSource(def.key)),
            (Some(name), None) => name.parse()?,
            (None, Some(key)) => SourceField::Indicator(key),
            (None, None) => SourceField::Close,
        };
        let spec = IndicatorSpec::new(def.window, source)?.with_skip_undefined(def.skip_undefined);
        Indicator::new(def.key, def.kind, spec)
    }
}

// ---------- pipeline -------------------------------------------------------------

/// Ordered indicator passes; a pass may read keys written by earlier ones.
#[derive(Debug, Clone, Default)]
pub struct IndicatorPipeline {
    passes: Vec<Indicator>,
}

impl IndicatorPipeline {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn with_passes<I: IntoIterator<Item = Indicator>>(passes: I) -> Result<Self, ConfigError> {
        let mut pipeline = Self::new();
        for p in passes {
            pipeline.push(p)?;
        }
        Ok(pipeline)
    }

    pub fn from_defs<I: IntoIterator<Item = IndicatorDef>>(defs: I) -> Result<Self, ConfigError> {
        let passes = defs
            .into_iter()
            .map(Indicator::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_passes(passes)
    }

    pub fn push(&mut self, indicator: Indicator) -> Result<(), ConfigError> {
        if self.passes.iter().any(|p| p.key == indicator.key) {
            return Err(ConfigError::DuplicateKey(indicator.key));
        }
        if let SourceField::Indicator(input) = indicator.spec.source() {
            if !self.passes.iter().any(|p| &p.key == input) {
                warn!(
                    key = %indicator.key,
                    input = %input,
                    "indicator reads a key no earlier pass writes"
                );
            }
        }
        self.passes.push(indicator);
        Ok(())
    }

    pub fn passes(&self) -> &[Indicator] {
        &self.passes
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn run(&self, records: &[Ohlcv]) -> Vec<AugmentedRecord> {
        let mut out = augment(records);
        self.apply(&mut out);
        out
    }

    pub fn apply(&self, records: &mut [AugmentedRecord]) {
        for pass in &self.passes {
            pass.apply(records);
            debug!(
                key = %pass.key,
                kind = pass.kind.label(),
                window = pass.spec.window,
                records = records.len(),
                "indicator pass merged"
            );
        }
    }

    pub fn legend(&self) -> Vec<LegendEntry> {
        self.passes.iter().map(Indicator::legend).collect()
    }
}

fn normalized(input: &str) -> String {
    input.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_record(date: i64, close: f64) -> Ohlcv {
        Ohlcv {
            date,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: (close * 100.0) as u64,
        }
    }

    fn closes(values: &[f64]) -> Vec<AugmentedRecord> {
        let records: Vec<Ohlcv> = values
            .iter()
            .enumerate()
            .map(|(i, c)| mk_record(i as i64 + 1, *c))
            .collect();
        augment(&records)
    }

    fn assert_close(actual: &[Option<f64>], expected: &[Option<f64>]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            match (a, e) {
                (Some(a), Some(e)) => assert!((a - e).abs() < 1e-9, "{a} != {e}"),
                (None, None) => {}
                _ => panic!("{actual:?} != {expected:?}"),
            }
        }
    }

    #[test]
    fn sma_of_three_closes() {
        let sma = Indicator::sma("sma2", 2, SourceField::Close).unwrap();
        let values = sma.compute(&closes(&[10.0, 20.0, 30.0]));
        assert_close(&values, &[None, Some(15.0), Some(25.0)]);
    }

    #[test]
    fn sma_defines_len_minus_window_plus_one_values() {
        let records = closes(&(0..40).map(|i| i as f64 * 1.5).collect::<Vec<_>>());
        for window in [1, 2, 7, 40] {
            let sma = Indicator::sma("s", window, SourceField::Close).unwrap();
            let defined = sma.compute(&records).iter().flatten().count();
            assert_eq!(defined, records.len() - window as usize + 1);
        }
    }

    #[test]
    fn ema_is_seeded_with_sma_then_smoothed() {
        let ema = Indicator::ema("ema3", 3, SourceField::Close).unwrap();
        let values = ema.compute(&closes(&[1.0, 2.0, 3.0, 4.0, 5.0]));
        // alpha = 0.5, seed = mean(1, 2, 3)
        assert_close(&values, &[None, None, Some(2.0), Some(3.0), Some(4.0)]);
    }

    #[test]
    fn ema_recomputation_is_idempotent() {
        let records = closes(&[5.0, 3.0, 8.0, 13.0, 2.0, 7.0, 9.0]);
        let ema = Indicator::ema("e", 3, SourceField::Close).unwrap();
        assert_eq!(ema.compute(&records), ema.compute(&records));
    }

    #[test]
    fn non_positive_window_is_rejected() {
        assert_eq!(
            IndicatorSpec::new(0, SourceField::Close),
            Err(ConfigError::InvalidWindow(0))
        );
        assert_eq!(
            IndicatorSpec::new(-3, SourceField::Close),
            Err(ConfigError::InvalidWindow(-3))
        );
    }

    #[test]
    fn unknown_source_name_is_rejected() {
        assert_eq!(
            IndicatorSpec::parse(10, "vwap"),
            Err(ConfigError::UnknownSourceField("vwap".to_string()))
        );
        assert_eq!(
            IndicatorSpec::parse(10, " Volume ").unwrap().source(),
            &SourceField::Volume
        );
    }

    #[test]
    fn window_longer_than_any_series_yields_nothing() {
        let records = closes(&[1.0, 2.0, 3.0]);
        for window in [1_000_000_000_000, i64::MAX] {
            let sma = Indicator::sma("s", window, SourceField::Close).unwrap();
            assert_eq!(sma.compute(&records), vec![None, None, None]);
            let ema = Indicator::ema("e", window, SourceField::Close).unwrap();
            assert_eq!(ema.compute(&records), vec![None, None, None]);
        }
    }

    #[test]
    fn missing_input_yields_no_value() {
        let ema = Indicator::ema("e", 2, SourceField::indicator("absent")).unwrap();
        let values = ema.compute(&closes(&[1.0, 2.0, 3.0]));
        assert!(values.iter().all(Option::is_none));
    }

    #[test]
    fn later_pass_reads_earlier_pass() {
        let pipeline = IndicatorPipeline::with_passes([
            Indicator::sma("sma2", 2, SourceField::Close).unwrap(),
            Indicator::ema("ema_of_sma", 2, SourceField::indicator("sma2")).unwrap(),
        ])
        .unwrap();
        let records: Vec<Ohlcv> = [10.0, 20.0, 30.0, 40.0]
            .iter()
            .enumerate()
            .map(|(i, c)| mk_record(i as i64, *c))
            .collect();
        let out = pipeline.run(&records);
        let layered: Vec<_> = out.iter().map(|r| r.get("ema_of_sma")).collect();
        // sma2 = [-, 15, 25, 35]; ema2 seeds at 20, then 20 + 2/3 * 15
        assert_close(&layered, &[None, None, Some(20.0), Some(30.0)]);
        assert_eq!(out[1].get("sma2"), Some(15.0));
    }

    #[test]
    fn gap_handling_follows_skip_undefined() {
        let mut records = closes(&[0.0; 5]);
        for (r, v) in records.iter_mut().zip([Some(1.0), Some(2.0), None, Some(3.0), Some(4.0)]) {
            r.set("input", v);
        }
        let skipping = Indicator::sma("s", 2, SourceField::indicator("input")).unwrap();
        assert_close(
            &skipping.compute(&records),
            &[None, Some(1.5), None, Some(2.5), Some(3.5)],
        );

        let spec = IndicatorSpec::new(2, SourceField::indicator("input"))
            .unwrap()
            .with_skip_undefined(false);
        let restarting = Indicator::new("s", IndicatorKind::Sma, spec).unwrap();
        assert_close(
            &restarting.compute(&records),
            &[None, Some(1.5), None, None, Some(3.5)],
        );
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut pipeline = IndicatorPipeline::new();
        pipeline
            .push(Indicator::ema("ema50", 50, SourceField::Close).unwrap())
            .unwrap();
        let err = pipeline
            .push(Indicator::sma("ema50", 5, SourceField::Close).unwrap())
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateKey("ema50".to_string()));
    }

    #[test]
    fn indicator_defs_parse_from_json() {
        let defs: Vec<IndicatorDef> = serde_json::from_str(
            r#"[
                {"key": "smaVolume50", "kind": "sma", "window": 20, "source": "volume"},
                {"key": "ema200", "kind": "ema", "window": 200},
                {"key": "smooth", "kind": "ema", "window": 5, "of": "smaVolume50"}
            ]"#,
        )
        .unwrap();
        let pipeline = IndicatorPipeline::from_defs(defs).unwrap();
        let passes = pipeline.passes();
        assert_eq!(passes[0].spec().source(), &SourceField::Volume);
        assert_eq!(passes[1].spec().source(), &SourceField::Close);
        assert_eq!(passes[2].spec().source(), &SourceField::indicator("smaVolume50"));
        assert_eq!(
            pipeline.legend()[1],
            LegendEntry {
                key: "ema200".to_string(),
                label: "EMA".to_string(),
                window: 200
            }
        );
    }

    #[test]
    fn bad_defs_are_configuration_errors() {
        let negative = IndicatorDef::new("x", IndicatorKind::Sma, -1, "close");
        assert_eq!(
            Indicator::try_from(negative),
            Err(ConfigError::InvalidWindow(-1))
        );

        let mut both = IndicatorDef::new("y", IndicatorKind::Ema, 3, "close");
        both.of = Some("x".to_string());
        assert_eq!(
            Indicator::try_from(both),
            Err(ConfigError::ConflictingSource("y".to_string()))
        );

        assert_eq!(
            "wma".parse::<IndicatorKind>(),
            Err(ConfigError::UnknownKind("wma".to_string()))
        );
    }

    #[test]
    fn augmented_records_flatten_bar_fields_and_nest_indicators() {
        let mut r = AugmentedRecord::new(mk_record(7, 10.0));
        r.set("ema50", Some(9.5));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["date"], 7);
        assert_eq!(json["indicators"]["ema50"], 9.5);
        r.set("ema50", None);
        assert_eq!(r.get("ema50"), None);
    }
}
