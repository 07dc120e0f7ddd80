//! Telemetry parsing
//!
//! Turns the collector's cache directory into per-host time series bounded
//! by the pipeline's own execution window:
//! - the window comes from the pipeline timing log ([`TimingSource`])
//! - every `.raw.gz` capture is decoded ([`TelemetryDecoder`]) and clipped
//! - captures of the same host are concatenated in file-name order
//!
//! A capture that fails to decode is logged and skipped; the rest of the
//! cache is still parsed.

mod collectl;
mod timings;

pub use collectl::CollectlDecoder;
pub use timings::{parse_timings, BcbioTimingLog};

use crate::error::{HarvestError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Suffix of a collectl capture
pub const CAPTURE_SUFFIX: &str = ".raw.gz";

/// A named point in the pipeline run, unix seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub name: String,
    pub timestamp: i64,
}

/// Inclusive bounds of the pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    start: i64,
    end: i64,
    marks: Vec<Checkpoint>,
}

impl TimeWindow {
    /// Fails when there is no checkpoint to bound the window with
    pub fn from_marks(marks: Vec<Checkpoint>) -> Result<Self> {
        let start = marks.iter().map(|m| m.timestamp).min();
        let end = marks.iter().map(|m| m.timestamp).max();

        match (start, end) {
            (Some(start), Some(end)) => Ok(Self { start, end, marks }),
            _ => Err(HarvestError::Configuration(
                "timing log holds no checkpoints".to_string(),
            )),
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    /// Checkpoints in log order
    pub fn marks(&self) -> &[Checkpoint] {
        &self.marks
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

/// One sample row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: i64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostTimeSeries {
    pub columns: Vec<String>,
    pub rows: Vec<Sample>,
}

impl HostTimeSeries {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Values of one column, skipping rows too short to hold it
    pub fn column<'a>(&'a self, name: &str) -> impl Iterator<Item = f64> + 'a {
        let index = self.columns.iter().position(|c| c == name);
        self.rows
            .iter()
            .filter_map(move |row| index.and_then(|i| row.values.get(i).copied()))
    }

    fn append(&mut self, other: HostTimeSeries) {
        if self.columns != other.columns {
            warn!(
                "Column schema changed from {:?} to {:?}; keeping the first",
                self.columns, other.columns
            );
        }
        self.rows.extend(other.rows);
    }
}

/// Static descriptors of a host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HardwareFacts {
    pub cpus: Option<u32>,
    pub memory_kb: Option<u64>,
    pub extras: BTreeMap<String, String>,
}

/// What a decoder yields for one capture
#[derive(Debug, Clone, Default)]
pub struct DecodedCapture {
    pub series: HostTimeSeries,
    pub hardware: HardwareFacts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedTelemetry {
    pub series: BTreeMap<String, HostTimeSeries>,
    pub hardware: BTreeMap<String, HardwareFacts>,
    pub window: TimeWindow,
}

impl ParsedTelemetry {
    pub fn marks(&self) -> &[Checkpoint] {
        self.window.marks()
    }
}

/// Reads checkpoints out of a pipeline log
pub trait TimingSource: Send + Sync {
    fn checkpoints(&self, log: &Path) -> Result<Vec<Checkpoint>>;
}

/// Decodes one capture, keeping only rows inside `window`
pub trait TelemetryDecoder: Send + Sync {
    fn decode(&self, path: &Path, window: &TimeWindow) -> Result<DecodedCapture>;
}

/// Host part of a capture file name
pub fn host_key(file_name: &str) -> String {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    let re = SUFFIX.get_or_init(|| Regex::new(r"-\d{8}-\d{6}\.raw\.gz$").expect("valid regex"));
    re.replace(file_name, "").into_owned()
}

pub struct Parser<T = BcbioTimingLog, D = CollectlDecoder> {
    timing_log: PathBuf,
    cache_dir: PathBuf,
    timings: T,
    decoder: D,
}

impl Parser {
    pub fn new(timing_log: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_collaborators(timing_log, cache_dir, BcbioTimingLog, CollectlDecoder::default())
    }
}

impl<T: TimingSource, D: TelemetryDecoder> Parser<T, D> {
    pub fn with_collaborators(
        timing_log: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        timings: T,
        decoder: D,
    ) -> Self {
        Self {
            timing_log: timing_log.into(),
            cache_dir: cache_dir.into(),
            timings,
            decoder,
        }
    }

    pub fn time_window(&self) -> Result<TimeWindow> {
        let marks = self.timings.checkpoints(&self.timing_log)?;
        TimeWindow::from_marks(marks)
    }

    /// Capture file names in the cache, sorted
    fn captures(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(&self.cache_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(CAPTURE_SUFFIX))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn run(&self) -> Result<ParsedTelemetry> {
        let window = self.time_window()?;
        info!(
            "Pipeline window {}..{} ({} checkpoints)",
            window.start(),
            window.end(),
            window.marks().len()
        );

        let mut series: BTreeMap<String, HostTimeSeries> = BTreeMap::new();
        let mut hardware = BTreeMap::new();

        for name in self.captures()? {
            let path = self.cache_dir.join(&name);
            let decoded = match self.decoder.decode(&path, &window) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Skipping {}: {}", name, e);
                    continue;
                }
            };

            if decoded.series.is_empty() {
                debug!("No samples inside the window in {}", name);
                continue;
            }

            let host = host_key(&name);
            debug!("{} rows from {} for {}", decoded.series.len(), name, host);
            hardware.insert(host.clone(), decoded.hardware);
            match series.get_mut(&host) {
                Some(existing) => existing.append(decoded.series),
                None => {
                    series.insert(host, decoded.series);
                }
            }
        }

        info!("Parsed telemetry for {} host(s)", series.len());
        Ok(ParsedTelemetry {
            series,
            hardware,
            window,
        })
    }
}
