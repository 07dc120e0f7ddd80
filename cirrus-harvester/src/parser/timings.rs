//! bcbio-nextgen timing log reader
//!
//! Lines of interest look like
//! `[2015-03-02T14:00Z] ip-10-0-0-1: Timing: alignment`; everything else in
//! the log is ignored.

use super::{Checkpoint, TimingSource};
use crate::error::{HarvestError, Result};
use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// Timestamp layouts bcbio has written over time, tried after RFC 3339
const STAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%MZ", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

#[derive(Debug, Clone, Copy, Default)]
pub struct BcbioTimingLog;

impl TimingSource for BcbioTimingLog {
    fn checkpoints(&self, log: &Path) -> Result<Vec<Checkpoint>> {
        let text = std::fs::read_to_string(log).map_err(|e| {
            HarvestError::Configuration(format!("cannot read timing log {}: {}", log.display(), e))
        })?;
        Ok(parse_timings(&text))
    }
}

fn timing_line() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| {
        Regex::new(r"^\[(?P<stamp>[^\]]+)\]\s+(?P<host>[^:\s]+):\s+Timing:\s+(?P<step>.+?)\s*$")
            .expect("valid regex")
    })
}

/// Checkpoints in log order
pub fn parse_timings(text: &str) -> Vec<Checkpoint> {
    text.lines()
        .filter_map(|line| timing_line().captures(line))
        .filter_map(|caps| {
            let stamp = &caps["stamp"];
            match parse_stamp(stamp) {
                Some(timestamp) => Some(Checkpoint {
                    name: caps["step"].to_string(),
                    timestamp,
                }),
                None => {
                    debug!("Unreadable timestamp {:?} on host {}", stamp, &caps["host"]);
                    None
                }
            }
        })
        .collect()
}

fn parse_stamp(stamp: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(stamp) {
        return Some(dt.timestamp());
    }
    STAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(stamp, fmt).ok())
        .map(|naive| naive.and_utc().timestamp())
}
