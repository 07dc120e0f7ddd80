//! collectl raw capture decoder
//!
//! A capture is gzip-compressed text. A `#` header describes the host,
//! then every sample starts with a `>>> <epoch>.<frac> <<<` marker and
//! carries raw `/proc/stat` and `/proc/meminfo` lines:
//!
//! ```text
//! # SubSys:     bcdfijmnstYZ Options: z Interval: 10:60 NumCPUs: 8 NumBud: 3
//! # Memory:     32174236 kB  Swap: 0 kB
//! >>> 1425304810.002 <<<
//! cpu  4705 356 584 3699 23 23 0 0 0 0
//! MemTotal:       32174236 kB
//! ```
//!
//! CPU usage needs two consecutive samples, so the first sample of a
//! capture only seeds the counters.
//!
//! The capture collectl is currently writing has no gzip trailer yet.
//! Decoding stops at the first read error once samples were seen and keeps
//! what was read so far.

use super::{DecodedCapture, HardwareFacts, HostTimeSeries, Sample, TelemetryDecoder, TimeWindow};
use crate::error::{HarvestError, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::warn;

pub const COLUMNS: [&str; 3] = ["cpu_pct", "mem_used_kb", "mem_total_kb"];

/// Header keys copied verbatim into [`HardwareFacts::extras`]
const EXTRA_HEADERS: [&str; 3] = ["Host", "Kernel", "Distro"];

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectlDecoder;

impl TelemetryDecoder for CollectlDecoder {
    fn decode(&self, path: &Path, window: &TimeWindow) -> Result<DecodedCapture> {
        let file = File::open(path)?;
        let reader = BufReader::new(MultiGzDecoder::new(file));
        decode_lines(reader.lines(), window, path).map_err(|reason| HarvestError::decode(path, reason))
    }
}

/// Aggregate CPU jiffies from one `cpu ` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTicks {
    idle: u64,
    total: u64,
}

impl CpuTicks {
    fn parse(line: &str) -> Option<Self> {
        let ticks: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(|v| v.parse().ok())
            .collect::<Option<_>>()?;
        if ticks.len() < 4 {
            return None;
        }

        // idle + iowait
        let idle = ticks[3] + ticks.get(4).copied().unwrap_or(0);
        Some(Self {
            idle,
            total: ticks.iter().sum(),
        })
    }

    /// Busy share of the interval since `previous`
    fn percent_since(&self, previous: &CpuTicks) -> Option<f64> {
        let total = self.total.checked_sub(previous.total)?;
        let idle = self.idle.checked_sub(previous.idle)?;
        if total == 0 {
            return None;
        }
        Some((total.saturating_sub(idle)) as f64 / total as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MemoryReading {
    total_kb: Option<u64>,
    free_kb: u64,
    buffers_kb: u64,
    cached_kb: u64,
}

impl MemoryReading {
    fn update(&mut self, key: &str, value_kb: u64) {
        match key {
            "MemTotal" => self.total_kb = Some(value_kb),
            "MemFree" => self.free_kb = value_kb,
            "Buffers" => self.buffers_kb = value_kb,
            "Cached" => self.cached_kb = value_kb,
            _ => {}
        }
    }

    /// (used, total) excluding page cache and buffers
    fn used(&self) -> Option<(u64, u64)> {
        let total = self.total_kb?;
        let used = total
            .saturating_sub(self.free_kb)
            .saturating_sub(self.buffers_kb)
            .saturating_sub(self.cached_kb);
        Some((used, total))
    }
}

#[derive(Default)]
struct DecodeState {
    capture: DecodedCapture,
    timestamp: Option<i64>,
    cpu: Option<CpuTicks>,
    previous_cpu: Option<CpuTicks>,
    memory: MemoryReading,
}

impl DecodeState {
    /// Close the current sample, emitting a row if it falls in the window
    fn flush(&mut self, window: &TimeWindow) {
        let Some(timestamp) = self.timestamp.take() else {
            return;
        };
        let Some(cpu) = self.cpu.take() else {
            return;
        };

        // The counters advance even for samples outside the window so the
        // first in-window row has a correct delta.
        let percent = self
            .previous_cpu
            .replace(cpu)
            .and_then(|previous| cpu.percent_since(&previous));

        if !window.contains(timestamp) {
            return;
        }
        if let (Some(cpu_pct), Some((used, total))) = (percent, self.memory.used()) {
            self.capture.series.rows.push(Sample {
                timestamp,
                values: vec![cpu_pct, used as f64, total as f64],
            });
        }
    }

    fn header(&mut self, line: &str) {
        let body = line.trim_start_matches('#').trim();
        let hardware = &mut self.capture.hardware;

        if let Some(cpus) = value_after(body, "NumCPUs:") {
            hardware.cpus = cpus.parse().ok();
        }
        if let Some(rest) = body.strip_prefix("Memory:") {
            hardware.memory_kb = parse_size_kb(rest);
        }
        for key in EXTRA_HEADERS {
            if let Some(rest) = body.strip_prefix(key).and_then(|r| r.strip_prefix(':')) {
                if let Some(value) = rest.split_whitespace().next() {
                    hardware.extras.insert(key.to_lowercase(), value.to_string());
                }
            }
        }
    }
}

fn decode_lines<I>(
    lines: I,
    window: &TimeWindow,
    path: &Path,
) -> std::result::Result<DecodedCapture, String>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    let mut state = DecodeState {
        capture: DecodedCapture {
            series: HostTimeSeries::new(COLUMNS.iter().map(|c| c.to_string()).collect()),
            hardware: HardwareFacts::default(),
        },
        ..Default::default()
    };
    let mut seen_marker = false;

    for line in lines {
        let line = match line {
            Ok(line) => line,
            Err(e) if seen_marker => {
                warn!("{} ends early ({}), keeping samples read so far", path.display(), e);
                break;
            }
            Err(e) => return Err(e.to_string()),
        };

        if let Some(stamp) = sample_marker(&line) {
            state.flush(window);
            state.timestamp = Some(stamp);
            seen_marker = true;
        } else if line.starts_with('#') {
            if !seen_marker {
                state.header(&line);
            }
        } else if line.starts_with("cpu ") {
            state.cpu = CpuTicks::parse(&line);
        } else if let Some((key, value)) = meminfo_line(&line) {
            state.memory.update(key, value);
        }
    }
    state.flush(window);

    if !seen_marker && state.capture.hardware == HardwareFacts::default() {
        return Err("no collectl header or samples".to_string());
    }
    Ok(state.capture)
}

/// Epoch seconds of a `>>> 1425304810.002 <<<` line
fn sample_marker(line: &str) -> Option<i64> {
    let inner = line.strip_prefix(">>>")?.trim().strip_suffix("<<<")?.trim();
    let secs: f64 = inner.parse().ok()?;
    Some(secs.trunc() as i64)
}

fn meminfo_line(line: &str) -> Option<(&str, u64)> {
    let (key, rest) = line.split_once(':')?;
    let value = rest.split_whitespace().next()?.parse().ok()?;
    Some((key.trim(), value))
}

fn value_after<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    let start = body.find(key)? + key.len();
    body[start..].split_whitespace().next()
}

/// `32174236 kB` or `31420 MB`
fn parse_size_kb(text: &str) -> Option<u64> {
    let mut parts = text.split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some(unit) if unit.eq_ignore_ascii_case("mb") => Some(value * 1024),
        Some(unit) if unit.eq_ignore_ascii_case("gb") => Some(value * 1024 * 1024),
        _ => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Checkpoint;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn window(start: i64, end: i64) -> TimeWindow {
        TimeWindow::from_marks(vec![
            Checkpoint { name: "start".into(), timestamp: start },
            Checkpoint { name: "end".into(), timestamp: end },
        ])
        .unwrap()
    }

    fn sample(ts: &str, busy: u64, idle: u64, free_kb: u64) -> String {
        format!(
            ">>> {ts} <<<\ncpu  {busy} 0 0 {idle} 0 0 0 0 0 0\ncpu0 {busy} 0 0 {idle} 0 0 0 0 0 0\n\
             MemTotal: 16000 kB\nMemFree: {free_kb} kB\nBuffers: 1000 kB\nCached: 3000 kB\n"
        )
    }

    fn capture() -> String {
        let mut text = String::from(
            "################################################################\n\
             # Host:       ip-10-0-0-1  DaemonOpts: -f /var/log/collectl\n\
             # SubSys:     bcdfijmnstYZ Options: z Interval: 10:60 NumCPUs: 8 NumBud: 3\n\
             # Memory:     16000 kB  Swap: 0 kB\n",
        );
        text.push_str(&sample("100.001", 0, 0, 8000));
        text.push_str(&sample("110.001", 50, 50, 6000));
        text.push_str(&sample("120.500", 125, 75, 4000));
        text
    }

    fn decode_text(text: &str, w: &TimeWindow) -> DecodedCapture {
        decode_lines(text.lines().map(|l| Ok(l.to_string())), w, Path::new("test.raw.gz")).unwrap()
    }

    #[test]
    fn test_cpu_percent_from_deltas() {
        let decoded = decode_text(&capture(), &window(0, 1000));
        let rows = &decoded.series.rows;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 110);
        assert!((rows[0].values[0] - 50.0).abs() < 1e-9);
        assert_eq!(rows[1].timestamp, 120);
        assert!((rows[1].values[0] - 75.0).abs() < 1e-9);
        // 16000 - 6000 free - 1000 buffers - 3000 cached
        assert_eq!(rows[0].values[1], 6000.0);
        assert_eq!(rows[0].values[2], 16000.0);
    }

    #[test]
    fn test_counters_advance_outside_window() {
        let decoded = decode_text(&capture(), &window(115, 130));
        let rows = &decoded.series.rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, 120);
        assert!((rows[0].values[0] - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_hardware_from_header() {
        let decoded = decode_text(&capture(), &window(0, 1));
        assert!(decoded.series.is_empty());
        assert_eq!(decoded.hardware.cpus, Some(8));
        assert_eq!(decoded.hardware.memory_kb, Some(16000));
        assert_eq!(decoded.hardware.extras["host"], "ip-10-0-0-1");
    }

    #[test]
    fn test_size_units() {
        assert_eq!(parse_size_kb(" 31420 MB  Swap: 0 MB"), Some(31420 * 1024));
        assert_eq!(parse_size_kb(" 2048 kB"), Some(2048));
        assert_eq!(parse_size_kb(" lots"), None);
    }

    #[test]
    fn test_gzip_capture_round_trip_through_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip-10-0-0-1-20150302-140000.raw.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(capture().as_bytes()).unwrap();
        encoder.finish().unwrap();

        let decoded = CollectlDecoder.decode(&path, &window(0, 1000)).unwrap();
        assert_eq!(decoded.series.len(), 2);
        assert_eq!(decoded.series.columns, COLUMNS.to_vec());
    }

    #[test]
    fn test_capture_still_being_written_keeps_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip-10-0-0-1-20150302-140000.raw.gz");

        let mut text = capture();
        for i in 0..50u64 {
            let ts = format!("{}.001", 130 + i * 10);
            text.push_str(&sample(&ts, 125 + (i + 1) * 40, 75 + (i + 1) * 60, 4000));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.flush().unwrap();
        // no trailer, as while collectl still holds the file open
        std::fs::write(&path, encoder.get_ref()).unwrap();

        let decoded = CollectlDecoder.decode(&path, &window(0, 10_000)).unwrap();
        assert_eq!(decoded.series.len(), 52);
        assert_eq!(decoded.series.rows.last().unwrap().timestamp, 620);
        assert!((decoded.series.rows[2].values[0] - 40.0).abs() < 1e-9);
        assert_eq!(decoded.hardware.cpus, Some(8));
    }

    #[test]
    fn test_read_error_before_any_sample_fails() {
        let lines = vec![
            Ok("# SubSys:     bcdfijmnstYZ NumCPUs: 8".to_string()),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "incomplete deflate stream")),
        ];
        let err = decode_lines(lines.into_iter(), &window(0, 1000), Path::new("h.raw.gz")).unwrap_err();
        assert!(err.contains("incomplete deflate stream"));
    }

    #[test]
    fn test_not_gzip_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken-20150302-140000.raw.gz");
        std::fs::write(&path, b"this is not gzip").unwrap();

        let err = CollectlDecoder.decode(&path, &window(0, 1000)).unwrap_err();
        assert!(matches!(err, HarvestError::Decode { .. }));
    }
}
