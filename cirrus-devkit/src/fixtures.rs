/*!
Capture and timing log fixtures

Builds the two inputs the parser reads: gzip collectl raw captures with
`/proc/stat` and `/proc/meminfo` samples, and bcbio timing logs.
*/

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `<host>-YYYYMMDD-HHMMSS.raw.gz` for a capture opened at `opened_at`
pub fn capture_name(host: &str, opened_at: i64) -> String {
    let stamp = DateTime::<Utc>::from_timestamp(opened_at, 0)
        .unwrap_or_default()
        .format("%Y%m%d-%H%M%S");
    format!("{host}-{stamp}.raw.gz")
}

#[derive(Debug, Clone)]
struct RawSample {
    timestamp: i64,
    busy: u64,
    idle: u64,
    free_kb: u64,
}

/// One collectl raw capture
///
/// Samples carry cumulative jiffies, so `busy` and `idle` must not
/// decrease from one sample to the next.
#[derive(Debug, Clone)]
pub struct CaptureBuilder {
    host: String,
    cpus: u32,
    memory_kb: u64,
    samples: Vec<RawSample>,
}

impl CaptureBuilder {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            cpus: 4,
            memory_kb: 16_000,
            samples: Vec::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Timestamp of the newest sample, if any
    pub fn last_sample(&self) -> Option<i64> {
        self.samples.last().map(|s| s.timestamp)
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn memory_kb(mut self, memory_kb: u64) -> Self {
        self.memory_kb = memory_kb;
        self
    }

    pub fn sample(mut self, timestamp: i64, busy: u64, idle: u64, free_kb: u64) -> Self {
        self.samples.push(RawSample {
            timestamp,
            busy,
            idle,
            free_kb,
        });
        self
    }

    /// `count` samples every `interval` seconds with a constant `percent`
    /// CPU load. An empty capture first gets a seed sample at `start`.
    pub fn steady(mut self, start: i64, interval: i64, count: usize, percent: u64) -> Self {
        let percent = percent.min(100);
        let free_kb = self.memory_kb / 2;
        let mut timestamp = start;
        let (mut busy, mut idle) = match self.samples.last() {
            Some(last) => (last.busy, last.idle),
            None => {
                self.samples.push(RawSample {
                    timestamp,
                    busy: 0,
                    idle: 0,
                    free_kb,
                });
                timestamp += interval;
                (0, 0)
            }
        };

        for _ in 0..count {
            busy += percent;
            idle += 100 - percent;
            self.samples.push(RawSample {
                timestamp,
                busy,
                idle,
                free_kb,
            });
            timestamp += interval;
        }
        self
    }

    pub fn text(&self) -> String {
        let mut text = String::from("################################################################\n");
        let _ = writeln!(text, "# Host:       {}  DaemonOpts: -f /var/log/collectl", self.host);
        let _ = writeln!(
            text,
            "# SubSys:     bcdfijmnstYZ Options: z Interval: 10:60 NumCPUs: {} NumBud: 3",
            self.cpus
        );
        let _ = writeln!(text, "# Memory:     {} kB  Swap: 0 kB", self.memory_kb);
        let _ = writeln!(text, "################################################################");

        for sample in &self.samples {
            let _ = writeln!(text, ">>> {}.001 <<<", sample.timestamp);
            let _ = writeln!(text, "cpu  {} 0 0 {} 0 0 0 0 0 0", sample.busy, sample.idle);
            let _ = writeln!(text, "MemTotal:       {} kB", self.memory_kb);
            let _ = writeln!(text, "MemFree:        {} kB", sample.free_kb);
            let _ = writeln!(text, "Buffers:        0 kB");
            let _ = writeln!(text, "Cached:         0 kB");
        }
        text
    }

    pub fn gzip(&self) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.text().as_bytes())?;
        Ok(encoder.finish()?)
    }

    /// Sync-flushed stream without the gzip trailer, as collectl leaves
    /// the capture it is still appending to
    pub fn gzip_in_progress(&self) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.text().as_bytes())?;
        encoder.flush()?;
        Ok(encoder.get_ref().clone())
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.gzip()?)
            .with_context(|| format!("Failed to write capture {}", path.display()))
    }
}

/// bcbio-nextgen log with `Timing:` checkpoints between other lines
#[derive(Debug, Clone, Default)]
pub struct TimingLogBuilder {
    lines: Vec<String>,
}

impl TimingLogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(mut self, timestamp: i64, host: &str, step: &str) -> Self {
        self.lines.push(format!("[{}] {}: Timing: {}", stamp(timestamp), host, step));
        self
    }

    pub fn noise(mut self, timestamp: i64, host: &str, message: &str) -> Self {
        self.lines.push(format!("[{}] {}: {}", stamp(timestamp), host, message));
        self
    }

    pub fn text(&self) -> String {
        self.lines.iter().map(|l| format!("{l}\n")).collect()
    }

    pub fn write_to(&self, path: &Path) -> Result<PathBuf> {
        std::fs::write(path, self.text())
            .with_context(|| format!("Failed to write timing log {}", path.display()))?;
        Ok(path.to_path_buf())
    }
}

fn stamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_harvester::parser::{host_key, parse_timings};

    #[test]
    fn test_capture_name_has_host_key() {
        let name = capture_name("ip-10-0-0-1", 1425304800);
        assert_eq!(name, "ip-10-0-0-1-20150302-140000.raw.gz");
        assert_eq!(host_key(&name), "ip-10-0-0-1");
    }

    #[test]
    fn test_timing_log_is_readable() {
        let log = TimingLogBuilder::new()
            .noise(1425304700, "ip-10-0-0-1", "System YAML configuration: /mnt/work/c.yaml")
            .checkpoint(1425304800, "ip-10-0-0-1", "alignment")
            .checkpoint(1425310200, "ip-10-0-0-1", "variant calling");

        let marks = parse_timings(&log.text());
        assert_eq!(marks.len(), 2);
        assert_eq!(marks[0].timestamp, 1425304800);
        assert_eq!(marks[1].name, "variant calling");
    }

    #[test]
    fn test_steady_capture_layout() {
        let capture = CaptureBuilder::new("web1").steady(100, 10, 3, 25);
        let text = capture.text();
        assert_eq!(text.matches(">>> ").count(), 4);
        assert!(text.contains("NumCPUs: 4"));
        assert!(text.contains("cpu  75 0 0 225 0 0 0 0 0 0"));
    }
}
