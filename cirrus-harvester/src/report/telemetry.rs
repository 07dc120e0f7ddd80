//! Resource usage sections built from parsed telemetry

use super::{Field, ReportBuilder};
use crate::parser::{HostTimeSeries, ParsedTelemetry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub samples: usize,
    pub cpu_mean: Option<f64>,
    pub cpu_peak: Option<f64>,
    pub mem_peak_kb: Option<f64>,
}

impl UsageStats {
    pub fn from_series(series: &HostTimeSeries) -> Self {
        let cpu: Vec<f64> = series.column("cpu_pct").collect();
        let cpu_mean = if cpu.is_empty() {
            None
        } else {
            Some(cpu.iter().sum::<f64>() / cpu.len() as f64)
        };

        Self {
            samples: series.len(),
            cpu_mean,
            cpu_peak: cpu.iter().copied().reduce(f64::max),
            mem_peak_kb: series.column("mem_used_kb").reduce(f64::max),
        }
    }
}

/// "hosts", "usage" and "timing" sections
pub fn add_telemetry(builder: &mut ReportBuilder, parsed: &ParsedTelemetry) {
    builder.add_section(
        "hosts",
        "Hosts",
        Some("Hardware reported by each host's telemetry."),
        vec![
            Field::labelled("host", "Host"),
            Field::labelled("cpus", "CPUs"),
            Field::labelled("memory_kb", "Memory (kB)"),
            Field::labelled("details", "Details"),
        ],
    );
    for (host, facts) in &parsed.hardware {
        builder.add_item(
            "hosts",
            vec![
                json!(host),
                json!(facts.cpus),
                json!(facts.memory_kb),
                json!(facts.extras),
            ],
        );
    }

    builder.add_section(
        "usage",
        "Resource usage",
        Some("CPU and memory use inside the pipeline window."),
        vec![
            Field::labelled("host", "Host"),
            Field::labelled("samples", "Samples"),
            Field::labelled("cpu_mean", "Mean CPU %"),
            Field::labelled("cpu_peak", "Peak CPU %"),
            Field::labelled("mem_peak_kb", "Peak memory (kB)"),
        ],
    );
    for (host, series) in &parsed.series {
        let stats = UsageStats::from_series(series);
        builder.add_item(
            "usage",
            vec![
                json!(host),
                json!(stats.samples),
                json!(stats.cpu_mean),
                json!(stats.cpu_peak),
                json!(stats.mem_peak_kb),
            ],
        );
    }
    if parsed.series.is_empty() {
        builder.warn("No telemetry samples fall inside the pipeline window.");
    }

    builder.add_section(
        "timing",
        "Pipeline timing",
        None,
        vec![
            Field::labelled("checkpoint", "Checkpoint"),
            Field::labelled("timestamp", "Timestamp"),
        ],
    );
    builder.add_items(
        "timing",
        parsed.marks().iter().map(|mark| {
            let stamp = DateTime::<Utc>::from_timestamp(mark.timestamp, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| mark.timestamp.to_string());
            vec![json!(mark.name), json!(stamp)]
        }),
    );
}
