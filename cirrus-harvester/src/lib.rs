//! Cirrus Harvester - cluster telemetry harvesting and reporting
//!
//! Pulls collectl captures off every node of an ephemeral compute cluster,
//! lines them up against the genomics pipeline's own run window and turns
//! the result into a section-based report:
//! - [`collector`]: diff-synced download of captures into a local cache
//! - [`parser`]: per-host time series clipped to the pipeline window
//! - [`report`]: section/field/item documents with recorded warnings
//! - [`provider`]: AWS and Azure topology lookups, selected by name
//!
//! # Recovery
//!
//! Nothing in the engine retries. A node that cannot be reached is logged,
//! counted as failed in the [`collector::HarvestSummary`] and skipped. The
//! recovery procedure for any partial failure is to rerun the whole
//! harvest: files already in the cache with a matching size and mtime are
//! not transferred again, so a rerun only fetches what is missing.

pub mod collector;
pub mod config;
pub mod error;
pub mod parser;
pub mod provider;
pub mod report;
pub mod session;
pub mod state;
pub mod topology;

pub use collector::{Collector, HarvestSummary};
pub use config::HarvestConfig;
pub use error::{HarvestError, Result};
pub use parser::{ParsedTelemetry, Parser, TimeWindow};
pub use report::{ReportBuilder, ReportDocument};
pub use topology::ClusterTopology;
