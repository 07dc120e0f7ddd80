//! Error taxonomy for the harvest engine
//!
//! Every variant maps to one recovery policy:
//! - `Connectivity`: caught at the per-node boundary, node skipped
//! - `Configuration`: enrichment skipped, fatal only while loading config
//! - `Decode`: caught per file by the parser
//! - `ProviderApi`: logged, treated as an empty result set
//!
//! There is no retry anywhere in the engine. Rerunning the whole harvest is
//! the recovery procedure for any transient failure.

use std::path::PathBuf;

/// Errors raised by harvest, parse and report operations
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("cannot reach {host}: {reason}")]
    Connectivity { host: String, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("cannot decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },
    #[error("{provider} API error: {reason}")]
    ProviderApi { provider: String, reason: String },
    #[error("the {object:?} was not found in {container}")]
    NotFound { object: String, container: String },
    #[error("{feature} is not available in {context}")]
    NotSupported { feature: String, context: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    pub fn connectivity(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connectivity {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn provider_api(provider: impl Into<String>, reason: impl ToString) -> Self {
        Self::ProviderApi {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures scoped to a single node
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;
