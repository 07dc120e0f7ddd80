//! Harvester configuration
//!
//! Handles:
//! - Cluster inventory location and provider selection
//! - Collection settings (cache directory, remote glob, session fan-out)
//! - Shared parallel filesystem enrichment pass
//! - AWS CLI and Azure management API access

use crate::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "CIRRUS_HARVESTER_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub cluster: ClusterConfig,
    pub harvest: CollectConfig,
    pub shared_fs: SharedFsConfig,
    pub aws: AwsConfig,
    pub azure: AzureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// YAML snapshot written by the cluster orchestrator
    pub inventory: PathBuf,
    pub name: String,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    pub cache_dir: PathBuf,
    pub remote_glob: String,
    pub ssh_port: u16,
    /// Simultaneous sessions; 1 keeps the pass strictly sequential
    pub max_sessions: usize,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedFsConfig {
    pub enabled: bool,
    pub mount: String,
    pub fs_type: String,
    pub nat_device: String,
    pub bastion_user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub cli: String,
    pub region: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub subscription_id: Option<String>,
    /// PEM bundle holding the management certificate and its key
    pub certificate: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            inventory: data_dir().join("clusters").join("bcbio.yaml"),
            name: "bcbio".to_string(),
            provider: "aws".to_string(),
        }
    }
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            cache_dir: data_dir().join("collectl"),
            remote_glob: "/var/log/collectl/*.raw.gz".to_string(),
            ssh_port: 22,
            max_sessions: 1,
            connect_timeout_secs: None,
        }
    }
}

impl Default for SharedFsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mount: "/scratch".to_string(),
            fs_type: "lustre".to_string(),
            nat_device: "NATDevice".to_string(),
            bastion_user: "ec2-user".to_string(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            cli: "aws".to_string(),
            region: None,
            timeout_secs: 60,
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cirrus-harvester")
}

impl HarvestConfig {
    /// Load config from the override path or the OS-specific location
    pub async fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if path.exists() {
            Self::load_from(&path).await
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub async fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: HarvestConfig = toml::from_str(&content).map_err(|e| {
            HarvestError::Configuration(format!("invalid {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the OS-specific location
    pub async fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| HarvestError::Configuration(e.to_string()))?;
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir().ok_or_else(|| {
            HarvestError::Configuration("could not find config directory".to_string())
        })?;
        path.push("cirrus-harvester");
        path.push("config.toml");
        Ok(path)
    }

    fn validate(&self) -> Result<()> {
        if self.harvest.max_sessions == 0 {
            return Err(HarvestError::Configuration(
                "harvest.max_sessions must be at least 1".to_string(),
            ));
        }
        if !self.harvest.remote_glob.ends_with(".raw.gz") {
            return Err(HarvestError::Configuration(format!(
                "harvest.remote_glob {:?} does not select .raw.gz captures",
                self.harvest.remote_glob
            )));
        }
        Ok(())
    }
}
