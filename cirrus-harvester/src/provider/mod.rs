//! Cloud providers
//!
//! A provider answers live topology questions (security groups, instances)
//! and knows how, or whether, telemetry can be collected from its clusters.
//! Providers are picked by name at runtime through [`get`].

pub mod aws;
pub mod azure;

use crate::collector::HarvestSummary;
use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::parser::{ParsedTelemetry, Parser};
use crate::report::{self, ReportBuilder, ReportDocument};
use crate::session::Connector;
use crate::topology::ClusterTopology;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub use aws::AwsProvider;
pub use azure::AzureProvider;

/// Provider names accepted by [`get`]
pub const PROVIDERS: [&str; 2] = ["aws", "azure"];

/// Size of a machine type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Flavor {
    pub cpus: u32,
    pub memory_mb: u64,
}

impl Flavor {
    pub const fn new(cpus: u32, memory_mb: u64) -> Self {
        Self { cpus, memory_mb }
    }
}

/// One live machine as the provider reports it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub name: String,
    pub instance_type: String,
    pub state: String,
    pub ip: Option<String>,
    pub placement: Option<String>,
}

/// Resolves the shared filesystem's backing device to the stack serving it
#[async_trait]
pub trait StackDirectory: Send + Sync {
    /// Stack owning the server behind `device` (`<ip>@tcp`)
    async fn stack_name(&self, device: &str) -> Result<Option<String>>;

    /// Instance name to reachable address
    async fn instances(&self, stack: &str) -> Result<BTreeMap<String, String>>;
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn flavors(&self) -> &'static [(&'static str, Flavor)];

    fn flavor(&self, machine: &str) -> Option<Flavor> {
        self.flavors()
            .iter()
            .find(|(name, _)| *name == machine)
            .map(|(_, flavor)| *flavor)
    }

    async fn security_groups(&self, topology: &ClusterTopology) -> Result<BTreeSet<String>>;

    async fn instances(&self, topology: &ClusterTopology) -> Result<Vec<InstanceInfo>>;

    /// Sync every node's telemetry captures into the cache directory
    async fn collect_data(
        &self,
        topology: &ClusterTopology,
        config: &HarvestConfig,
        connector: &dyn Connector,
    ) -> Result<HarvestSummary>;

    /// Parse what [`CloudProvider::collect_data`] left in `cache_dir`
    fn resource_usage(&self, timing_log: &Path, cache_dir: &Path) -> Result<ParsedTelemetry> {
        Parser::new(timing_log, cache_dir).run()
    }

    /// Cluster status report: configuration, security groups, instances
    async fn information(&self, topology: &ClusterTopology) -> ReportDocument {
        let mut builder = ReportBuilder::new();
        report::add_cluster_info(&mut builder, &topology.config, |m| self.flavor(m));

        let groups = match self.security_groups(topology).await {
            Ok(groups) => groups,
            Err(e) => {
                tracing::error!("{}", e);
                BTreeSet::new()
            }
        };
        report::add_security_groups_info(
            &mut builder,
            topology.config.cluster.security_group.as_deref(),
            &groups,
        );

        let instances = match self.instances(topology).await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::error!("{}", e);
                Vec::new()
            }
        };
        report::add_instance_info(&mut builder, &instances);

        builder.digest()
    }
}

/// Provider by name, configured from `config`
pub fn get(name: &str, config: &HarvestConfig) -> Result<Box<dyn CloudProvider>> {
    match name {
        "aws" => Ok(Box::new(AwsProvider::new(config))),
        "azure" => Ok(Box::new(AzureProvider::from_config(config)?)),
        other => Err(HarvestError::NotFound {
            object: other.to_string(),
            container: format!("[{}]", PROVIDERS.join(", ")),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_lists_known_ones() {
        let err = get("gcp", &HarvestConfig::default()).err().unwrap();
        match err {
            HarvestError::NotFound { object, container } => {
                assert_eq!(object, "gcp");
                assert_eq!(container, "[aws, azure]");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_flavor_lookup() {
        let aws = get("aws", &HarvestConfig::default()).unwrap();
        assert_eq!(aws.name(), "aws");
        assert_eq!(aws.flavor("m3.2xlarge"), Some(Flavor::new(8, 30720)));
        assert_eq!(aws.flavor("m9.huge"), None);

        let azure = get("azure", &HarvestConfig::default()).unwrap();
        assert_eq!(azure.flavor("A9"), Some(Flavor::new(16, 114688)));
    }

    #[test]
    fn test_resource_usage_reads_local_cache_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("bcbio-nextgen.log");
        std::fs::write(
            &log,
            "[2015-03-02T14:00:00Z] frontend001: Timing: alignment\n\
             [2015-03-02T15:00:00Z] frontend001: Timing: variant calling\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a capture").unwrap();

        // no credentials: any API call would fail
        let azure = get("azure", &HarvestConfig::default()).unwrap();
        let parsed = azure.resource_usage(&log, dir.path()).unwrap();
        assert!(parsed.series.is_empty());
        assert_eq!(parsed.window.start(), 1425304800);
        assert_eq!(parsed.window.end(), 1425308400);
        assert_eq!(parsed.marks().len(), 2);
    }
}
