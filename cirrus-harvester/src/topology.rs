//! Cluster topology snapshot
//!
//! The orchestrator writes one YAML inventory per cluster. The engine reads
//! it once at harvest start and never mutates it.
//!
//! ```yaml
//! name: bcbio
//! known_hosts_file: ~/.cirrus/storage/bcbio.known_hosts
//! nodes:
//!   - { name: frontend001, role: frontend, preferred_ip: 54.1.2.3,
//!       image_user: ubuntu, user_key_private: ~/.ssh/bcbio_rsa }
//!   - { name: compute001, role: compute, preferred_ip: 10.0.1.17,
//!       image_user: ubuntu, user_key_private: ~/.ssh/bcbio_rsa }
//! config:
//!   cluster: { security_group: bcbio }
//!   nodes:
//!     frontend: { flavor: m3.large, encrypted_volume_size: 200 }
//!     compute: { flavor: m3.2xlarge, compute_nodes: 2 }
//! ```

use crate::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub name: String,
    pub known_hosts_file: PathBuf,
    /// Inventory order is kept; the first reachable node answers the
    /// shared filesystem query
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub config: ClusterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub role: String,
    pub preferred_ip: Option<String>,
    pub image_user: String,
    pub user_key_private: PathBuf,
}

/// Cluster definition as configured, used by the topology report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub cloud: CloudSettings,
    pub cluster: ClusterSection,
    pub nodes: NodeSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub provider: Option<String>,
    pub region: Option<String>,
    pub subscription_id: Option<String>,
    pub certificate: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub security_group: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub frontend: FrontendSettings,
    pub compute: ComputeSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendSettings {
    pub flavor: Option<String>,
    /// NFS volume size in GB
    pub encrypted_volume_size: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeSettings {
    pub flavor: Option<String>,
    pub compute_nodes: u32,
}

impl ClusterTopology {
    pub async fn load(path: &Path) -> Result<Self> {
        let txt = tokio::fs::read_to_string(path).await.map_err(|e| {
            HarvestError::Configuration(format!(
                "cannot read inventory {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&txt)
    }

    pub fn from_yaml(txt: &str) -> Result<Self> {
        let mut topology: ClusterTopology = serde_yaml::from_str(txt)
            .map_err(|e| HarvestError::Configuration(format!("invalid inventory: {e}")))?;

        topology.known_hosts_file = expand_home(&topology.known_hosts_file);
        for node in &mut topology.nodes {
            node.user_key_private = expand_home(&node.user_key_private);
        }
        Ok(topology)
    }

    /// Nodes that currently expose an address
    pub fn available_nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.iter().filter(|n| n.address().is_some())
    }

    /// Distinct private keys across every role
    pub fn private_keys(&self) -> BTreeSet<PathBuf> {
        self.nodes
            .iter()
            .map(|n| n.user_key_private.clone())
            .collect()
    }

    pub fn nodes_with_role<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a NodeDescriptor> {
        self.nodes.iter().filter(move |n| n.role == role)
    }
}

impl NodeDescriptor {
    pub fn address(&self) -> Option<&str> {
        self.preferred_ip.as_deref().filter(|ip| !ip.trim().is_empty())
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
name: bcbio
known_hosts_file: /tmp/bcbio.known_hosts
nodes:
  - { name: frontend001, role: frontend, preferred_ip: 54.1.2.3, image_user: ubuntu, user_key_private: /keys/a }
  - { name: compute001, role: compute, preferred_ip: 10.0.1.17, image_user: ubuntu, user_key_private: /keys/a }
  - { name: compute002, role: compute, preferred_ip: "", image_user: ubuntu, user_key_private: /keys/b }
config:
  cluster: { security_group: bcbio }
  nodes:
    frontend: { flavor: m3.large, encrypted_volume_size: 200 }
    compute: { flavor: m3.2xlarge, compute_nodes: 2 }
"#;

    #[test]
    fn test_inventory_parsing() {
        let topology = ClusterTopology::from_yaml(INVENTORY).unwrap();
        assert_eq!(topology.name, "bcbio");
        assert_eq!(topology.nodes.len(), 3);
        assert_eq!(topology.nodes[0].name, "frontend001");
        assert_eq!(topology.config.nodes.compute.compute_nodes, 2);
        assert_eq!(topology.config.cluster.security_group.as_deref(), Some("bcbio"));
        assert_eq!(topology.nodes_with_role("compute").count(), 2);
    }

    #[test]
    fn test_blank_address_is_unavailable() {
        let topology = ClusterTopology::from_yaml(INVENTORY).unwrap();
        let available: Vec<_> = topology.available_nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(available, vec!["frontend001", "compute001"]);
    }

    #[test]
    fn test_private_keys_are_distinct() {
        let topology = ClusterTopology::from_yaml(INVENTORY).unwrap();
        let keys = topology.private_keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(Path::new("/keys/a")));
    }

    #[test]
    fn test_malformed_inventory() {
        let err = ClusterTopology::from_yaml("nodes: [").unwrap_err();
        assert!(matches!(err, HarvestError::Configuration(_)));
    }
}
