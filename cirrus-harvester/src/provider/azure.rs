//! Azure provider over the Service Management API
//!
//! The API speaks XML over HTTPS and authenticates with a management
//! certificate. Telemetry collection is not available for Azure clusters;
//! captures copied in by other means can still be parsed.

use super::{CloudProvider, Flavor, InstanceInfo};
use crate::collector::HarvestSummary;
use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::session::Connector;
use crate::topology::ClusterTopology;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Identity, StatusCode};
use roxmltree::{Document, Node};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

const MANAGEMENT_HOST: &str = "https://management.core.windows.net";
const API_VERSION: &str = "2014-10-01";
const NAMESPACE: &str = "http://schemas.microsoft.com/windowsazure";

const FLAVORS: &[(&str, Flavor)] = &[
    ("ExtraSmall", Flavor::new(1, 768)),
    ("Small", Flavor::new(1, 1792)),
    ("Medium", Flavor::new(2, 3584)),
    ("Large", Flavor::new(4, 7168)),
    ("ExtraLarge", Flavor::new(8, 14336)),
    // General purpose
    ("A0", Flavor::new(1, 768)),
    ("A1", Flavor::new(1, 1792)),
    ("A2", Flavor::new(2, 3584)),
    ("A3", Flavor::new(4, 7168)),
    ("A4", Flavor::new(8, 14336)),
    // Memory intensive
    ("A5", Flavor::new(2, 14336)),
    ("A6", Flavor::new(4, 28672)),
    ("A7", Flavor::new(8, 57344)),
    // Network optimized
    ("A8", Flavor::new(8, 57344)),
    ("A9", Flavor::new(16, 114688)),
    // Compute intensive
    ("A10", Flavor::new(8, 57344)),
    ("A11", Flavor::new(16, 114688)),
    // Optimized compute
    ("D1", Flavor::new(1, 3584)),
    ("D2", Flavor::new(2, 7168)),
    ("D3", Flavor::new(4, 14336)),
    ("D4", Flavor::new(8, 28672)),
    ("D11", Flavor::new(2, 14336)),
    ("D12", Flavor::new(4, 28672)),
    ("D13", Flavor::new(8, 57344)),
    ("D14", Flavor::new(16, 114688)),
];

/// Client for one subscription
#[derive(Debug, Clone)]
pub struct AzureApi {
    client: Client,
    base: String,
}

impl AzureApi {
    /// `certificate` is a PEM bundle with the certificate and its key
    pub fn new(subscription_id: &str, certificate: &Path) -> Result<Self> {
        let pem = std::fs::read(certificate).map_err(|e| {
            HarvestError::Configuration(format!(
                "cannot read management certificate {}: {}",
                certificate.display(),
                e
            ))
        })?;
        let identity = Identity::from_pem(&pem).map_err(|e| {
            HarvestError::Configuration(format!("invalid management certificate: {e}"))
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));

        let client = Client::builder()
            .identity(identity)
            .default_headers(headers)
            .build()
            .map_err(|e| HarvestError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base: format!("{MANAGEMENT_HOST}/{subscription_id}"),
        })
    }

    async fn get(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", self.base, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HarvestError::provider_api("azure", e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(HarvestError::provider_api(
                "azure",
                format!("{path} answered {status}"),
            ));
        }
        response
            .text()
            .await
            .map_err(|e| HarvestError::provider_api("azure", e))
    }

    /// Names of the cloud services in the subscription
    pub async fn cloud_services(&self) -> Result<BTreeSet<String>> {
        let xml = self.get("services/hostedservices").await?;
        child_texts(&xml, "HostedService", "ServiceName")
    }

    /// Names of the network security groups in the subscription
    pub async fn security_groups(&self) -> Result<BTreeSet<String>> {
        let xml = self.get("services/networking/networksecuritygroups").await?;
        child_texts(&xml, "NetworkSecurityGroup", "Name")
    }

    /// Role instances of the production deployment of `service`
    pub async fn role_instances(&self, service: &str) -> Result<Vec<InstanceInfo>> {
        let xml = self
            .get(&format!("services/hostedservices/{service}/deploymentslots/production"))
            .await?;
        role_instances(&xml, service)
    }
}

fn tag<'a>(name: &'a str) -> (&'static str, &'a str) {
    (NAMESPACE, name)
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .find(|c| c.has_tag_name(tag(name)))
        .and_then(|c| c.text())
        .map(str::to_string)
}

fn parse(xml: &str) -> Result<Document<'_>> {
    Document::parse(xml).map_err(|e| HarvestError::provider_api("azure", e))
}

/// Text of `<child>` under each top-level `<element>`
fn child_texts(xml: &str, element: &str, child: &str) -> Result<BTreeSet<String>> {
    let doc = parse(xml)?;
    Ok(doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name(tag(element)))
        .filter_map(|n| child_text(n, child))
        .collect())
}

fn role_instances(xml: &str, service: &str) -> Result<Vec<InstanceInfo>> {
    let doc = parse(xml)?;
    Ok(doc
        .descendants()
        .filter(|n| n.has_tag_name(tag("RoleInstance")))
        .map(|n| InstanceInfo {
            name: child_text(n, "InstanceName")
                .or_else(|| child_text(n, "RoleName"))
                .unwrap_or_default(),
            instance_type: child_text(n, "InstanceSize").unwrap_or_default(),
            state: child_text(n, "InstanceStatus").unwrap_or_default(),
            ip: child_text(n, "IpAddress"),
            placement: Some(service.to_string()),
        })
        .collect())
}

/// Role instances named after a cluster node or holding one of its addresses
fn cluster_instances(found: Vec<InstanceInfo>, topology: &ClusterTopology) -> Vec<InstanceInfo> {
    let names: BTreeSet<&str> = topology.nodes.iter().map(|n| n.name.as_str()).collect();
    let addresses: BTreeSet<&str> = topology.available_nodes().filter_map(|n| n.address()).collect();

    found
        .into_iter()
        .filter(|i| {
            names.contains(i.name.as_str())
                || i.ip.as_deref().is_some_and(|ip| addresses.contains(ip))
        })
        .collect()
}

pub struct AzureProvider {
    api: Option<AzureApi>,
}

impl AzureProvider {
    /// Credentials are optional here; without them every API call fails
    /// with `ProviderApi` unless the inventory carries its own
    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        let api = match (&config.azure.subscription_id, &config.azure.certificate) {
            (Some(subscription), Some(certificate)) => {
                Some(AzureApi::new(subscription, certificate)?)
            }
            _ => None,
        };
        Ok(Self { api })
    }

    /// Configured client, else one built from the inventory's cloud settings
    fn api(&self, topology: &ClusterTopology) -> Result<AzureApi> {
        if let Some(api) = &self.api {
            return Ok(api.clone());
        }

        let cloud = &topology.config.cloud;
        match (&cloud.subscription_id, &cloud.certificate) {
            (Some(subscription), Some(certificate)) => AzureApi::new(subscription, certificate),
            _ => Err(HarvestError::provider_api(
                "azure",
                "no subscription id and management certificate configured",
            )),
        }
    }
}

#[async_trait]
impl CloudProvider for AzureProvider {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn flavors(&self) -> &'static [(&'static str, Flavor)] {
        FLAVORS
    }

    async fn security_groups(&self, topology: &ClusterTopology) -> Result<BTreeSet<String>> {
        self.api(topology)?.security_groups().await
    }

    async fn instances(&self, topology: &ClusterTopology) -> Result<Vec<InstanceInfo>> {
        let api = self.api(topology)?;
        let mut instances = Vec::new();
        for service in api.cloud_services().await? {
            match api.role_instances(&service).await {
                Ok(found) => instances.extend(found),
                Err(e) => warn!("No instances for {}: {}", service, e),
            }
        }
        let total = instances.len();
        let instances = cluster_instances(instances, topology);
        debug!("{} of {} role instance(s) belong to {}", instances.len(), total, topology.name);
        Ok(instances)
    }

    async fn collect_data(
        &self,
        _topology: &ClusterTopology,
        _config: &HarvestConfig,
        _connector: &dyn Connector,
    ) -> Result<HarvestSummary> {
        Err(HarvestError::NotSupported {
            feature: "collect_data".to_string(),
            context: "Azure provider".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{KeyScope, RemoteSession, SessionTarget};
    use std::path::PathBuf;

    const SERVICES: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<HostedServices xmlns="http://schemas.microsoft.com/windowsazure" xmlns:i="http://www.w3.org/2001/XMLSchema-instance">
  <HostedService><Url>https://x/bcbio</Url><ServiceName>bcbio</ServiceName></HostedService>
  <HostedService><ServiceName>scratch</ServiceName></HostedService>
  <HostedService><Url>https://x/nameless</Url></HostedService>
</HostedServices>"#;

    const DEPLOYMENT: &str = r#"<Deployment xmlns="http://schemas.microsoft.com/windowsazure">
  <Name>bcbio</Name>
  <RoleInstanceList>
    <RoleInstance>
      <RoleName>frontend001</RoleName>
      <InstanceName>frontend001</InstanceName>
      <InstanceStatus>ReadyRole</InstanceStatus>
      <InstanceSize>D3</InstanceSize>
      <IpAddress>10.0.0.4</IpAddress>
    </RoleInstance>
    <RoleInstance>
      <RoleName>compute001</RoleName>
      <InstanceStatus>StoppedVM</InstanceStatus>
      <InstanceSize>A9</InstanceSize>
    </RoleInstance>
  </RoleInstanceList>
</Deployment>"#;

    fn topology() -> ClusterTopology {
        ClusterTopology::from_yaml("name: lab\nknown_hosts_file: /tmp/kh\n").unwrap()
    }

    #[test]
    fn test_cloud_service_names() {
        let names = child_texts(SERVICES, "HostedService", "ServiceName").unwrap();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["bcbio", "scratch"]);
    }

    #[test]
    fn test_elements_outside_namespace_are_ignored() {
        let xml = "<NetworkSecurityGroups><NetworkSecurityGroup><Name>web</Name></NetworkSecurityGroup></NetworkSecurityGroups>";
        assert!(child_texts(xml, "NetworkSecurityGroup", "Name").unwrap().is_empty());
    }

    #[test]
    fn test_unparsable_xml_is_provider_error() {
        let err = child_texts("<HostedServices>", "HostedService", "ServiceName").unwrap_err();
        assert!(matches!(err, HarvestError::ProviderApi { .. }));
    }

    #[test]
    fn test_role_instances() {
        let instances = role_instances(DEPLOYMENT, "bcbio").unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].name, "frontend001");
        assert_eq!(instances[0].instance_type, "D3");
        assert_eq!(instances[0].ip.as_deref(), Some("10.0.0.4"));
        assert_eq!(instances[1].name, "compute001");
        assert_eq!(instances[1].ip, None);
        assert_eq!(instances[1].placement.as_deref(), Some("bcbio"));
    }

    #[test]
    fn test_only_cluster_role_instances_are_kept() {
        let topology = ClusterTopology::from_yaml(
            r#"
name: bcbio
known_hosts_file: /tmp/kh
nodes:
  - { name: frontend001, role: frontend, preferred_ip: 10.0.0.4, image_user: azureuser, user_key_private: /keys/a }
  - { name: compute002, role: compute, preferred_ip: 10.0.0.6, image_user: azureuser, user_key_private: /keys/a }
"#,
        )
        .unwrap();
        let mut found = role_instances(DEPLOYMENT, "bcbio").unwrap();
        found.extend(role_instances(DEPLOYMENT, "scratch").unwrap().into_iter().map(|mut i| {
            i.name = format!("other-{}", i.name);
            i.ip = i.ip.map(|_| "10.0.0.6".to_string());
            i
        }));

        let kept = cluster_instances(found, &topology);
        let names: Vec<_> = kept.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["frontend001", "other-frontend001"]);
        assert_eq!(kept[1].placement.as_deref(), Some("scratch"));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_as_provider_error() {
        let provider = AzureProvider::from_config(&HarvestConfig::default()).unwrap();
        let err = provider.security_groups(&topology()).await.unwrap_err();
        assert!(matches!(err, HarvestError::ProviderApi { .. }));
    }

    #[tokio::test]
    async fn test_report_survives_missing_credentials() {
        let provider = AzureProvider::from_config(&HarvestConfig::default()).unwrap();
        let doc = provider.information(&topology()).await;
        assert!(doc.section("sg").unwrap().items().is_empty());
        assert!(doc.section("instance").unwrap().items().is_empty());
        assert!(!doc.warnings().is_empty());
    }

    struct Offline;

    #[async_trait]
    impl Connector for Offline {
        async fn load_keys(&self, keys: &BTreeSet<PathBuf>) -> Result<KeyScope> {
            Ok(KeyScope::empty(keys.len()))
        }

        async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
            Err(HarvestError::connectivity(&target.host, "offline"))
        }
    }

    #[tokio::test]
    async fn test_collection_is_not_supported() {
        let provider = AzureProvider::from_config(&HarvestConfig::default()).unwrap();
        let err = provider
            .collect_data(&topology(), &HarvestConfig::default(), &Offline)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::NotSupported { .. }));
    }
}
