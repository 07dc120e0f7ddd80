//! AWS provider, driven through the `aws` command line client
//!
//! The shared filesystem servers run in their own CloudFormation stack.
//! The stack is found from the private IP of the filesystem's management
//! server, which is what `df` shows as the mount's device (`10.0.9.9@tcp`).

use super::{CloudProvider, Flavor, InstanceInfo, StackDirectory};
use crate::collector::{Collector, HarvestSummary};
use crate::config::{AwsConfig, HarvestConfig};
use crate::error::{HarvestError, Result};
use crate::session::Connector;
use crate::topology::ClusterTopology;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

const STACK_TAG: &str = "aws:cloudformation:stack-name";

const FLAVORS: &[(&str, Flavor)] = &[
    ("m3.medium", Flavor::new(1, 3840)),
    ("m3.large", Flavor::new(2, 7680)),
    ("m3.xlarge", Flavor::new(4, 15360)),
    ("m3.2xlarge", Flavor::new(8, 30720)),
    ("c3.large", Flavor::new(2, 3840)),
    ("c3.xlarge", Flavor::new(4, 7680)),
    ("c3.2xlarge", Flavor::new(8, 15360)),
    ("c3.4xlarge", Flavor::new(16, 30720)),
    ("c3.8xlarge", Flavor::new(32, 61440)),
    ("r3.large", Flavor::new(2, 15616)),
    ("r3.xlarge", Flavor::new(4, 31232)),
    ("r3.2xlarge", Flavor::new(8, 62464)),
    ("r3.4xlarge", Flavor::new(16, 124928)),
    ("r3.8xlarge", Flavor::new(32, 249856)),
];

/// Runs `aws ec2 ... --output json` and decodes the answer
#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: String,
    region: Option<String>,
    timeout: Duration,
}

impl AwsCli {
    pub fn new(config: &AwsConfig) -> Self {
        Self {
            binary: config.cli.clone(),
            region: config.region.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub async fn ec2<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let mut cmd = AsyncCommand::new(&self.binary);
        cmd.arg("ec2").args(args).args(["--output", "json"]);
        if let Some(region) = &self.region {
            cmd.args(["--region", region.as_str()]);
        }
        debug!("Running {} ec2 {}", self.binary, args.join(" "));

        let output = tokio::time::timeout(
            self.timeout,
            cmd.stdin(Stdio::null()).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| HarvestError::provider_api("aws", "command timed out"))?
        .map_err(|e| HarvestError::provider_api("aws", e))?;

        if !output.status.success() {
            return Err(HarvestError::provider_api(
                "aws",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| HarvestError::provider_api("aws", e))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    #[serde(default)]
    instance_type: String,
    state: Option<InstanceState>,
    private_ip_address: Option<String>,
    public_ip_address: Option<String>,
    placement: Option<Placement>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Placement {
    availability_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSecurityGroups {
    #[serde(default)]
    security_groups: Vec<SecurityGroupEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupEntry {
    group_name: String,
}

impl Ec2Instance {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    /// Public address when there is one; servers behind the NAT have none
    fn reachable_ip(&self) -> Option<&str> {
        self.public_ip_address
            .as_deref()
            .or(self.private_ip_address.as_deref())
    }
}

impl DescribeInstances {
    fn instances(&self) -> impl Iterator<Item = &Ec2Instance> {
        self.reservations.iter().flat_map(|r| r.instances.iter())
    }
}

/// `10.0.9.9@tcp` -> `10.0.9.9`
fn device_ip(device: &str) -> &str {
    device.split('@').next().unwrap_or(device)
}

fn stack_of(response: &DescribeInstances) -> Option<String> {
    response
        .instances()
        .find_map(|i| i.tag(STACK_TAG))
        .map(str::to_string)
}

fn stack_hosts(response: &DescribeInstances) -> BTreeMap<String, String> {
    response
        .instances()
        .filter_map(|i| {
            let name = i.tag("Name").unwrap_or(&i.instance_id);
            Some((name.to_string(), i.reachable_ip()?.to_string()))
        })
        .collect()
}

/// Instances whose private or public address belongs to a cluster node
fn cluster_instances(
    response: &DescribeInstances,
    topology: &ClusterTopology,
) -> Vec<InstanceInfo> {
    let nodes: BTreeMap<&str, &str> = topology
        .available_nodes()
        .filter_map(|n| Some((n.address()?, n.name.as_str())))
        .collect();

    response
        .instances()
        .filter_map(|i| {
            let node = [&i.private_ip_address, &i.public_ip_address]
                .into_iter()
                .flatten()
                .find_map(|ip| nodes.get(ip.as_str()).copied())?;
            Some(InstanceInfo {
                name: i.tag("Name").unwrap_or(node).to_string(),
                instance_type: i.instance_type.clone(),
                state: i.state.as_ref().map(|s| s.name.clone()).unwrap_or_default(),
                ip: i.reachable_ip().map(str::to_string),
                placement: i.placement.as_ref().and_then(|p| p.availability_zone.clone()),
            })
        })
        .collect()
}

/// CloudFormation stacks, looked up through EC2 instance tags
#[derive(Debug, Clone)]
pub struct AwsStackDirectory {
    cli: AwsCli,
}

impl AwsStackDirectory {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl StackDirectory for AwsStackDirectory {
    async fn stack_name(&self, device: &str) -> Result<Option<String>> {
        let filter = format!("Name=private-ip-address,Values={}", device_ip(device));
        let response: DescribeInstances = self
            .cli
            .ec2(&["describe-instances", "--filters", &filter])
            .await?;
        Ok(stack_of(&response))
    }

    async fn instances(&self, stack: &str) -> Result<BTreeMap<String, String>> {
        let by_stack = format!("Name=tag:{STACK_TAG},Values={stack}");
        let response: DescribeInstances = self
            .cli
            .ec2(&[
                "describe-instances",
                "--filters",
                &by_stack,
                "Name=instance-state-name,Values=running",
            ])
            .await?;
        Ok(stack_hosts(&response))
    }
}

pub struct AwsProvider {
    cli: AwsCli,
    stacks: AwsStackDirectory,
}

impl AwsProvider {
    pub fn new(config: &HarvestConfig) -> Self {
        let cli = AwsCli::new(&config.aws);
        Self {
            stacks: AwsStackDirectory::new(cli.clone()),
            cli,
        }
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn flavors(&self) -> &'static [(&'static str, Flavor)] {
        FLAVORS
    }

    async fn security_groups(&self, _topology: &ClusterTopology) -> Result<BTreeSet<String>> {
        let response: DescribeSecurityGroups = self.cli.ec2(&["describe-security-groups"]).await?;
        Ok(response
            .security_groups
            .into_iter()
            .map(|g| g.group_name)
            .collect())
    }

    async fn instances(&self, topology: &ClusterTopology) -> Result<Vec<InstanceInfo>> {
        let response: DescribeInstances = self
            .cli
            .ec2(&[
                "describe-instances",
                "--filters",
                "Name=instance-state-name,Values=running",
            ])
            .await?;
        Ok(cluster_instances(&response, topology))
    }

    async fn collect_data(
        &self,
        topology: &ClusterTopology,
        config: &HarvestConfig,
        connector: &dyn Connector,
    ) -> Result<HarvestSummary> {
        Collector::new(topology, connector, config)
            .with_stack_directory(&self.stacks)
            .run()
            .await
    }
}
