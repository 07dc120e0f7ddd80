//! Live topology sections

use super::{Field, ReportBuilder};
use crate::provider::{Flavor, InstanceInfo};
use crate::topology::ClusterSettings;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::info;

/// "cluster": frontend and compute setup, sized from the flavor table
pub fn add_cluster_info(
    builder: &mut ReportBuilder,
    settings: &ClusterSettings,
    flavor: impl Fn(&str) -> Option<Flavor>,
) {
    let frontend = &settings.nodes.frontend;
    let compute = &settings.nodes.compute;

    let mut frontend_value = Map::new();
    frontend_value.insert("flavor".into(), json!(frontend.flavor));
    frontend_value.insert("NFS storage".into(), json!(frontend.encrypted_volume_size));
    annotate(&mut frontend_value, frontend.flavor.as_deref(), &flavor);

    let mut compute_value = Map::new();
    compute_value.insert("count".into(), json!(compute.compute_nodes));
    compute_value.insert("flavor".into(), json!(compute.flavor));
    annotate(&mut compute_value, compute.flavor.as_deref(), &flavor);

    builder
        .add_section(
            "cluster",
            "Cluster configuration",
            Some("Provide high level details about the setup of the current cluster."),
            vec![Field::new("name"), Field::new("value")],
        )
        .add_item(vec![json!("Frontend node"), Value::Object(frontend_value)])
        .add_item(vec![json!("Compute nodes"), Value::Object(compute_value)]);
}

fn annotate(
    value: &mut Map<String, Value>,
    machine: Option<&str>,
    flavor: &impl Fn(&str) -> Option<Flavor>,
) {
    if let Some(size) = machine.and_then(flavor) {
        value.insert("cpus".into(), json!(size.cpus));
        value.insert("memory_mb".into(), json!(size.memory_mb));
    }
}

/// "sg": the live security groups, checked against the configured one
pub fn add_security_groups_info(
    builder: &mut ReportBuilder,
    expected: Option<&str>,
    groups: &BTreeSet<String>,
) {
    builder
        .add_section("sg", "Security groups", None, Vec::new())
        .add_field("sg", "Security Group");

    if groups.is_empty() {
        builder.warn("No security groups defined.");
        return;
    }

    match expected {
        Some(name) if groups.contains(name) => {
            info!("Expected security group {} exists.", name)
        }
        Some(name) => builder.warn(format!("Security group {name} does not exist.")),
        None => builder.warn("No security group configured for the cluster."),
    }

    builder.add_items("sg", groups.iter().map(|g| vec![json!(g)]));
}

/// "instance": one row per live node
pub fn add_instance_info(builder: &mut ReportBuilder, instances: &[InstanceInfo]) {
    let section = builder
        .add_section("instance", "Instances from current cluster", None, Vec::new())
        .add_field("name", "Name")
        .add_field("type", "Type")
        .add_field("state", "State")
        .add_field("ip", "IP Address")
        .add_field("placement", "Placement");

    section.add_items(instances.iter().map(|i| {
        vec![
            json!(i.name),
            json!(i.instance_type),
            json!(i.state),
            json!(i.ip),
            json!(i.placement),
        ]
    }));
}
