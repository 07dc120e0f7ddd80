//! Telemetry collection
//!
//! One pass over the fleet:
//! 1. every private key of the inventory goes into one agent scope
//! 2. each node with an address is synced into the cache directory
//! 3. the shared filesystem servers are synced through the NAT bastion
//!
//! A file is fetched only when it is missing locally or its truncated
//! mtime or size differs from the remote one, so rerunning a pass costs
//! one `stat` per node and nothing else.

use crate::config::{CollectConfig, HarvestConfig, SharedFsConfig};
use crate::error::Result;
use crate::provider::StackDirectory;
use crate::session::{Connector, RemoteFileDescriptor, RemoteSession, SessionTarget};
use crate::topology::ClusterTopology;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Per-host outcome of a pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestSummary {
    pub run_id: String,
    pub keys_loaded: usize,
    pub hosts: BTreeMap<String, HostSummary>,
    /// Why the shared filesystem pass did not run, if it did not
    pub shared_fs_skipped: Option<String>,
}

impl HarvestSummary {
    pub fn downloaded(&self) -> usize {
        self.hosts.values().map(|h| h.downloaded).sum()
    }

    pub fn skipped(&self) -> usize {
        self.hosts.values().map(|h| h.skipped).sum()
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|(_, h)| h.error.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Counts are kept even when the host failed part way
    fn record(&mut self, label: String, host: HostSummary, outcome: Result<()>) {
        let entry = self.hosts.entry(label).or_default();
        entry.downloaded += host.downloaded;
        entry.skipped += host.skipped;
        if let Err(e) = outcome {
            entry.error = Some(e.to_string());
        }
    }
}

/// Whether the cached copy at `local` is stale against `remote`
pub async fn needs_download(local: &Path, remote: &RemoteFileDescriptor) -> bool {
    let metadata = match tokio::fs::metadata(local).await {
        Ok(metadata) => metadata,
        Err(_) => return true,
    };

    let local_mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);

    local_mtime != Some(remote.modified_time) || metadata.len() != remote.size_bytes
}

/// Backing device of a shared mount from `df -P` output: first column of
/// the first data row, up to the `:`
pub fn parse_df_device(stdout: &str) -> Option<String> {
    let row = stdout.lines().skip(1).find(|l| !l.trim().is_empty())?;
    let column = row.split_whitespace().next()?;
    let device = column.split(':').next()?;
    (!device.is_empty()).then(|| device.to_string())
}

pub struct Collector<'a> {
    topology: &'a ClusterTopology,
    connector: &'a dyn Connector,
    stacks: Option<&'a dyn StackDirectory>,
    harvest: CollectConfig,
    shared_fs: SharedFsConfig,
}

impl<'a> Collector<'a> {
    pub fn new(
        topology: &'a ClusterTopology,
        connector: &'a dyn Connector,
        config: &HarvestConfig,
    ) -> Self {
        Self {
            topology,
            connector,
            stacks: None,
            harvest: config.harvest.clone(),
            shared_fs: config.shared_fs.clone(),
        }
    }

    /// Enables the shared filesystem pass
    pub fn with_stack_directory(mut self, stacks: &'a dyn StackDirectory) -> Self {
        self.stacks = Some(stacks);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.harvest.cache_dir
    }

    pub async fn run(&self) -> Result<HarvestSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest", run_id = %run_id, cluster = %self.topology.name);
        self.run_pass(run_id).instrument(span).await
    }

    async fn run_pass(&self, run_id: Uuid) -> Result<HarvestSummary> {
        tokio::fs::create_dir_all(self.cache_dir()).await?;

        let keys = self.topology.private_keys();
        let scope = self.connector.load_keys(&keys).await?;
        let mut summary = HarvestSummary {
            run_id: run_id.to_string(),
            keys_loaded: scope.loaded(),
            ..Default::default()
        };

        let targets: Vec<(String, SessionTarget)> = self
            .topology
            .available_nodes()
            .filter_map(|node| {
                let address = node.address()?;
                Some((node.name.clone(), self.target(address, &node.image_user)))
            })
            .collect();
        info!("Collecting from {} node(s)", targets.len());
        self.collect_all(targets, &mut summary).await;

        match self.shared_fs_targets().await {
            Ok(targets) => {
                info!("Collecting from {} shared filesystem server(s)", targets.len());
                self.collect_all(targets, &mut summary).await;
            }
            Err(reason) => {
                info!("Skipping shared filesystem pass: {}", reason);
                summary.shared_fs_skipped = Some(reason);
            }
        }

        drop(scope);
        info!(
            "Harvest done: {} downloaded, {} up to date, {} host(s) failed",
            summary.downloaded(),
            summary.skipped(),
            summary.failed_hosts().len()
        );
        Ok(summary)
    }

    fn target(&self, host: &str, user: &str) -> SessionTarget {
        SessionTarget::new(host, user, &self.topology.known_hosts_file)
            .with_port(self.harvest.ssh_port)
    }

    async fn collect_all(&self, targets: Vec<(String, SessionTarget)>, summary: &mut HarvestSummary) {
        let outcomes: Vec<(String, HostSummary, Result<()>)> = stream::iter(targets)
            .map(|(label, target)| async move {
                let mut host = HostSummary::default();
                let outcome = self.collect(&target, &mut host).await;
                if let Err(e) = &outcome {
                    error!(
                        "Collection from {} failed after {} download(s): {}",
                        label, host.downloaded, e
                    );
                }
                (label, host, outcome)
            })
            .buffer_unordered(self.harvest.max_sessions.max(1))
            .collect()
            .await;

        for (label, host, outcome) in outcomes {
            summary.record(label, host, outcome);
        }
    }

    /// Sync one host; the session is closed whatever the outcome
    async fn collect(&self, target: &SessionTarget, host: &mut HostSummary) -> Result<()> {
        let mut session = self.connector.connect(target).await?;
        let outcome = self.sync(session.as_mut(), host).await;
        session.close().await;
        outcome
    }

    /// Files already fetched stay counted in `host` when a later one fails
    async fn sync(&self, session: &mut dyn RemoteSession, host: &mut HostSummary) -> Result<()> {
        for remote in session.stat(&self.harvest.remote_glob).await? {
            let Some(name) = remote.file_name().map(str::to_string) else {
                continue;
            };
            let local = self.cache_dir().join(&name);

            if !needs_download(&local, &remote).await {
                debug!("{} is up to date", name);
                host.skipped += 1;
                continue;
            }

            session.download(&remote, &local).await?;
            info!("Downloaded {} from {}", name, session.host());
            host.downloaded += 1;
        }

        Ok(())
    }

    /// Resolve the shared filesystem servers, or say why not
    async fn shared_fs_targets(&self) -> std::result::Result<Vec<(String, SessionTarget)>, String> {
        if !self.shared_fs.enabled {
            return Err("disabled".to_string());
        }
        let stacks = self.stacks.ok_or("no stack directory for this provider")?;

        let device = self.management_target().await?;
        let stack = match stacks.stack_name(&device).await {
            Ok(Some(stack)) => stack,
            Ok(None) => return Err(format!("no stack owns {device}")),
            Err(e) => return Err(e.to_string()),
        };

        let instances = stacks.instances(&stack).await.map_err(|e| e.to_string())?;
        let nat = instances
            .get(&self.shared_fs.nat_device)
            .ok_or_else(|| format!("stack {} has no {}", stack, self.shared_fs.nat_device))?;

        Ok(instances
            .iter()
            .filter(|(name, _)| **name != self.shared_fs.nat_device)
            .map(|(name, address)| {
                let target = self
                    .target(address, &self.shared_fs.bastion_user)
                    .through(nat.clone());
                (name.clone(), target)
            })
            .collect())
    }

    /// Device backing the shared mount, asked of the first available node
    async fn management_target(&self) -> std::result::Result<String, String> {
        let node = self
            .topology
            .available_nodes()
            .next()
            .ok_or("no node has an address")?;
        let address = node.address().unwrap_or_default();

        let mut session = self
            .connector
            .connect(&self.target(address, &node.image_user))
            .await
            .map_err(|e| e.to_string())?;
        let command = format!(
            "df -P -t {} {}",
            shell_words::quote(&self.shared_fs.fs_type),
            shell_words::quote(&self.shared_fs.mount)
        );
        let output = session.execute(&command).await;
        session.close().await;

        let output = output.map_err(|e| e.to_string())?;
        if !output.success() {
            warn!("{} on {} exited with {:?}", command, node.name, output.exit_code);
        }
        parse_df_device(&output.stdout).ok_or_else(|| {
            format!(
                "{} is not a {} mount",
                self.shared_fs.mount, self.shared_fs.fs_type
            )
        })
    }
}
