/*!
In-memory fleet for developing without SSH

Every host is a map of remote paths to bytes and stat times. Connections,
downloads, closes and key-scope releases are recorded for assertions.
Captures can be replaced between passes to simulate collectl rotating or
growing its current file.
*/

use async_trait::async_trait;
use cirrus_harvester::error::{HarvestError, Result};
use cirrus_harvester::provider::StackDirectory;
use cirrus_harvester::session::{
    set_file_times, CommandOutput, Connector, KeyScope, RemoteFileDescriptor, RemoteSession,
    SessionTarget,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct RemoteFile {
    bytes: Vec<u8>,
    access_time: i64,
    modified_time: i64,
}

#[derive(Debug, Default)]
struct FleetState {
    hosts: HashMap<String, BTreeMap<String, RemoteFile>>,
    unreachable: BTreeSet<String>,
    df_output: Option<String>,
    commands: Vec<(String, String)>,
    connections: Vec<(String, Option<String>)>,
    downloads: Vec<(String, String)>,
    closed: usize,
    keys_released: usize,
}

/// Fleet stub implementing [`Connector`]
#[derive(Clone, Default)]
pub struct MockFleet {
    state: Arc<Mutex<FleetState>>,
}

impl MockFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place (or replace) a file on `host`
    pub fn put_file(&self, host: &str, path: &str, bytes: Vec<u8>, modified_time: i64) {
        self.state.lock().hosts.entry(host.to_string()).or_default().insert(
            path.to_string(),
            RemoteFile {
                bytes,
                access_time: modified_time,
                modified_time,
            },
        );
        tracing::debug!("[MOCK] {}:{} placed", host, path);
    }

    /// Refuse every connection to `host`
    pub fn set_unreachable(&self, host: &str) {
        self.state.lock().unreachable.insert(host.to_string());
    }

    pub fn set_reachable(&self, host: &str) {
        self.state.lock().unreachable.remove(host);
    }

    /// Output returned for `df` commands; `None` makes them fail
    pub fn set_df_output(&self, output: Option<&str>) {
        self.state.lock().df_output = output.map(str::to_string);
    }

    /// (host, bastion) of every connection attempt, in order
    pub fn connections(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().connections.clone()
    }

    /// (host, remote path) of every completed download
    pub fn downloads(&self) -> Vec<(String, String)> {
        self.state.lock().downloads.clone()
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.state.lock().commands.clone()
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.lock().closed
    }

    pub fn keys_released(&self) -> usize {
        self.state.lock().keys_released
    }

    pub fn clear_records(&self) {
        let mut state = self.state.lock();
        state.commands.clear();
        state.connections.clear();
        state.downloads.clear();
        state.closed = 0;
    }
}

#[async_trait]
impl Connector for MockFleet {
    async fn load_keys(&self, keys: &BTreeSet<PathBuf>) -> Result<KeyScope> {
        let state = self.state.clone();
        Ok(KeyScope::new(keys.len(), move || {
            state.lock().keys_released += 1;
        }))
    }

    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        let mut state = self.state.lock();
        state
            .connections
            .push((target.host.clone(), target.bastion.clone()));
        if state.unreachable.contains(&target.host) {
            return Err(HarvestError::connectivity(&target.host, "Connection refused"));
        }

        Ok(Box::new(MockSession {
            host: target.host.clone(),
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct MockSession {
    host: String,
    state: Arc<Mutex<FleetState>>,
    closed: bool,
}

impl MockSession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(HarvestError::connectivity(&self.host, "session closed"));
        }
        Ok(())
    }
}

/// `*` matches anything but `/`, every other byte literally
fn glob_matches(pattern: &str, path: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == path,
        Some((prefix, rest)) => {
            let Some(tail) = path.strip_prefix(prefix) else {
                return false;
            };
            (0..=tail.len())
                .filter(|&i| tail.is_char_boundary(i))
                .take_while(|&i| !tail[..i].contains('/'))
                .any(|i| glob_matches(rest, &tail[i..]))
        }
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn stat(&mut self, pattern: &str) -> Result<Vec<RemoteFileDescriptor>> {
        self.ensure_open()?;
        let state = self.state.lock();
        let files = state.hosts.get(&self.host).cloned().unwrap_or_default();

        Ok(files
            .into_iter()
            .filter(|(path, _)| glob_matches(pattern, path))
            .map(|(path, file)| RemoteFileDescriptor {
                path,
                size_bytes: file.bytes.len() as u64,
                access_time: file.access_time,
                modified_time: file.modified_time,
            })
            .collect())
    }

    async fn download(&mut self, remote: &RemoteFileDescriptor, local: &Path) -> Result<()> {
        self.ensure_open()?;
        let file = self
            .state
            .lock()
            .hosts
            .get(&self.host)
            .and_then(|files| files.get(&remote.path))
            .cloned()
            .ok_or_else(|| HarvestError::connectivity(&self.host, "file vanished"))?;

        tokio::fs::write(local, &file.bytes).await?;
        set_file_times(local, file.access_time, file.modified_time)?;
        self.state
            .lock()
            .downloads
            .push((self.host.clone(), remote.path.clone()));
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.commands.push((self.host.clone(), command.to_string()));

        let df = command
            .starts_with("df ")
            .then(|| state.df_output.clone())
            .flatten();
        Ok(match df {
            Some(stdout) => CommandOutput {
                stdout,
                exit_code: Some(0),
                ..Default::default()
            },
            None => CommandOutput {
                stderr: format!("{command}: not available"),
                exit_code: Some(1),
                ..Default::default()
            },
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().closed += 1;
        }
    }
}

/// Stack directory stub: one stack serving one device
#[derive(Debug, Clone, Default)]
pub struct MockStacks {
    device: String,
    stack: String,
    instances: BTreeMap<String, String>,
}

impl MockStacks {
    pub fn new(device: &str, stack: &str) -> Self {
        Self {
            device: device.to_string(),
            stack: stack.to_string(),
            instances: BTreeMap::new(),
        }
    }

    pub fn with_instance(mut self, name: &str, address: &str) -> Self {
        self.instances.insert(name.to_string(), address.to_string());
        self
    }
}

#[async_trait]
impl StackDirectory for MockStacks {
    async fn stack_name(&self, device: &str) -> Result<Option<String>> {
        Ok((device == self.device).then(|| self.stack.clone()))
    }

    async fn instances(&self, stack: &str) -> Result<BTreeMap<String, String>> {
        if stack != self.stack {
            return Ok(BTreeMap::new());
        }
        Ok(self.instances.clone())
    }
}
