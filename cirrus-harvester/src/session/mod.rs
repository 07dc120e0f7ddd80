//! Remote access sessions
//!
//! One session is one logical connection to a cluster node, optionally
//! tunnelled through a bastion. Sessions expose three primitives:
//! - `stat`: typed descriptors for the files matching a remote glob
//! - `download`: byte-exact copy with the remote atime/mtime applied locally
//! - `execute`: best-effort command whose failure is an explicit `Result`
//!
//! Host keys: direct sessions reject unknown hosts, bastion-routed sessions
//! accept them. The bastion has already authenticated the private network
//! path, so this asymmetry must stay as is.

pub mod agent;
mod openssh;

pub use agent::{KeyScope, SshAgent};
pub use openssh::{OpenSshConnector, SshOptions};

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{File, FileTimes};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `stat -c` format matching [`RemoteFileDescriptor::parse_stat_line`]
pub const STAT_FORMAT: &str = "%s %X %Y %n";

/// One remote file as reported by `stat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFileDescriptor {
    pub path: String,
    pub size_bytes: u64,
    pub access_time: i64,
    pub modified_time: i64,
}

/// Captured output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Unknown hosts fail the handshake
    Reject,
    /// Unknown hosts are trusted on first use
    AcceptNew,
}

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub bastion: Option<String>,
    pub known_hosts: PathBuf,
}

#[async_trait]
pub trait RemoteSession: Send {
    fn host(&self) -> &str;

    /// List files matching `pattern`; lines that do not parse are dropped
    async fn stat(&mut self, pattern: &str) -> Result<Vec<RemoteFileDescriptor>>;

    async fn download(&mut self, remote: &RemoteFileDescriptor, local: &Path) -> Result<()>;

    async fn execute(&mut self, command: &str) -> Result<CommandOutput>;

    /// Release the transport. Calling it twice is a no-op.
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Load every key into one agent for as long as the scope lives
    async fn load_keys(&self, keys: &BTreeSet<PathBuf>) -> Result<KeyScope>;

    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>>;
}

impl HostKeyPolicy {
    pub fn for_route(bastion: Option<&str>) -> Self {
        match bastion {
            Some(_) => HostKeyPolicy::AcceptNew,
            None => HostKeyPolicy::Reject,
        }
    }

    /// Value for OpenSSH's `StrictHostKeyChecking`
    pub fn as_ssh_option(&self) -> &'static str {
        match self {
            HostKeyPolicy::Reject => "yes",
            HostKeyPolicy::AcceptNew => "accept-new",
        }
    }
}

impl SessionTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 22,
            bastion: None,
            known_hosts: known_hosts.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn through(mut self, bastion: impl Into<String>) -> Self {
        self.bastion = Some(bastion.into());
        self
    }

    pub fn host_key_policy(&self) -> HostKeyPolicy {
        HostKeyPolicy::for_route(self.bastion.as_deref())
    }
}

impl RemoteFileDescriptor {
    /// Parse one `%s %X %Y %n` line: size, atime, mtime, then the path,
    /// which may itself contain spaces
    pub fn parse_stat_line(line: &str) -> Option<Self> {
        let mut parts = line.trim_end_matches(['\r', '\n']).splitn(4, ' ');
        let size_bytes = parts.next()?.parse().ok()?;
        let access_time = parts.next()?.parse().ok()?;
        let modified_time = parts.next()?.parse().ok()?;
        let path = parts.next()?;
        if path.is_empty() {
            return None;
        }

        Some(Self {
            path: path.to_string(),
            size_bytes,
            access_time,
            modified_time,
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        Path::new(&self.path).file_name().and_then(|n| n.to_str())
    }
}

pub fn parse_stat_output(stdout: &str) -> Vec<RemoteFileDescriptor> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let parsed = RemoteFileDescriptor::parse_stat_line(line);
            if parsed.is_none() {
                tracing::debug!("Skipping malformed stat line: {:?}", line);
            }
            parsed
        })
        .collect()
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Stamp `path` with the remote access and modification times so the next
/// diff check compares equal
pub fn set_file_times(path: &Path, access_time: i64, modified_time: i64) -> std::io::Result<()> {
    let file = File::options().write(true).open(path)?;
    let times = FileTimes::new()
        .set_accessed(epoch_seconds(access_time))
        .set_modified(epoch_seconds(modified_time));
    file.set_times(times)
}

fn epoch_seconds(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}
