//! OpenSSH-backed sessions
//!
//! Each session multiplexes its commands over one ControlMaster connection,
//! so `stat`, `download` and `execute` share the handshake done by
//! `connect`. The `ssh` client reports its own failures with exit code 255,
//! which is how transport errors are told apart from remote command errors.

use super::{
    parse_stat_output, set_file_times, CommandOutput, Connector, KeyScope, RemoteFileDescriptor,
    RemoteSession, SessionTarget, SshAgent, STAT_FORMAT,
};
use crate::error::{HarvestError, Result};
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

/// Exit status `ssh` uses for its own errors
const SSH_TRANSPORT_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub ssh_binary: String,
    pub connect_timeout_secs: Option<u64>,
    /// Directory holding the ControlMaster sockets
    pub control_dir: PathBuf,
    pub control_persist_secs: u64,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            connect_timeout_secs: None,
            control_dir: std::env::temp_dir().join(format!("cirrus-ssh-{}", std::process::id())),
            control_persist_secs: 120,
        }
    }
}

pub struct OpenSshConnector {
    options: SshOptions,
    auth_sock: Shared<Option<PathBuf>>,
}

impl OpenSshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            auth_sock: new_state(None),
        }
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn load_keys(&self, keys: &BTreeSet<PathBuf>) -> Result<KeyScope> {
        let agent = SshAgent::spawn().await?;
        let loaded = agent.add_keys(keys).await;
        *self.auth_sock.lock() = Some(agent.socket.clone());

        let auth_sock = self.auth_sock.clone();
        Ok(KeyScope::new(loaded, move || {
            auth_sock.lock().take();
            agent.kill();
        }))
    }

    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        tokio::fs::create_dir_all(&self.options.control_dir).await?;

        let mut session = OpenSshSession {
            target: target.clone(),
            options: self.options.clone(),
            auth_sock: self.auth_sock.lock().clone(),
            closed: false,
        };
        session.handshake().await?;
        Ok(Box::new(session))
    }
}

pub struct OpenSshSession {
    target: SessionTarget,
    options: SshOptions,
    auth_sock: Option<PathBuf>,
    closed: bool,
}

impl OpenSshSession {
    fn common_args(&self) -> Vec<String> {
        let control_path = self.options.control_dir.join("%C");
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.target.known_hosts.display()),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                self.target.host_key_policy().as_ssh_option()
            ),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-p".to_string(),
            self.target.port.to_string(),
        ];

        if let Some(timeout) = self.options.connect_timeout_secs {
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={timeout}"));
        }

        if let Some(bastion) = &self.target.bastion {
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={}", self.proxy_command(bastion)));
        }

        args
    }

    /// The hop to the bastion itself, run by `ssh` through the shell
    fn proxy_command(&self, bastion: &str) -> String {
        let known_hosts = format!("UserKnownHostsFile={}", self.target.known_hosts.display());
        let hop = format!("{}@{}", self.target.user, bastion);
        shell_words::join([
            self.options.ssh_binary.as_str(),
            "-o",
            "VisualHostKey=no",
            "-o",
            "BatchMode=yes",
            "-o",
            known_hosts.as_str(),
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-W",
            "%h:%p",
            hop.as_str(),
        ])
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    fn command(&self, remote: &str) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.options.ssh_binary);
        cmd.args(self.common_args())
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPersist={}", self.options.control_persist_secs))
            .arg(self.destination())
            .arg(remote)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(sock) = &self.auth_sock {
            cmd.env("SSH_AUTH_SOCK", sock);
        }
        cmd
    }

    async fn run(&self, remote: &str) -> Result<CommandOutput> {
        if self.closed {
            return Err(HarvestError::connectivity(&self.target.host, "session closed"));
        }

        let output = self
            .command(remote)
            .output()
            .await
            .map_err(|e| HarvestError::connectivity(&self.target.host, e))?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };

        if result.exit_code == Some(SSH_TRANSPORT_FAILURE) {
            return Err(HarvestError::connectivity(
                &self.target.host,
                result.stderr.trim(),
            ));
        }
        Ok(result)
    }

    async fn handshake(&mut self) -> Result<()> {
        debug!(
            "Connecting to {} (bastion: {:?}, host keys: {:?})",
            self.target.host,
            self.target.bastion,
            self.target.host_key_policy()
        );
        let output = self.run("true").await?;
        if !output.success() {
            return Err(HarvestError::connectivity(
                &self.target.host,
                format!("handshake exited with {:?}", output.exit_code),
            ));
        }
        info!("Connected to {}", self.target.host);
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    fn host(&self) -> &str {
        &self.target.host
    }

    async fn stat(&mut self, pattern: &str) -> Result<Vec<RemoteFileDescriptor>> {
        // The glob is left unquoted so the remote shell expands it; no match
        // means stat exits non-zero with nothing on stdout.
        let remote = format!(
            "stat -c {} {} 2>/dev/null",
            shell_words::quote(STAT_FORMAT),
            pattern
        );
        let output = self.run(&remote).await?;
        Ok(parse_stat_output(&output.stdout))
    }

    async fn download(&mut self, remote: &RemoteFileDescriptor, local: &Path) -> Result<()> {
        if self.closed {
            return Err(HarvestError::connectivity(&self.target.host, "session closed"));
        }

        let partial = partial_path(local);
        let file = tokio::fs::File::create(&partial).await?.into_std().await;
        let child = self
            .command(&format!("cat -- {}", shell_words::quote(&remote.path)))
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HarvestError::connectivity(&self.target.host, e))?;
        let status = child
            .wait_with_output()
            .await
            .map_err(|e| HarvestError::connectivity(&self.target.host, e))?;

        if !status.status.success() {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(HarvestError::connectivity(
                &self.target.host,
                format!(
                    "download of {} failed: {}",
                    remote.path,
                    String::from_utf8_lossy(&status.stderr).trim()
                ),
            ));
        }

        set_file_times(&partial, remote.access_time, remote.modified_time)?;
        tokio::fs::rename(&partial, local).await?;
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandOutput> {
        self.run(command).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let result = AsyncCommand::new(&self.options.ssh_binary)
            .args(self.common_args())
            .arg("-O")
            .arg("exit")
            .arg(self.destination())
            .stdin(Stdio::null())
            .output()
            .await;
        if let Err(e) = result {
            debug!("Control master for {} not stopped: {}", self.target.host, e);
        }
    }
}

/// Hidden sibling so a half-written file never matches the capture suffix
fn partial_path(local: &Path) -> PathBuf {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    local.with_file_name(format!(".{name}.part"))
}
