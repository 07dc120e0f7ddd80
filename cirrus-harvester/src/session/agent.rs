//! Key agent scope
//!
//! Every private key the fleet needs is loaded into one `ssh-agent` for the
//! duration of a harvest. The agent is owned by a [`KeyScope`] guard: it is
//! killed when the guard drops, on success, error or unwind.

use crate::error::{HarvestError, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

/// RAII guard over loaded credentials
pub struct KeyScope {
    loaded: usize,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeyScope {
    pub fn new(loaded: usize, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            loaded,
            release: Some(Box::new(release)),
        }
    }

    /// Scope with nothing to release
    pub fn empty(loaded: usize) -> Self {
        Self { loaded, release: None }
    }

    pub fn loaded(&self) -> usize {
        self.loaded
    }
}

impl Drop for KeyScope {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for KeyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyScope").field("loaded", &self.loaded).finish()
    }
}

/// A private `ssh-agent` process
#[derive(Debug, Clone)]
pub struct SshAgent {
    pub socket: PathBuf,
    pub pid: u32,
}

impl SshAgent {
    pub async fn spawn() -> Result<Self> {
        let output = AsyncCommand::new("ssh-agent")
            .arg("-s")
            .output()
            .await
            .map_err(|e| HarvestError::Configuration(format!("cannot start ssh-agent: {e}")))?;

        if !output.status.success() {
            return Err(HarvestError::Configuration(format!(
                "ssh-agent failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let agent = parse_agent_env(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            HarvestError::Configuration("unexpected ssh-agent output".to_string())
        })?;
        debug!("Started ssh-agent pid {} at {}", agent.pid, agent.socket.display());
        Ok(agent)
    }

    pub async fn add_key(&self, key: &Path) -> Result<()> {
        let output = AsyncCommand::new("ssh-add")
            .arg(key)
            .env("SSH_AUTH_SOCK", &self.socket)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(HarvestError::Configuration(format!(
                "ssh-add {}: {}",
                key.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Load keys, keeping going past unusable ones. Nodes whose key is
    /// missing fail at connect time and are skipped there.
    pub async fn add_keys<'a>(&self, keys: impl IntoIterator<Item = &'a PathBuf>) -> usize {
        let mut loaded = 0;
        for key in keys {
            match self.add_key(key).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Key not loaded: {}", e),
            }
        }
        info!("Loaded {} key(s) into ssh-agent", loaded);
        loaded
    }

    /// Synchronous so it can run from `Drop`
    pub fn kill(&self) {
        let result = std::process::Command::new("ssh-agent")
            .arg("-k")
            .env("SSH_AGENT_PID", self.pid.to_string())
            .env("SSH_AUTH_SOCK", &self.socket)
            .output();

        match result {
            Ok(out) if out.status.success() => debug!("Stopped ssh-agent pid {}", self.pid),
            Ok(out) => warn!(
                "ssh-agent -k failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => warn!("Cannot stop ssh-agent pid {}: {}", self.pid, e),
        }
    }
}

/// Read `SSH_AUTH_SOCK` and `SSH_AGENT_PID` out of `ssh-agent -s` output
pub fn parse_agent_env(output: &str) -> Option<SshAgent> {
    let mut socket = None;
    let mut pid = None;

    for statement in output.split([';', '\n']) {
        let statement = statement.trim();
        if let Some(value) = statement.strip_prefix("SSH_AUTH_SOCK=") {
            socket = Some(PathBuf::from(value));
        } else if let Some(value) = statement.strip_prefix("SSH_AGENT_PID=") {
            pid = value.parse().ok();
        }
    }

    Some(SshAgent {
        socket: socket?,
        pid: pid?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_agent_env() {
        let out = "SSH_AUTH_SOCK=/tmp/ssh-XXXXabcd/agent.4242; export SSH_AUTH_SOCK;\n\
                   SSH_AGENT_PID=4243; export SSH_AGENT_PID;\n\
                   echo Agent pid 4243;\n";
        let agent = parse_agent_env(out).unwrap();
        assert_eq!(agent.socket, PathBuf::from("/tmp/ssh-XXXXabcd/agent.4242"));
        assert_eq!(agent.pid, 4243);
    }

    #[test]
    fn test_parse_agent_env_incomplete() {
        assert!(parse_agent_env("echo Agent pid 12;").is_none());
    }

    #[test]
    fn test_scope_releases_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        {
            let scope = KeyScope::new(2, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(scope.loaded(), 2);
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scope_releases_on_unwind() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let result = std::panic::catch_unwind(move || {
            let _scope = KeyScope::new(1, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            panic!("collection blew up");
        });
        assert!(result.is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
