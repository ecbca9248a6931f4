//! Credential session — an ephemeral `ssh-agent` holding the cluster key.
//!
//! `CredentialSession::start` launches `ssh-agent -s`, parses the socket path
//! and pid out of its Bourne-shell output, and loads the private key with
//! `ssh-add -` (key on stdin, never written to disk). The agent coordinates
//! are handed to every child process explicitly through `agent_env()`; the
//! controller's own environment is never modified.
//!
//! The agent is killed exactly once, either by `destroy()` or on drop, so it
//! cannot outlive the controller on any exit path.

use std::path::Path;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{ClusterError, Result};
use crate::infrastructure::runner::{CommandRunner, Invocation};


pub const AUTH_SOCK_VAR: &str = "SSH_AUTH_SOCK";
pub const AGENT_PID_VAR: &str = "SSH_AGENT_PID";


// ---------------------------------------------------------------------------
// AgentEnv
// ---------------------------------------------------------------------------

/// Coordinates of a running agent, as exported by `ssh-agent -s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEnv {
    pub auth_sock: String,
    pub pid: u32,
}

impl AgentEnv {
    /// Parse the output of `ssh-agent -s`, e.g.
    ///
    /// ```text
    /// SSH_AUTH_SOCK=/tmp/ssh-abc/agent.41; export SSH_AUTH_SOCK;
    /// SSH_AGENT_PID=42; export SSH_AGENT_PID;
    /// echo Agent pid 42;
    /// ```
    pub fn parse(output: &str) -> Result<AgentEnv> {
        let mut auth_sock = None;
        let mut pid = None;

        for stmt in output.split(|c| c == ';' || c == '\n') {
            let Some((key, value)) = stmt.trim().split_once('=') else {
                continue;
            };
            match key.trim() {
                AUTH_SOCK_VAR => auth_sock = Some(value.trim().to_string()),
                AGENT_PID_VAR => {
                    pid = Some(value.trim().parse::<u32>().map_err(|e| {
                        ClusterError::AgentStart(format!("bad agent pid '{}': {}", value, e))
                    })?)
                }
                _ => {}
            }
        }

        match (auth_sock, pid) {
            (Some(auth_sock), Some(pid)) if !auth_sock.is_empty() => {
                Ok(AgentEnv { auth_sock, pid })
            }
            _ => Err(ClusterError::AgentStart(format!(
                "could not find {} and {} in ssh-agent output",
                AUTH_SOCK_VAR, AGENT_PID_VAR
            ))),
        }
    }

    /// Environment pairs to pass to any child that needs the agent.
    pub fn vars(&self) -> Vec<(String, String)> {
        vec![
            (AUTH_SOCK_VAR.to_string(), self.auth_sock.clone()),
            (AGENT_PID_VAR.to_string(), self.pid.to_string()),
        ]
    }
}


// ---------------------------------------------------------------------------
// CredentialSession
// ---------------------------------------------------------------------------

/// Private key material plus the agent process serving it.
pub struct CredentialSession {
    key: Zeroizing<Vec<u8>>,
    agent: Option<AgentEnv>,
}

impl std::fmt::Debug for CredentialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSession")
            .field("key", &"<redacted>")
            .field("agent", &self.agent)
            .finish()
    }
}

impl CredentialSession {
    /// Start an agent and register `private_key` with it.
    ///
    /// Fails with `AgentStart` if the agent cannot be spawned, its output
    /// cannot be parsed, or `ssh-add` exits non-zero. In the last case the
    /// agent that was just started is killed before returning.
    pub fn start(runner: &dyn CommandRunner, private_key: &[u8]) -> Result<CredentialSession> {
        if private_key.is_empty() {
            return Err(ClusterError::AgentStart("private key is empty".into()));
        }

        let out = runner
            .run(&Invocation::new("ssh-agent").arg("-s"))
            .map_err(|e| ClusterError::AgentStart(format!("cannot spawn ssh-agent: {}", e)))?;
        if !out.success() {
            return Err(ClusterError::AgentStart(format!(
                "ssh-agent exited with {}: {}",
                out.exit_code(),
                out.stderr.trim()
            )));
        }
        let agent = AgentEnv::parse(&out.stdout)?;
        debug!(pid = agent.pid, sock = %agent.auth_sock, "ssh-agent started");

        // From here on the session owns the agent; any early return drops it
        // and kills the agent.
        let mut session = CredentialSession {
            key: Zeroizing::new(private_key.to_vec()),
            agent: Some(agent),
        };

        let add = Invocation::new("ssh-add")
            .arg("-")
            .envs(&[(AUTH_SOCK_VAR.to_string(), session.auth_sock().unwrap_or_default())])
            .stdin(session.key.to_vec());
        let added = match runner.run(&add) {
            Ok(out) => out,
            Err(e) => {
                session.destroy();
                return Err(ClusterError::AgentStart(format!("cannot spawn ssh-add: {}", e)));
            }
        };
        if !added.success() {
            session.destroy();
            return Err(ClusterError::AgentStart(format!(
                "ssh-add exited with {}: {}",
                added.exit_code(),
                added.stderr.trim()
            )));
        }

        info!("credential session ready");
        Ok(session)
    }

    /// A session with no agent, for callers that rely on an agent they
    /// manage themselves (e.g. a developer's login agent).
    pub fn without_agent(private_key: &[u8]) -> CredentialSession {
        CredentialSession {
            key: Zeroizing::new(private_key.to_vec()),
            agent: None,
        }
    }

    pub fn private_key(&self) -> &[u8] {
        &self.key
    }

    pub fn agent(&self) -> Option<&AgentEnv> {
        self.agent.as_ref()
    }

    fn auth_sock(&self) -> Option<String> {
        self.agent.as_ref().map(|a| a.auth_sock.clone())
    }

    /// Environment pairs for child processes; empty once destroyed.
    pub fn agent_env(&self) -> Vec<(String, String)> {
        self.agent.as_ref().map(AgentEnv::vars).unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.agent.is_some()
    }

    /// Kill the agent. Safe to call any number of times; an agent that has
    /// already exited is not an error.
    pub fn destroy(&mut self) {
        let Some(agent) = self.agent.take() else {
            return;
        };
        kill_agent(agent.pid);
    }
}

impl Drop for CredentialSession {
    fn drop(&mut self) {
        self.destroy();
    }
}


fn kill_agent(pid: u32) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if ret == 0 {
        debug!(pid, "ssh-agent terminated");
        return;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!(pid, "ssh-agent already gone");
    } else {
        warn!(pid, error = %err, "failed to kill ssh-agent");
    }
}


/// Read private key material from a PEM file.
pub fn load_private_key(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let bytes = std::fs::read(path).map_err(|e| {
        ClusterError::Config(format!("cannot read private key {}: {}", path.display(), e))
    })?;
    Ok(Zeroizing::new(bytes))
}
