//! Single-host executor.
//!
//! A `RemoteChannel` is one authenticated `ssh` control channel bound to
//! (host, user, agent, forwarding flag). Every call is independent: the
//! working directory is passed explicitly and no shell state survives
//! between calls. There is exactly one connection attempt per call.

use tracing::debug;

use super::hop;
use crate::error::{ClusterError, Result};
use crate::infrastructure::runner::{CommandRunner, Invocation};


/// ssh `-o` options applied to every channel unless overridden.
pub const DEFAULT_SSH_OPTIONS: &[&str] = &[
    "StrictHostKeyChecking=accept-new",
    "BatchMode=yes",
    "ServerAliveInterval=30",
    "ConnectionAttempts=1",
];


// ---------------------------------------------------------------------------
// RemoteChannel
// ---------------------------------------------------------------------------

/// Connection coordinates for one remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChannel {
    pub host: String,
    pub user: String,
    pub port: u16,
    /// Allow the remote end to authenticate onward with our agent (`-A`).
    pub forward_agent: bool,
    pub ssh_options: Vec<String>,
    /// `SSH_AUTH_SOCK` / `SSH_AGENT_PID` for the spawned ssh client.
    pub agent_env: Vec<(String, String)>,
}

impl RemoteChannel {
    pub fn new(host: &str, user: &str) -> Self {
        RemoteChannel {
            host: host.to_string(),
            user: user.to_string(),
            port: 22,
            forward_agent: false,
            ssh_options: DEFAULT_SSH_OPTIONS.iter().map(|s| s.to_string()).collect(),
            agent_env: Vec::new(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn forward_agent(mut self, enabled: bool) -> Self {
        self.forward_agent = enabled;
        self
    }

    pub fn ssh_options(mut self, options: Vec<String>) -> Self {
        self.ssh_options = options;
        self
    }

    pub fn agent_env(mut self, env: Vec<(String, String)>) -> Self {
        self.agent_env = env;
        self
    }

    /// The `user@host` string used in ssh/rsync/scp commands.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Port and `-o` options, shared by ssh and the rsync transport.
    fn connection_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![port_flag.to_string(), self.port.to_string()];
        for opt in &self.ssh_options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        args
    }

    /// Base ssh arguments (forwarding, port, options, user@host) without a
    /// command.
    pub fn ssh_base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.forward_agent {
            args.push("-A".to_string());
        }
        args.extend(self.connection_args("-p"));
        args.push(self.user_at_host());
        args
    }

    /// scp arguments for port and options (scp spells the port `-P`).
    pub fn scp_args(&self) -> Vec<String> {
        self.connection_args("-P")
    }

    /// The `ssh ...` transport string for `rsync -e`.
    pub fn transport(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.connection_args("-p"));
        parts.join(" ")
    }

    /// Build the ssh invocation for `command` run inside `working_dir`.
    /// The remote command line is passed as one argument so the remote
    /// shell handles pipes, redirects and globs.
    pub fn build_ssh_command(&self, command: &str, working_dir: &str, capture: bool) -> Invocation {
        Invocation::new("ssh")
            .args(self.ssh_base_args())
            .arg(hop::in_dir(command, working_dir))
            .envs(&self.agent_env)
            .capture(capture)
    }

    /// Run `command` on this host. Returns captured stdout when `capture`
    /// is set, `None` otherwise (output streams to the terminal).
    ///
    /// A non-zero exit becomes `RemoteExecution` carrying host, command and
    /// exit code.
    pub fn execute(
        &self,
        runner: &dyn CommandRunner,
        command: &str,
        working_dir: &str,
        capture: bool,
    ) -> Result<Option<String>> {
        debug!(host = %self.host, dir = working_dir, command, "remote exec");
        let out = runner.run(&self.build_ssh_command(command, working_dir, capture))?;
        if !out.success() {
            return Err(ClusterError::RemoteExecution {
                host: self.host.clone(),
                command: command.to_string(),
                exit_code: out.exit_code(),
            });
        }
        Ok(if capture { Some(out.stdout) } else { None })
    }
}
