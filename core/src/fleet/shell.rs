//! Fleet command fan-out.
//!
//! `FleetShell` owns the credential session and one forwarding-enabled
//! channel to the coordinator. Workers are addresses, never channels: every
//! worker operation is a command executed on the coordinator that hops to
//! the worker with the forwarded identity.
//!
//! Everything is sequential. The coordinator always goes first, then the
//! workers in rank order, and under `FailurePolicy::FailFast` the first
//! failure stops the run. Nothing already executed is rolled back.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::channel::RemoteChannel;
use super::directory::ClusterHandle;
use super::hop;
use super::staging::{self, StagingPath};
use super::transfer;
use crate::credential::CredentialSession;
use crate::error::{ClusterError, Result};
use crate::infrastructure::runner::{CommandRunner, Invocation};


/// Default working directory for remote commands.
pub const HOME_DIR: &str = "~";

/// Rewrites `~/.bash_profile` from the exports in `~/.bashrc`, so
/// non-interactive shells on the node see the same environment.
pub const BASH_PROFILE_COMMAND: &str = "grep export ${HOME}/.bashrc > ${HOME}/.bash_profile";


// ---------------------------------------------------------------------------
// Targets and outcomes
// ---------------------------------------------------------------------------

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Coordinator,
    Worker(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Coordinator => f.write_str("coordinator"),
            Target::Worker(addr) => write!(f, "worker {}", addr),
        }
    }
}

/// How far a directory sync reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    CoordinatorOnly,
    All,
}

/// What to do when one target fails during a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    FailFast,
    /// Attempt every worker and report per target. A coordinator failure
    /// still stops the run.
    ContinueOnError,
}

/// Result of one target in a fan-out.
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: Target,
    pub result: Result<Option<String>>,
}


// ---------------------------------------------------------------------------
// FleetShell
// ---------------------------------------------------------------------------

pub struct FleetShell {
    handle: ClusterHandle,
    session: CredentialSession,
    runner: Box<dyn CommandRunner>,
    coordinator: RemoteChannel,
    staging_root: String,
    known_hosts: PathBuf,
}

impl FleetShell {
    /// Build a shell over a resolved cluster. The coordinator channel has
    /// agent forwarding on and carries the session's agent environment.
    pub fn new(handle: ClusterHandle, session: CredentialSession, runner: Box<dyn CommandRunner>) -> Self {
        let coordinator = RemoteChannel::new(&handle.coordinator, &handle.username)
            .forward_agent(true)
            .agent_env(session.agent_env());
        let known_hosts = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh")
            .join("known_hosts");
        FleetShell {
            handle,
            session,
            runner,
            coordinator,
            staging_root: staging::STAGING_ROOT.to_string(),
            known_hosts,
        }
    }

    /// Override ssh port and `-o` options on the coordinator channel.
    pub fn with_ssh(mut self, port: u16, options: Vec<String>) -> Self {
        self.coordinator = self.coordinator.port(port).ssh_options(options);
        self
    }

    /// Parent directory for generated staging paths on the coordinator.
    pub fn with_staging_root(mut self, root: &str) -> Self {
        self.staging_root = root.to_string();
        self
    }

    /// Local `known_hosts` file that `full_init` appends to.
    pub fn with_known_hosts(mut self, path: &Path) -> Self {
        self.known_hosts = path.to_path_buf();
        self
    }

    pub fn handle(&self) -> &ClusterHandle {
        &self.handle
    }

    pub fn coordinator_channel(&self) -> &RemoteChannel {
        &self.coordinator
    }

    /// Coordinator first, then workers in rank order.
    pub fn targets(&self) -> Vec<Target> {
        std::iter::once(Target::Coordinator)
            .chain(self.handle.workers.iter().cloned().map(Target::Worker))
            .collect()
    }

    // -- Commands --

    /// Run `command` on one target inside `working_dir`.
    ///
    /// A worker command is wrapped in the worker hop and executed on the
    /// coordinator; a failure is still reported against the worker and the
    /// caller's command text.
    pub fn run_on(&self, target: &Target, command: &str, working_dir: &str, capture: bool) -> Result<Option<String>> {
        match target {
            Target::Coordinator => {
                self.coordinator.execute(self.runner.as_ref(), command, working_dir, capture)
            }
            Target::Worker(addr) => {
                let wrapped = hop::worker_command(&self.handle.username, addr, command, working_dir)?;
                self.coordinator
                    .execute(self.runner.as_ref(), &wrapped, HOME_DIR, capture)
                    .map_err(|e| match e {
                        ClusterError::RemoteExecution { exit_code, .. } => ClusterError::RemoteExecution {
                            host: addr.clone(),
                            command: command.to_string(),
                            exit_code,
                        },
                        other => other,
                    })
            }
        }
    }

    /// Run on the coordinator, then every worker in order. Stops at the
    /// first failure; earlier targets have already executed.
    pub fn run_on_all(&self, command: &str, working_dir: &str, capture: bool) -> Result<Vec<(Target, Option<String>)>> {
        self.run_on_all_with(FailurePolicy::FailFast, command, working_dir, capture)
            .into_iter()
            .map(|outcome| outcome.result.map(|out| (outcome.target, out)))
            .collect()
    }

    /// Same ordering as `run_on_all`, reporting one outcome per attempted
    /// target.
    pub fn run_on_all_with(
        &self,
        policy: FailurePolicy,
        command: &str,
        working_dir: &str,
        capture: bool,
    ) -> Vec<TargetOutcome> {
        let mut outcomes = Vec::new();
        for target in self.targets() {
            info!(%target, command, "run");
            let result = self.run_on(&target, command, working_dir, capture);
            let failed = result.is_err();
            if let Err(ref e) = result {
                warn!(%target, error = %e, "run failed");
            }
            let coordinator = target == Target::Coordinator;
            outcomes.push(TargetOutcome { target, result });
            if failed && (coordinator || policy == FailurePolicy::FailFast) {
                break;
            }
        }
        outcomes
    }

    // -- Transfers --

    /// Run a coordinator-side transfer command, reporting failure as
    /// `Transfer`.
    fn relay(&self, command: &str, source: &str, destination: &str) -> Result<()> {
        debug!(command, "coordinator relay");
        self.coordinator
            .execute(self.runner.as_ref(), command, HOME_DIR, true)
            .map(|_| ())
            .map_err(|e| match e {
                ClusterError::RemoteExecution { exit_code, .. } => ClusterError::Transfer {
                    source_path: source.to_string(),
                    destination: destination.to_string(),
                    detail: format!("'{}' exited with {}", command, exit_code),
                },
                other => other,
            })
    }

    fn local(&self, invocation: &Invocation, source: &str, destination: &str) -> Result<()> {
        debug!(command = %invocation.command_line(), "local transfer");
        transfer::run_transfer(self.runner.as_ref(), invocation, source, destination).map(|_| ())
    }

    fn on_coordinator(&self, path: &str) -> String {
        format!("{}:{}", self.handle.coordinator, path)
    }

    /// rsync the contents of `local_dir` to `remote_dir` on the coordinator
    /// and, with `SyncScope::All`, from there to the same path on every
    /// worker.
    pub fn sync_directory(&self, local_dir: &str, remote_dir: &str, scope: SyncScope) -> Result<()> {
        info!(local_dir, remote_dir, ?scope, "sync");
        let inv = transfer::rsync_push(&self.coordinator, local_dir, remote_dir);
        self.local(&inv, local_dir, &self.on_coordinator(remote_dir))?;

        if scope == SyncScope::All {
            for worker in &self.handle.workers {
                let cmd = transfer::rsync_to_worker(remote_dir, &self.handle.username, worker, remote_dir);
                self.relay(&cmd, &self.on_coordinator(remote_dir), &format!("{}:{}", worker, remote_dir))?;
            }
        }
        Ok(())
    }

    /// rsync the contents of `remote_dir` on the coordinator into
    /// `local_dir`.
    pub fn pull_directory(&self, remote_dir: &str, local_dir: &str) -> Result<()> {
        info!(remote_dir, local_dir, "pull");
        let inv = transfer::rsync_pull(&self.coordinator, remote_dir, local_dir);
        self.local(&inv, &self.on_coordinator(remote_dir), local_dir)
    }

    pub fn copy_to_coordinator(&self, local: &str, remote: &str) -> Result<()> {
        info!(local, remote, "copy to coordinator");
        let inv = transfer::scp_push(&self.coordinator, local, remote);
        self.local(&inv, local, &self.on_coordinator(remote))
    }

    /// Copy a file to `remote_path` on the coordinator, then have the
    /// coordinator push it to the same path on each worker.
    pub fn copy_to_all(&self, local_file: &str, remote_path: &str) -> Result<()> {
        self.copy_to_coordinator(local_file, remote_path)?;
        for worker in &self.handle.workers {
            let cmd = transfer::scp_to_worker(remote_path, &self.handle.username, worker);
            self.relay(&cmd, &self.on_coordinator(remote_path), &format!("{}:{}", worker, remote_path))?;
        }
        Ok(())
    }

    /// `scp -r` from the coordinator. A `local_path` ending in `/.` names a
    /// directory, which is created first.
    pub fn fetch_from_coordinator(&self, remote_path: &str, local_path: &str) -> Result<()> {
        if let Some(dir) = local_path.strip_suffix("/.") {
            if !dir.is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        info!(remote_path, local_path, "fetch from coordinator");
        let inv = transfer::scp_pull(&self.coordinator, remote_path, local_path);
        self.local(&inv, &self.on_coordinator(remote_path), local_path)
    }

    /// Gather `remote_path` from every node into a staging directory on the
    /// coordinator and download it in one transfer.
    ///
    /// An explicit `staging` path is checked by the destructive-path guard
    /// before anything runs. If a step fails the staging directory is left
    /// behind; `list_orphaned_staging` finds generated ones.
    pub fn fetch_from_all(&self, remote_path: &str, local_path: &str, staging: Option<&str>) -> Result<()> {
        let stage = match staging {
            Some(path) => StagingPath::explicit(path)?,
            None => StagingPath::generate(&self.staging_root)?,
        };
        info!(remote_path, local_path, staging = %stage, "fetch from all");

        let run = |cmd: &str| -> Result<()> {
            self.coordinator
                .execute(self.runner.as_ref(), cmd, HOME_DIR, true)
                .map(|_| ())
        };

        run(&stage.clear_command())?;
        run(&stage.create_command())?;
        run(&format!("cp -r {} {}", remote_path, hop::quote_dir(stage.as_str())))?;
        for worker in &self.handle.workers {
            let cmd = transfer::scp_from_worker(&self.handle.username, worker, remote_path, stage.as_str());
            self.relay(&cmd, &format!("{}:{}", worker, remote_path), &self.on_coordinator(stage.as_str()))?;
        }
        self.fetch_from_coordinator(stage.as_str(), local_path)?;
        run(&stage.remove_command())
    }

    // -- Staging hygiene --

    /// Generated staging directories still present under the staging root.
    pub fn list_orphaned_staging(&self) -> Result<Vec<String>> {
        let out = self.coordinator.execute(
            self.runner.as_ref(),
            &staging::list_command(&self.staging_root),
            HOME_DIR,
            true,
        )?;
        Ok(staging::parse_listing(&out.unwrap_or_default()))
    }

    /// Remove every orphaned staging directory. Returns what was removed.
    pub fn clean_orphaned_staging(&self) -> Result<Vec<String>> {
        let orphans = self.list_orphaned_staging()?;
        for path in &orphans {
            let stage = StagingPath::explicit(path)?;
            info!(staging = %stage, "removing orphaned staging directory");
            self.coordinator
                .execute(self.runner.as_ref(), &stage.remove_command(), HOME_DIR, true)?;
        }
        Ok(orphans)
    }

    // -- Setup --

    /// Append the coordinator's host keys to the local `known_hosts`.
    fn trust_coordinator_locally(&self) -> Result<()> {
        let inv = Invocation::new("ssh-keyscan").arg(&self.handle.coordinator);
        let out = self.runner.run(&inv)?;
        if !out.success() {
            return Err(ClusterError::RemoteExecution {
                host: self.handle.coordinator.clone(),
                command: inv.command_line(),
                exit_code: out.exit_code(),
            });
        }
        if let Some(parent) = self.known_hosts.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.known_hosts)?;
        file.write_all(out.stdout.as_bytes())?;
        Ok(())
    }

    /// Prepare a fresh cluster: trust the coordinator locally, write a
    /// bash profile on the coordinator, have the coordinator trust itself
    /// and every worker, then write a bash profile on each worker.
    pub fn full_init(&self) -> Result<()> {
        info!(coordinator = %self.handle.coordinator, "full init");
        self.trust_coordinator_locally()?;
        self.run_on(&Target::Coordinator, BASH_PROFILE_COMMAND, HOME_DIR, true)?;

        let scan = |host: &str| format!("ssh-keyscan {} >> ~/.ssh/known_hosts", host);
        self.run_on(&Target::Coordinator, &scan("localhost"), HOME_DIR, true)?;
        for worker in &self.handle.workers {
            self.run_on(&Target::Coordinator, &scan(worker), HOME_DIR, true)?;
        }
        for worker in &self.handle.workers {
            self.run_on(&Target::Worker(worker.clone()), BASH_PROFILE_COMMAND, HOME_DIR, true)?;
        }
        info!("full init complete");
        Ok(())
    }

    /// MPI hostfile: the coordinator as `localhost`, then each worker.
    pub fn hostfile(&self, slots: u32) -> String {
        let mut s = format!("localhost slots={}", slots);
        for worker in &self.handle.workers {
            s.push_str(&format!("\n{} slots={}", worker, slots));
        }
        s
    }

    /// Command an operator can paste to reach the coordinator.
    pub fn ssh_hint(&self) -> String {
        format!("ssh -A {}", self.coordinator.user_at_host())
    }

    /// Tear down the credential session.
    pub fn shut_down(mut self) {
        info!(stack = %self.handle.stack_name, "shutting down fleet shell");
        self.session.destroy();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::runner::MockRunner;

    fn handle() -> ClusterHandle {
        ClusterHandle {
            stack_name: "c1".into(),
            region: "us-east-1".into(),
            coordinator: "1.2.3.4".into(),
            workers: vec!["10.0.0.5".into(), "10.0.0.6".into()],
            username: "ubuntu".into(),
        }
    }

    fn shell(runner: &MockRunner) -> FleetShell {
        FleetShell::new(handle(), CredentialSession::without_agent(b"KEY"), Box::new(runner.clone()))
            .with_ssh(22, vec!["BatchMode=yes".into()])
    }

    /// The remote command line passed to ssh (its last argument).
    fn remote_commands(runner: &MockRunner) -> Vec<String> {
        runner
            .invocations()
            .iter()
            .filter(|inv| inv.program == "ssh")
            .filter_map(|inv| inv.args.last().cloned())
            .collect()
    }

    // -- Targets --

    #[test]
    fn targets_start_with_coordinator() {
        let runner = MockRunner::new();
        assert_eq!(
            shell(&runner).targets(),
            vec![
                Target::Coordinator,
                Target::Worker("10.0.0.5".into()),
                Target::Worker("10.0.0.6".into()),
            ]
        );
    }

    #[test]
    fn coordinator_channel_forwards_agent() {
        let runner = MockRunner::new();
        let sh = shell(&runner);
        assert!(sh.coordinator_channel().forward_agent);
        sh.run_on(&Target::Coordinator, "uptime", "~", true).unwrap();
        assert_eq!(runner.invocations()[0].args[0], "-A");
    }

    // -- run_on --

    #[test]
    fn worker_command_hops_through_coordinator() {
        let runner = MockRunner::new();
        shell(&runner)
            .run_on(&Target::Worker("10.0.0.5".into()), "nvidia-smi", "~/code", true)
            .unwrap();
        let inv = &runner.invocations()[0];
        assert!(inv.args.contains(&"ubuntu@1.2.3.4".to_string()));
        assert_eq!(
            inv.args.last().unwrap(),
            "cd ~ && ssh -A ubuntu@10.0.0.5 'cd ~/code && nvidia-smi'"
        );
    }

    #[test]
    fn worker_failure_is_reported_against_worker() {
        let runner = MockRunner::with_responses(vec![MockRunner::exit(2, "")]);
        let err = shell(&runner)
            .run_on(&Target::Worker("10.0.0.6".into()), "ls /missing", "~", true)
            .unwrap_err();
        match err {
            ClusterError::RemoteExecution { host, command, exit_code } => {
                assert_eq!(host, "10.0.0.6");
                assert_eq!(command, "ls /missing");
                assert_eq!(exit_code, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // -- run_on_all --

    #[test]
    fn run_on_all_collects_in_order() {
        let runner = MockRunner::with_responses(vec![
            MockRunner::ok("c\n"),
            MockRunner::ok("w1\n"),
            MockRunner::ok("w2\n"),
        ]);
        let out = shell(&runner).run_on_all("hostname", "~", true).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], (Target::Coordinator, Some("c\n".to_string())));
        assert_eq!(out[2], (Target::Worker("10.0.0.6".into()), Some("w2\n".to_string())));
    }

    #[test]
    fn run_on_all_stops_after_second_worker_failure() {
        let runner = MockRunner::with_responses(vec![
            MockRunner::ok(""),
            MockRunner::ok(""),
            MockRunner::exit(1, "boom"),
            MockRunner::ok(""),
        ]);
        let mut handle = handle();
        handle.workers.push("10.0.0.7".into());
        let sh = FleetShell::new(handle, CredentialSession::without_agent(b"KEY"), Box::new(runner.clone()));

        let err = sh.run_on_all("train", "~", true).unwrap_err();
        assert!(matches!(err, ClusterError::RemoteExecution { ref host, .. } if host == "10.0.0.6"));

        let cmds = remote_commands(&runner);
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0], "cd ~ && train");
        assert!(cmds[1].contains("ubuntu@10.0.0.5"));
        assert!(cmds[2].contains("ubuntu@10.0.0.6"));
    }

    #[test]
    fn continue_on_error_attempts_every_worker() {
        let runner = MockRunner::with_responses(vec![
            MockRunner::ok("c"),
            MockRunner::exit(1, ""),
            MockRunner::ok("w2"),
        ]);
        let outcomes = shell(&runner).run_on_all_with(FailurePolicy::ContinueOnError, "x", "~", true);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert_eq!(outcomes[2].result.as_ref().unwrap().as_deref(), Some("w2"));
    }

    #[test]
    fn coordinator_failure_always_short_circuits() {
        let runner = MockRunner::with_responses(vec![MockRunner::exit(255, "unreachable")]);
        let outcomes = shell(&runner).run_on_all_with(FailurePolicy::ContinueOnError, "x", "~", true);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].target, Target::Coordinator);
        assert_eq!(runner.invocations().len(), 1);
    }

    // -- Transfers --

    #[test]
    fn sync_all_pushes_then_relays_to_each_worker() {
        let runner = MockRunner::new();
        shell(&runner)
            .sync_directory("/Users/me/code", "/home/ubuntu/code", SyncScope::All)
            .unwrap();
        let invs = runner.invocations();
        assert_eq!(invs.len(), 3);
        assert_eq!(invs[0].program, "rsync");
        assert_eq!(invs[0].args[3], "/Users/me/code/");
        assert_eq!(invs[0].args[4], "ubuntu@1.2.3.4:/home/ubuntu/code/");
        assert_eq!(
            remote_commands(&runner),
            vec![
                "cd ~ && rsync -azP /home/ubuntu/code/ ubuntu@10.0.0.5:/home/ubuntu/code/",
                "cd ~ && rsync -azP /home/ubuntu/code/ ubuntu@10.0.0.6:/home/ubuntu/code/",
            ]
        );
    }

    #[test]
    fn sync_coordinator_only_is_one_transfer() {
        let runner = MockRunner::new();
        shell(&runner)
            .sync_directory("./code/", "/home/ubuntu/code/", SyncScope::CoordinatorOnly)
            .unwrap();
        assert_eq!(runner.invocations().len(), 1);
    }

    #[test]
    fn failed_worker_relay_is_a_transfer_error() {
        let runner = MockRunner::with_responses(vec![MockRunner::ok(""), MockRunner::exit(12, "")]);
        let err = shell(&runner)
            .sync_directory("/a", "/home/ubuntu/a", SyncScope::All)
            .unwrap_err();
        assert!(matches!(err, ClusterError::Transfer { ref destination, .. } if destination.starts_with("10.0.0.5")));
        assert_eq!(runner.invocations().len(), 2);
    }

    #[test]
    fn copy_to_all_uses_same_path_everywhere() {
        let runner = MockRunner::new();
        shell(&runner).copy_to_all("./hostfile", "/home/ubuntu/hostfile").unwrap();
        let invs = runner.invocations();
        assert_eq!(invs[0].program, "scp");
        assert_eq!(invs[0].args.last().unwrap(), "ubuntu@1.2.3.4:/home/ubuntu/hostfile");
        assert_eq!(
            remote_commands(&runner),
            vec![
                "cd ~ && scp -r /home/ubuntu/hostfile ubuntu@10.0.0.5:/home/ubuntu/hostfile",
                "cd ~ && scp -r /home/ubuntu/hostfile ubuntu@10.0.0.6:/home/ubuntu/hostfile",
            ]
        );
    }

    #[test]
    fn fetch_from_coordinator_creates_dot_directory() {
        let dir = std::env::temp_dir().join(format!("dlc-fetch-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let target = format!("{}/.", dir.display());

        let runner = MockRunner::new();
        shell(&runner).fetch_from_coordinator("/home/ubuntu/logs/*", &target).unwrap();
        assert!(dir.is_dir());
        assert_eq!(runner.invocations()[0].args.last().unwrap(), &target);
        let _ = fs::remove_dir_all(&dir);
    }

    // -- fetch_from_all --

    #[test]
    fn fetch_from_all_rejects_unsafe_staging_before_any_call() {
        let runner = MockRunner::new();
        let err = shell(&runner)
            .fetch_from_all("~/logs/*", "./logs", Some("/etc"))
            .unwrap_err();
        assert!(matches!(err, ClusterError::UnsafePath(ref p) if p == "/etc"));
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn fetch_from_all_rejects_staging_the_shell_would_split() {
        for staging in ["/tmp/x /etc", "/tmp/a;rm -rf /"] {
            let runner = MockRunner::new();
            let err = shell(&runner)
                .fetch_from_all("~/logs/*", "./logs", Some(staging))
                .unwrap_err();
            assert!(matches!(err, ClusterError::UnsafePath(ref p) if p == staging));
            assert!(runner.invocations().is_empty(), "{staging}");
        }
    }

    #[test]
    fn fetch_from_all_quotes_staging_in_every_command() {
        let runner = MockRunner::new();
        shell(&runner)
            .fetch_from_all("~/logs/*", "./logs", Some("/tmp/stage~1"))
            .unwrap();
        let cmds = remote_commands(&runner);
        assert_eq!(cmds[0], "cd ~ && sudo rm -r -f '/tmp/stage~1'");
        assert_eq!(cmds[2], "cd ~ && cp -r ~/logs/* '/tmp/stage~1'");
        assert_eq!(cmds[3], "cd ~ && scp -r ubuntu@10.0.0.5:~/logs/* '/tmp/stage~1'");
        assert_eq!(cmds[5], "cd ~ && sudo rm -r '/tmp/stage~1'");
    }

    #[test]
    fn fetch_from_all_runs_full_sequence() {
        let runner = MockRunner::new();
        shell(&runner)
            .fetch_from_all("~/logs/*", "./logs", Some("/tmp/stage"))
            .unwrap();

        assert_eq!(
            remote_commands(&runner),
            vec![
                "cd ~ && sudo rm -r -f /tmp/stage",
                "cd ~ && mkdir -p /tmp/stage",
                "cd ~ && cp -r ~/logs/* /tmp/stage",
                "cd ~ && scp -r ubuntu@10.0.0.5:~/logs/* /tmp/stage",
                "cd ~ && scp -r ubuntu@10.0.0.6:~/logs/* /tmp/stage",
                "cd ~ && sudo rm -r /tmp/stage",
            ]
        );
        let invs = runner.invocations();
        assert_eq!(invs.len(), 7);
        assert_eq!(invs[5].program, "scp");
        assert_eq!(invs[5].command_line(), "scp -r -P 22 -o BatchMode=yes ubuntu@1.2.3.4:/tmp/stage ./logs");
    }

    #[test]
    fn fetch_from_all_generates_staging_under_root() {
        let runner = MockRunner::new();
        shell(&runner).fetch_from_all("~/out", "./out", None).unwrap();
        let first = &remote_commands(&runner)[0];
        assert!(first.starts_with("cd ~ && sudo rm -r -f /tmp/dlc_stage_"));
    }

    #[test]
    fn fetch_from_all_leaves_staging_on_mid_failure() {
        let runner = MockRunner::with_responses(vec![
            MockRunner::ok(""),
            MockRunner::ok(""),
            MockRunner::exit(1, "No such file"),
        ]);
        assert!(shell(&runner).fetch_from_all("~/missing", "./out", Some("/tmp/s")).is_err());
        assert!(!remote_commands(&runner).iter().any(|c| c.ends_with("sudo rm -r /tmp/s")));
    }

    // -- Orphans --

    #[test]
    fn orphans_are_listed_and_removed() {
        let runner = MockRunner::with_responses(vec![MockRunner::ok(
            "/tmp/dlc_stage_a1\n/tmp/dlc_stage_b2\n",
        )]);
        let removed = shell(&runner).clean_orphaned_staging().unwrap();
        assert_eq!(removed, vec!["/tmp/dlc_stage_a1", "/tmp/dlc_stage_b2"]);
        let cmds = remote_commands(&runner);
        assert_eq!(cmds[0], "cd ~ && ls -d /tmp/dlc_stage_* 2>/dev/null || true");
        assert_eq!(cmds[1], "cd ~ && sudo rm -r /tmp/dlc_stage_a1");
        assert_eq!(cmds[2], "cd ~ && sudo rm -r /tmp/dlc_stage_b2");
    }

    // -- Setup --

    #[test]
    fn full_init_sequence() {
        let known_hosts = std::env::temp_dir()
            .join(format!("dlc-init-{}", std::process::id()))
            .join("known_hosts");
        let runner = MockRunner::with_responses(vec![MockRunner::ok("1.2.3.4 ssh-ed25519 AAAA\n")]);
        shell(&runner).with_known_hosts(&known_hosts).full_init().unwrap();

        let invs = runner.invocations();
        assert_eq!(invs[0].command_line(), "ssh-keyscan 1.2.3.4");
        assert!(fs::read_to_string(&known_hosts).unwrap().contains("ssh-ed25519"));

        let cmds = remote_commands(&runner);
        assert_eq!(cmds[0], format!("cd ~ && {}", BASH_PROFILE_COMMAND));
        assert_eq!(cmds[1], "cd ~ && ssh-keyscan localhost >> ~/.ssh/known_hosts");
        assert_eq!(cmds[2], "cd ~ && ssh-keyscan 10.0.0.5 >> ~/.ssh/known_hosts");
        assert_eq!(cmds[3], "cd ~ && ssh-keyscan 10.0.0.6 >> ~/.ssh/known_hosts");
        assert!(cmds[4].contains("ssh -A ubuntu@10.0.0.5"));
        assert!(cmds[5].contains("ssh -A ubuntu@10.0.0.6"));
        assert_eq!(cmds.len(), 6);

        if let Some(dir) = known_hosts.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn hostfile_lists_localhost_then_workers() {
        let runner = MockRunner::new();
        assert_eq!(
            shell(&runner).hostfile(8),
            "localhost slots=8\n10.0.0.5 slots=8\n10.0.0.6 slots=8"
        );
    }

    #[test]
    fn ssh_hint_targets_coordinator() {
        let runner = MockRunner::new();
        assert_eq!(shell(&runner).ssh_hint(), "ssh -A ubuntu@1.2.3.4");
    }

    #[test]
    fn shut_down_consumes_shell() {
        let runner = MockRunner::new();
        shell(&runner).shut_down();
        assert!(runner.invocations().is_empty());
    }
}
