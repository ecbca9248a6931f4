//! File transfer command builders (rsync and scp).
//!
//! Local-side transfers are built as `Invocation`s against a
//! `RemoteChannel`; coordinator-side transfers (coordinator → worker) are
//! built as command lines to execute on the coordinator. Directory syncs
//! always normalize both ends to a trailing `/` so rsync copies the
//! *contents* of the source instead of nesting the directory one level deep.

use super::channel::RemoteChannel;
use super::hop;
use crate::error::{ClusterError, Result};
use crate::infrastructure::runner::{CommandRunner, Invocation};


/// rsync flags: archive, compress, partial + progress.
pub const RSYNC_FLAGS: &str = "-azP";


/// Ensure a path ends with `/`. Idempotent.
pub fn ensure_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}


// ---------------------------------------------------------------------------
// Local <-> host
// ---------------------------------------------------------------------------

/// `rsync -azP -e "<ssh>" local_dir/ user@host:remote_dir/`
pub fn rsync_push(channel: &RemoteChannel, local_dir: &str, remote_dir: &str) -> Invocation {
    Invocation::new("rsync")
        .args([RSYNC_FLAGS.to_string(), "-e".to_string(), channel.transport()])
        .arg(ensure_trailing_slash(local_dir))
        .arg(format!("{}:{}", channel.user_at_host(), ensure_trailing_slash(remote_dir)))
        .envs(&channel.agent_env)
}

/// `rsync -azP -e "<ssh>" user@host:remote_dir/ local_dir/`
pub fn rsync_pull(channel: &RemoteChannel, remote_dir: &str, local_dir: &str) -> Invocation {
    Invocation::new("rsync")
        .args([RSYNC_FLAGS.to_string(), "-e".to_string(), channel.transport()])
        .arg(format!("{}:{}", channel.user_at_host(), ensure_trailing_slash(remote_dir)))
        .arg(ensure_trailing_slash(local_dir))
        .envs(&channel.agent_env)
}

/// `scp -r <opts> local user@host:remote`
pub fn scp_push(channel: &RemoteChannel, local: &str, remote: &str) -> Invocation {
    Invocation::new("scp")
        .arg("-r")
        .args(channel.scp_args())
        .arg(local)
        .arg(format!("{}:{}", channel.user_at_host(), remote))
        .envs(&channel.agent_env)
}

/// `scp -r <opts> user@host:remote local`. The remote path may be a glob;
/// it is expanded by the remote shell.
pub fn scp_pull(channel: &RemoteChannel, remote: &str, local: &str) -> Invocation {
    Invocation::new("scp")
        .arg("-r")
        .args(channel.scp_args())
        .arg(format!("{}:{}", channel.user_at_host(), remote))
        .arg(local)
        .envs(&channel.agent_env)
}


// ---------------------------------------------------------------------------
// Coordinator -> worker (command lines run on the coordinator)
// ---------------------------------------------------------------------------

/// Directory sync from the coordinator to a worker.
pub fn rsync_to_worker(src_dir: &str, user: &str, worker: &str, dest_dir: &str) -> String {
    format!(
        "rsync {} {} {}@{}:{}",
        RSYNC_FLAGS,
        ensure_trailing_slash(src_dir),
        user,
        worker,
        ensure_trailing_slash(dest_dir)
    )
}

/// Push a file (or directory) from the coordinator to the same path on a
/// worker.
pub fn scp_to_worker(path: &str, user: &str, worker: &str) -> String {
    format!("scp -r {} {}@{}:{}", path, user, worker, path)
}

/// Pull matching files from a worker into a directory on the coordinator.
/// The remote side stays unquoted so globs expand on the worker.
pub fn scp_from_worker(user: &str, worker: &str, remote: &str, dest_dir: &str) -> String {
    format!("scp -r {}@{}:{} {}", user, worker, remote, hop::quote_dir(dest_dir))
}


/// Run a local transfer; a non-zero exit becomes `Transfer`.
pub fn run_transfer(runner: &dyn CommandRunner, invocation: &Invocation, source: &str, destination: &str) -> Result<String> {
    let out = runner.run(invocation)?;
    if !out.success() {
        return Err(ClusterError::Transfer {
            source_path: source.to_string(),
            destination: destination.to_string(),
            detail: format!(
                "{} exited with {}: {}",
                invocation.program,
                out.exit_code(),
                out.stderr.trim()
            ),
        });
    }
    Ok(out.stdout)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::runner::MockRunner;

    fn channel() -> RemoteChannel {
        RemoteChannel::new("1.2.3.4", "ubuntu")
            .ssh_options(vec!["BatchMode=yes".into()])
            .agent_env(vec![("SSH_AUTH_SOCK".into(), "/tmp/agent".into())])
    }

    // -- Normalization --

    #[test]
    fn trailing_slash_is_appended_once() {
        assert_eq!(ensure_trailing_slash("/home/ubuntu/code"), "/home/ubuntu/code/");
    }

    #[test]
    fn trailing_slash_is_idempotent() {
        let once = ensure_trailing_slash("/data");
        assert_eq!(ensure_trailing_slash(&once), once);
        assert_eq!(ensure_trailing_slash("/data/"), "/data/");
    }

    // -- rsync --

    #[test]
    fn rsync_push_normalizes_both_ends() {
        let inv = rsync_push(&channel(), "/Users/me/code", "/home/ubuntu/code");
        assert_eq!(inv.program, "rsync");
        assert_eq!(
            inv.args,
            vec![
                "-azP",
                "-e",
                "ssh -p 22 -o BatchMode=yes",
                "/Users/me/code/",
                "ubuntu@1.2.3.4:/home/ubuntu/code/",
            ]
        );
        assert_eq!(inv.env.len(), 1);
    }

    #[test]
    fn rsync_pull_reverses_direction() {
        let inv = rsync_pull(&channel(), "/home/ubuntu/results/", "./results");
        assert_eq!(inv.args[3], "ubuntu@1.2.3.4:/home/ubuntu/results/");
        assert_eq!(inv.args[4], "./results/");
    }

    #[test]
    fn rsync_to_worker_normalizes() {
        assert_eq!(
            rsync_to_worker("/home/ubuntu/code", "ubuntu", "10.0.0.5", "/home/ubuntu/code"),
            "rsync -azP /home/ubuntu/code/ ubuntu@10.0.0.5:/home/ubuntu/code/"
        );
    }

    // -- scp --

    #[test]
    fn scp_push_and_pull_use_capital_port_flag() {
        let push = scp_push(&channel(), "./hostfile", "/home/ubuntu/hostfile");
        assert_eq!(push.command_line(), "scp -r -P 22 -o BatchMode=yes ./hostfile ubuntu@1.2.3.4:/home/ubuntu/hostfile");

        let pull = scp_pull(&channel(), "/home/ubuntu/logs/*", "./logs/.");
        assert_eq!(pull.command_line(), "scp -r -P 22 -o BatchMode=yes ubuntu@1.2.3.4:/home/ubuntu/logs/* ./logs/.");
    }

    #[test]
    fn worker_scp_commands() {
        assert_eq!(
            scp_to_worker("/home/ubuntu/hostfile", "ubuntu", "10.0.0.5"),
            "scp -r /home/ubuntu/hostfile ubuntu@10.0.0.5:/home/ubuntu/hostfile"
        );
        assert_eq!(
            scp_from_worker("ubuntu", "10.0.0.6", "/home/ubuntu/logs/*", "/tmp/stage"),
            "scp -r ubuntu@10.0.0.6:/home/ubuntu/logs/* /tmp/stage"
        );
    }

    // -- Execution --

    #[test]
    fn failed_transfer_maps_to_transfer_error() {
        let runner = MockRunner::with_responses(vec![MockRunner::exit(23, "some files vanished")]);
        let inv = rsync_push(&channel(), "/a", "/b");
        let err = run_transfer(&runner, &inv, "/a", "1.2.3.4:/b").unwrap_err();
        match err {
            ClusterError::Transfer { source_path, destination, detail } => {
                assert_eq!(source_path, "/a");
                assert_eq!(destination, "1.2.3.4:/b");
                assert!(detail.contains("23"));
                assert!(detail.contains("vanished"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
