//! dlc — operator CLI for deep learning training clusters.
//!
//! # Usage
//!
//! ```text
//! dlc launch
//! dlc init
//! dlc sync ./code /home/ubuntu/code
//! dlc run --all -- nvidia-smi -L
//! dlc fetch '~/logs/*' ./logs/. --all
//! dlc teardown
//! ```

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dl_cluster_core::config::{self, ClusterConfig};
use dl_cluster_core::credential::{load_private_key, CredentialSession};
use dl_cluster_core::fleet::{self, FailurePolicy, FleetShell, SyncScope, Target};
use dl_cluster_core::infrastructure::runner::ProcessRunner;
use dl_cluster_core::provider::ami::{self, ImageType};
use dl_cluster_core::provider::aws::AwsCli;
use dl_cluster_core::provider::StackLifecycle;
use dl_cluster_core::template::ClusterTemplate;
use dl_cluster_core::ClusterError;


#[derive(Parser, Debug)]
#[command(name = "dlc")]
#[command(version, about = "Provision and drive a deep learning training cluster")]
struct Cli {
    /// Cluster config file
    #[arg(short, long, global = true, env = "DLC_CONFIG")]
    config: Option<PathBuf>,

    /// Stack name (overrides config and DLC_STACK_NAME)
    #[arg(long, global = true)]
    stack: Option<String>,

    /// Debug logging for the cluster library
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the stack from the configured template and wait for it
    Launch,

    /// Print the coordinator and worker addresses
    Resolve,

    /// Trust host keys and write bash profiles on every node
    Init,

    /// Run a command on the coordinator, one worker, or every node
    Run {
        /// Every node: coordinator first, then workers
        #[arg(long, conflicts_with = "worker")]
        all: bool,
        /// A single worker by private address
        #[arg(long)]
        worker: Option<String>,
        /// Remote working directory
        #[arg(short, long, default_value = "~")]
        dir: String,
        /// With --all, keep going after a worker fails
        #[arg(long, requires = "all")]
        continue_on_error: bool,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// rsync a local directory to the coordinator and every worker
    Sync {
        local: String,
        remote: String,
        #[arg(long)]
        coordinator_only: bool,
    },

    /// rsync a coordinator directory to the local machine
    Pull { remote: String, local: String },

    /// scp a file to the coordinator and every worker
    Copy {
        local: String,
        remote: String,
        #[arg(long)]
        coordinator_only: bool,
    },

    /// scp files from the coordinator, or from every node with --all
    Fetch {
        remote: String,
        local: String,
        #[arg(long)]
        all: bool,
        /// Staging directory on the coordinator (with --all)
        #[arg(long, requires = "all")]
        staging: Option<String>,
    },

    /// Print the MPI hostfile, optionally installing it on every node
    Hostfile {
        #[arg(long)]
        slots: Option<u32>,
        /// Copy the hostfile to this path on every node
        #[arg(long)]
        install: Option<String>,
    },

    /// List leftover staging directories on the coordinator
    Orphans {
        #[arg(long)]
        clean: bool,
    },

    /// Print the ssh command for the coordinator
    Ssh,

    /// Delete the stack and wait for it to go away
    Teardown,

    /// Look up a Deep Learning AMI id
    Ami {
        /// ubuntu or amazonlinux
        image_type: String,
        #[arg(long, default_value = ami::LATEST)]
        version: String,
        #[arg(long)]
        region: Option<String>,
    },
}


fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("dlc: {:#}", e);
        let code = e
            .downcast_ref::<ClusterError>()
            .and_then(ClusterError::exit_code)
            .filter(|c| *c > 0)
            .unwrap_or(1);
        process::exit(code);
    }
}


fn init_logging(verbose: bool) {
    let default = if verbose { "info,dl_cluster_core=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .try_init();
}


/// `--config`/`DLC_CONFIG` if given, else `~/.config/dl-cluster/cluster.yaml`.
fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".config").join("dl-cluster").join("cluster.yaml")
}


fn load_config(cli: &Cli) -> Result<ClusterConfig> {
    let path = resolve_config_path(cli.config.as_deref());
    let mut cfg = if path.exists() {
        config::load(&path).with_context(|| format!("loading {}", path.display()))?
    } else if cli.config.is_some() {
        bail!("config file {} does not exist", path.display());
    } else {
        ClusterConfig::default()
    };
    cfg.apply_env_overrides();
    if let Some(ref stack) = cli.stack {
        cfg.stack_name = stack.clone();
    }
    Ok(cfg)
}


fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}


fn aws(cfg: &ClusterConfig) -> AwsCli {
    AwsCli::new(&cfg.region, cfg.profile.as_deref(), Box::new(ProcessRunner))
}


fn run(cli: Cli) -> Result<()> {
    let cfg = load_config(&cli)?;

    match cli.command {
        Commands::Launch => launch(&cfg),
        Commands::Resolve => {
            let handle = resolve_handle(&cfg)?;
            println!("stack:       {}", handle.stack_name);
            println!("coordinator: {}", handle.coordinator);
            for (rank, worker) in handle.workers.iter().enumerate() {
                println!("worker {:>3}: {}", rank + 1, worker);
            }
            Ok(())
        }
        Commands::Init => with_shell(&cfg, |sh| Ok(sh.full_init()?)),
        Commands::Run { all, worker, dir, continue_on_error, command } => {
            let command = command.join(" ");
            with_shell(&cfg, |sh| run_command(sh, all, worker, &dir, continue_on_error, &command))
        }
        Commands::Sync { local, remote, coordinator_only } => {
            let scope = if coordinator_only { SyncScope::CoordinatorOnly } else { SyncScope::All };
            with_shell(&cfg, |sh| Ok(sh.sync_directory(&local, &remote, scope)?))
        }
        Commands::Pull { remote, local } => with_shell(&cfg, |sh| Ok(sh.pull_directory(&remote, &local)?)),
        Commands::Copy { local, remote, coordinator_only } => with_shell(&cfg, |sh| {
            if coordinator_only {
                sh.copy_to_coordinator(&local, &remote)?;
            } else {
                sh.copy_to_all(&local, &remote)?;
            }
            Ok(())
        }),
        Commands::Fetch { remote, local, all, staging } => with_shell(&cfg, |sh| {
            if all {
                sh.fetch_from_all(&remote, &local, staging.as_deref())?;
            } else {
                sh.fetch_from_coordinator(&remote, &local)?;
            }
            Ok(())
        }),
        Commands::Hostfile { slots, install } => {
            let slots = slots.unwrap_or(cfg.slots_per_node);
            with_shell(&cfg, |sh| {
                let content = sh.hostfile(slots);
                println!("{}", content);
                if let Some(ref remote) = install {
                    install_hostfile(sh, &content, remote)?;
                }
                Ok(())
            })
        }
        Commands::Orphans { clean } => with_shell(&cfg, |sh| {
            let dirs = if clean { sh.clean_orphaned_staging()? } else { sh.list_orphaned_staging()? };
            for dir in &dirs {
                println!("{}{}", if clean { "removed " } else { "" }, dir);
            }
            Ok(())
        }),
        Commands::Ssh => {
            let handle = resolve_handle(&cfg)?;
            let sh = FleetShell::new(handle, CredentialSession::without_agent(&[]), Box::new(ProcessRunner));
            println!("{}", sh.ssh_hint());
            Ok(())
        }
        Commands::Teardown => {
            let provider = aws(&cfg);
            if !provider.exists(&cfg.stack_name)? {
                warn!(stack = %cfg.stack_name, "stack does not exist");
                return Ok(());
            }
            provider.delete(&cfg.stack_name)?;
            provider.wait_for_delete(&cfg.stack_name)?;
            println!("deleted {}", cfg.stack_name);
            Ok(())
        }
        Commands::Ami { image_type, version, region } => {
            let image_type: ImageType = image_type.parse()?;
            let region = region.unwrap_or_else(|| cfg.region.clone());
            let provider = AwsCli::new(&region, cfg.profile.as_deref(), Box::new(ProcessRunner));
            println!("{}", ami::lookup_dlami(&provider, image_type, &version)?);
            Ok(())
        }
    }
}


fn resolve_handle(cfg: &ClusterConfig) -> Result<fleet::ClusterHandle> {
    let provider = aws(cfg);
    fleet::resolve(&provider, &provider, &cfg.stack_name, &cfg.region, &cfg.username, &cfg.outputs)
        .with_context(|| format!("resolving stack {}", cfg.stack_name))
}


/// Build a shell, hand it to `f`, and shut it down however `f` exits.
fn with_shell<F>(cfg: &ClusterConfig, f: F) -> Result<()>
where
    F: FnOnce(&FleetShell) -> Result<()>,
{
    let handle = resolve_handle(cfg)?;
    let key_path = cfg.key_path(home_dir().as_deref());
    let key = load_private_key(&key_path).with_context(|| format!("reading key {}", key_path.display()))?;
    let session = CredentialSession::start(&ProcessRunner, &key)?;

    let shell = FleetShell::new(handle, session, Box::new(ProcessRunner))
        .with_ssh(cfg.ssh.port, cfg.ssh.options.clone())
        .with_staging_root(&cfg.staging_root);
    let result = f(&shell);
    shell.shut_down();
    result
}


fn run_command(
    sh: &FleetShell,
    all: bool,
    worker: Option<String>,
    dir: &str,
    continue_on_error: bool,
    command: &str,
) -> Result<()> {
    if !all {
        let target = worker.map(Target::Worker).unwrap_or(Target::Coordinator);
        sh.run_on(&target, command, dir, false)?;
        return Ok(());
    }

    let policy = if continue_on_error { FailurePolicy::ContinueOnError } else { FailurePolicy::FailFast };
    let outcomes = sh.run_on_all_with(policy, command, dir, false);
    let attempted = outcomes.len();
    let mut first_error = None;
    let mut failed = 0;
    for outcome in outcomes {
        if let Err(e) = outcome.result {
            failed += 1;
            eprintln!("{}: {}", outcome.target, e);
            first_error.get_or_insert(e);
        }
    }
    info!(attempted, failed, "run finished");
    match first_error {
        Some(e) if failed == 1 => Err(e.into()),
        Some(e) => Err(anyhow::Error::from(e).context(format!("{} of {} nodes failed", failed, attempted))),
        None => Ok(()),
    }
}


fn install_hostfile(sh: &FleetShell, content: &str, remote: &str) -> Result<()> {
    let local = std::env::temp_dir().join(format!("dlc-hostfile-{}", process::id()));
    std::fs::write(&local, format!("{}\n", content))?;
    let result = sh.copy_to_all(&local.to_string_lossy(), remote);
    let _ = std::fs::remove_file(&local);
    Ok(result?)
}


fn launch(cfg: &ClusterConfig) -> Result<()> {
    let template_path = cfg
        .template_path(home_dir().as_deref())
        .context("launch needs `template` in the cluster config")?;
    let mut template = ClusterTemplate::load(&template_path)
        .with_context(|| format!("loading template {}", template_path.display()))?;

    let provider = aws(cfg);
    let image_type: ImageType = cfg.image.image_type.parse()?;
    let ami_id = match cfg.image.ami_id {
        Some(ref id) => id.clone(),
        None => ami::lookup_dlami(&provider, image_type, &cfg.image.version)?,
    };
    info!(%ami_id, region = %cfg.region, "image");
    template.update_image_mapping(image_type.mapping_key(), &cfg.region, &ami_id)?;
    template.set_param("ImageType", image_type.mapping_key());

    let launch = &cfg.launch;
    if let Some(ref az) = launch.availability_zone {
        template.add_az_parameter(Some(az))?;
        template.set_param("AvailabilityZone", az);
    }
    if let Some(ref strategy) = launch.placement_group {
        template.add_placement_group(strategy)?;
    }
    if let Some(delete) = launch.delete_efs_on_finish {
        template.set_delete_efs_on_finish(delete)?;
    }
    if !launch.admin_cidr_blocks.is_empty() {
        template.remove_ssh_param()?;
        template.add_cidr_blocks_to_admin_ssh_sg(&launch.admin_cidr_blocks)?;
    }
    for (key, value) in &launch.parameters {
        template.set_param(key, value);
    }

    if provider.exists(&cfg.stack_name)? {
        bail!("stack {} already exists", cfg.stack_name);
    }
    let stack_id = provider.create(
        &cfg.stack_name,
        &template.template(),
        &template.params(),
        &template.capabilities(),
    )?;
    println!("created {} ({})", cfg.stack_name, stack_id);
    provider.wait_for_create(&cfg.stack_name)?;

    let handle = resolve_handle(cfg)?;
    println!("coordinator: {}", handle.coordinator);
    println!("workers:     {}", handle.workers.join(", "));
    Ok(())
}
