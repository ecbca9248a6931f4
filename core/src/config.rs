//! Cluster configuration file.
//!
//! One YAML file describes how to launch and reach a cluster: stack name,
//! region, login user, key file, template path and the launch-time template
//! edits. Every field has a default, so an empty file is valid.
//! `DLC_STACK_NAME` and `DLC_REGION` override the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::fleet::channel::DEFAULT_SSH_OPTIONS;
use crate::fleet::directory::OutputKeys;
use crate::fleet::staging::STAGING_ROOT;


pub const STACK_NAME_VAR: &str = "DLC_STACK_NAME";
pub const REGION_VAR: &str = "DLC_REGION";


/// Top-level cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub stack_name: String,
    pub region: String,
    /// Named AWS CLI profile, if not the default credentials.
    pub profile: Option<String>,
    /// Login user on every node.
    pub username: String,
    /// Private key registered with the session agent.
    pub key_file: String,
    /// CloudFormation template used by `launch`.
    pub template: Option<String>,
    pub outputs: OutputKeys,
    pub ssh: SshSettings,
    /// Parent directory for generated staging paths on the coordinator.
    pub staging_root: String,
    /// Slots per node in the generated MPI hostfile.
    pub slots_per_node: u32,
    pub image: ImageSettings,
    pub launch: LaunchSettings,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            stack_name: "dl-cluster".into(),
            region: "us-east-1".into(),
            profile: None,
            username: "ubuntu".into(),
            key_file: "~/.ssh/dl-cluster.pem".into(),
            template: None,
            outputs: OutputKeys::default(),
            ssh: SshSettings::default(),
            staging_root: STAGING_ROOT.into(),
            slots_per_node: 8,
            image: ImageSettings::default(),
            launch: LaunchSettings::default(),
        }
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub port: u16,
    /// `-o` options for every ssh, scp and rsync call from the controller.
    pub options: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        SshSettings {
            port: 22,
            options: DEFAULT_SSH_OPTIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}


/// Which Deep Learning AMI the template's image mapping points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// `Ubuntu` or `AmazonLinux`.
    #[serde(rename = "type")]
    pub image_type: String,
    /// `latest` or a pinned version such as `21.2`.
    pub version: String,
    /// Skip the catalog lookup and use this AMI.
    pub ami_id: Option<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        ImageSettings {
            image_type: "Ubuntu".into(),
            version: "latest".into(),
            ami_id: None,
        }
    }
}


/// Template edits and parameters applied by `launch`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// Stack parameters, e.g. `WorkerCount`, `InstanceType`, `KeyName`.
    pub parameters: BTreeMap<String, String>,
    pub availability_zone: Option<String>,
    /// Placement group strategy (`cluster`, `spread`, ...).
    pub placement_group: Option<String>,
    pub delete_efs_on_finish: Option<bool>,
    /// Replace the `SSHLocation` parameter with these admin CIDR blocks.
    pub admin_cidr_blocks: Vec<String>,
}


/// Load a cluster config from a YAML file.
pub fn load(path: &Path) -> Result<ClusterConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ClusterError::Config(format!("cannot read '{}': {}", path.display(), e)))?;
    parse(&content)
}

/// Parse a cluster config from a YAML string.
pub fn parse(content: &str) -> Result<ClusterConfig> {
    if content.trim().is_empty() {
        return Ok(ClusterConfig::default());
    }
    serde_yaml::from_str(content)
        .map_err(|e| ClusterError::Config(format!("invalid cluster config: {}", e)))
}


impl ClusterConfig {
    /// Apply `DLC_STACK_NAME` / `DLC_REGION` through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(STACK_NAME_VAR).filter(|v| !v.is_empty()) {
            self.stack_name = name;
        }
        if let Some(region) = lookup(REGION_VAR).filter(|v| !v.is_empty()) {
            self.region = region;
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// `key_file` with a leading `~/` expanded against `home`.
    pub fn key_path(&self, home: Option<&Path>) -> PathBuf {
        expand_home(&self.key_file, home)
    }

    pub fn template_path(&self, home: Option<&Path>) -> Option<PathBuf> {
        self.template.as_deref().map(|t| expand_home(t, home))
    }
}

fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let yaml = r#"
stack_name: bert-pretrain
region: us-west-2
profile: research
username: ec2-user
key_file: ~/.ssh/us-west-2.pem
template: ./cfn/deeplearning.template
outputs:
  coordinator: CoordinatorGroup
  worker: WorkerGroup
ssh:
  port: 2222
  options: [StrictHostKeyChecking=no]
staging_root: /home/ec2-user/stage
slots_per_node: 4
image:
  type: AmazonLinux
  version: "21.2"
launch:
  parameters:
    WorkerCount: "3"
    InstanceType: p3.16xlarge
  availability_zone: us-west-2b
  placement_group: cluster
  delete_efs_on_finish: true
  admin_cidr_blocks: [203.0.113.0/24]
"#;
        let cfg = parse(yaml).unwrap();
        assert_eq!(cfg.stack_name, "bert-pretrain");
        assert_eq!(cfg.region, "us-west-2");
        assert_eq!(cfg.profile.as_deref(), Some("research"));
        assert_eq!(cfg.username, "ec2-user");
        assert_eq!(cfg.outputs.coordinator, "CoordinatorGroup");
        assert_eq!(cfg.ssh.port, 2222);
        assert_eq!(cfg.ssh.options, vec!["StrictHostKeyChecking=no"]);
        assert_eq!(cfg.staging_root, "/home/ec2-user/stage");
        assert_eq!(cfg.slots_per_node, 4);
        assert_eq!(cfg.image.image_type, "AmazonLinux");
        assert_eq!(cfg.image.version, "21.2");
        assert_eq!(cfg.launch.parameters["WorkerCount"], "3");
        assert_eq!(cfg.launch.placement_group.as_deref(), Some("cluster"));
        assert_eq!(cfg.launch.delete_efs_on_finish, Some(true));
        assert_eq!(cfg.launch.admin_cidr_blocks, vec!["203.0.113.0/24"]);
    }

    #[test]
    fn parse_empty_gives_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg, ClusterConfig::default());
        assert_eq!(cfg.username, "ubuntu");
        assert_eq!(cfg.outputs.worker, "WorkerAutoScalingGroup");
        assert_eq!(cfg.staging_root, "/tmp");
        assert_eq!(cfg.ssh.options.len(), DEFAULT_SSH_OPTIONS.len());
    }

    #[test]
    fn parse_partial_keeps_nested_defaults() {
        let cfg = parse("outputs:\n  worker: Workers\n").unwrap();
        assert_eq!(cfg.outputs.worker, "Workers");
        assert_eq!(cfg.outputs.coordinator, "MasterAutoScalingGroup");
    }

    #[test]
    fn parse_invalid_fails() {
        let err = parse("slots_per_node: many\n").unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(load(Path::new("/nonexistent/cluster.yaml")).is_err());
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut cfg = ClusterConfig::default();
        cfg.apply_overrides(|key| match key {
            STACK_NAME_VAR => Some("from-env".into()),
            REGION_VAR => Some(String::new()),
            _ => None,
        });
        assert_eq!(cfg.stack_name, "from-env");
        assert_eq!(cfg.region, "us-east-1");
    }

    #[test]
    fn key_path_expands_home() {
        let cfg = ClusterConfig::default();
        assert_eq!(
            cfg.key_path(Some(Path::new("/home/me"))),
            PathBuf::from("/home/me/.ssh/dl-cluster.pem")
        );
        assert_eq!(cfg.key_path(None), PathBuf::from("~/.ssh/dl-cluster.pem"));
        assert_eq!(cfg.template_path(None), None);
    }
}
