//! CloudFormation template builder.
//!
//! `ClusterTemplate` holds the stack document, the parameter list and the
//! capability list that are handed to `StackLifecycle::create`. The edit
//! helpers touch well-known sections of the cluster template
//! (`PrivateSubnet`, the two autoscaling groups, `FileSystem`,
//! `AdminSSHSecurityGroup`); a missing section is a `Template` error.

use std::path::Path;

use serde_json::{json, Map, Value};

use crate::error::{ClusterError, Result};
use crate::provider::StackParameter;


/// Capability needed because the template creates named IAM resources.
pub const NAMED_IAM: &str = "CAPABILITY_NAMED_IAM";


#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTemplate {
    template: Value,
    params: Vec<StackParameter>,
    capabilities: Vec<String>,
}

impl ClusterTemplate {
    pub fn from_value(template: Value) -> Result<Self> {
        if !template.is_object() {
            return Err(ClusterError::Template("template document must be a JSON object".into()));
        }
        Ok(ClusterTemplate {
            template,
            params: Vec::new(),
            capabilities: vec![NAMED_IAM.to_string()],
        })
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        Self::from_value(serde_json::from_reader(reader)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Template(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_value(serde_json::from_str(&content)?)
    }

    // -- Accessors (clones) --

    pub fn template(&self) -> Value {
        self.template.clone()
    }

    pub fn params(&self) -> Vec<StackParameter> {
        self.params.clone()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    // -- Parameters --

    pub fn add_param(&mut self, key: &str, value: &str) {
        self.params.push(StackParameter::new(key, value));
    }

    pub fn add_params(&mut self, pairs: &[(&str, &str)]) {
        for (key, value) in pairs {
            self.add_param(key, value);
        }
    }

    /// Replace the value of `key`, appending it if absent.
    pub fn set_param(&mut self, key: &str, value: &str) {
        match self.params.iter_mut().find(|p| p.key == key) {
            Some(p) => p.value = value.to_string(),
            None => self.add_param(key, value),
        }
    }

    // -- Document edits --

    /// Walk `path` from the document root to an object.
    fn section_mut(&mut self, path: &[&str]) -> Result<&mut Map<String, Value>> {
        let mut node = &mut self.template;
        for key in path {
            node = node.get_mut(*key).ok_or_else(|| {
                ClusterError::Template(format!("template has no '{}'", path.join(".")))
            })?;
        }
        node.as_object_mut().ok_or_else(|| {
            ClusterError::Template(format!("'{}' is not an object", path.join(".")))
        })
    }

    /// Point `Mappings.<image_type>.<region>` at `ami_id`.
    pub fn update_image_mapping(&mut self, image_type: &str, region: &str, ami_id: &str) -> Result<()> {
        self.section_mut(&["Mappings", image_type])?
            .insert(region.to_string(), json!({ "AMI": ami_id }));
        Ok(())
    }

    pub fn update_image_mappings(&mut self, mappings: &[(&str, &str, &str)]) -> Result<()> {
        for (image_type, region, ami_id) in mappings {
            self.update_image_mapping(image_type, region, ami_id)?;
        }
        Ok(())
    }

    /// Add an `AvailabilityZone` parameter and pin the private subnet to it.
    pub fn add_az_parameter(&mut self, default: Option<&str>) -> Result<()> {
        let mut param = json!({
            "Description": "The availability zone for your instances to be launched in.",
            "Type": "AWS::EC2::AvailabilityZone::Name",
        });
        if let Some(az) = default {
            param["Default"] = json!(az);
        }
        self.section_mut(&["Resources", "PrivateSubnet", "Properties"])?
            .insert("AvailabilityZone".into(), json!({ "Ref": "AvailabilityZone" }));
        self.section_mut(&["Parameters"])?
            .insert("AvailabilityZone".into(), param);
        Ok(())
    }

    /// Add a placement group and put both autoscaling groups in it.
    pub fn add_placement_group(&mut self, strategy: &str) -> Result<()> {
        for group in ["MasterAutoScalingGroup", "WorkerAutoScalingGroup"] {
            self.section_mut(&["Resources", group, "Properties"])?
                .insert("PlacementGroup".into(), json!({ "Ref": "PlacementGroup" }));
        }
        self.section_mut(&["Resources"])?.insert(
            "PlacementGroup".into(),
            json!({
                "Type": "AWS::EC2::PlacementGroup",
                "Properties": { "Strategy": strategy },
            }),
        );
        Ok(())
    }

    /// Whether the shared filesystem is deleted with the stack.
    pub fn set_delete_efs_on_finish(&mut self, delete: bool) -> Result<()> {
        let policy = if delete { "Delete" } else { "Retain" };
        self.section_mut(&["Resources", "FileSystem"])?
            .insert("DeletionPolicy".into(), json!(policy));
        Ok(())
    }

    fn admin_ssh_ingress(&mut self) -> Result<&mut Vec<Value>> {
        self.section_mut(&["Resources", "AdminSSHSecurityGroup", "Properties"])?
            .get_mut("SecurityGroupIngress")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| {
                ClusterError::Template("AdminSSHSecurityGroup has no SecurityGroupIngress list".into())
            })
    }

    /// Allow ssh (tcp/22) from `cidr`.
    pub fn add_cidr_block_to_admin_ssh_sg(&mut self, cidr: &str) -> Result<()> {
        self.admin_ssh_ingress()?.push(json!({
            "IpProtocol": "tcp",
            "FromPort": "22",
            "ToPort": "22",
            "CidrIp": cidr,
        }));
        Ok(())
    }

    pub fn add_cidr_blocks_to_admin_ssh_sg(&mut self, cidrs: &[String]) -> Result<()> {
        for cidr in cidrs {
            self.add_cidr_block_to_admin_ssh_sg(cidr)?;
        }
        Ok(())
    }

    /// Drop the `SSHLocation` parameter and every ingress rule that
    /// references it.
    pub fn remove_ssh_param(&mut self) -> Result<()> {
        self.section_mut(&["Parameters"])?
            .remove("SSHLocation")
            .ok_or_else(|| ClusterError::Template("template has no 'Parameters.SSHLocation'".into()))?;
        self.admin_ssh_ingress()?.retain(|rule| {
            rule.get("CidrIp").and_then(|c| c.get("Ref")).and_then(Value::as_str) != Some("SSHLocation")
        });
        Ok(())
    }

    // -- Rendering --

    /// Template and parameters as one pretty-printed document.
    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&json!({
            "Template": self.template,
            "Params": self.params,
        }))?)
    }
}
