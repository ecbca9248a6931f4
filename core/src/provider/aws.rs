//! AWS CLI backed provider.
//!
//! `AwsCli` implements `StackLifecycle`, `GroupDirectory` and `ImageCatalog`
//! by running `aws ... --output json` through a `CommandRunner` and parsing
//! the JSON responses. Waiting is delegated to `aws cloudformation wait`.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, info};

use super::ami::{ImageCatalog, ImageRecord};
use super::{GroupDirectory, StackDescription, StackLifecycle, StackParameter};
use crate::error::{ClusterError, Result};
use crate::infrastructure::runner::{CommandRunner, Invocation};


// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateStackResponse {
    stack_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksResponse {
    #[serde(default)]
    stacks: Vec<StackRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackRecord {
    stack_id: String,
    stack_status: String,
    #[serde(default)]
    outputs: Vec<OutputRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OutputRecord {
    output_key: String,
    output_value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeGroupsResponse {
    #[serde(default)]
    auto_scaling_groups: Vec<GroupRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupRecord {
    #[serde(default)]
    instances: Vec<GroupInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupInstance {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<InstanceRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceRecord {
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImagesResponse {
    #[serde(default)]
    images: Vec<ImageRecord>,
}


// ---------------------------------------------------------------------------
// AwsCli
// ---------------------------------------------------------------------------

/// Provider backed by the `aws` command-line tool.
pub struct AwsCli {
    region: String,
    profile: Option<String>,
    runner: Box<dyn CommandRunner>,
}

impl AwsCli {
    pub fn new(region: &str, profile: Option<&str>, runner: Box<dyn CommandRunner>) -> Self {
        AwsCli {
            region: region.to_string(),
            profile: profile.map(str::to_string),
            runner,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn invocation(&self, service: &str, operation: &str) -> Invocation {
        let mut inv = Invocation::new("aws")
            .args([service, operation])
            .args(["--region", self.region.as_str()]);
        if let Some(ref profile) = self.profile {
            inv = inv.args(["--profile", profile.as_str()]);
        }
        inv
    }

    /// Run an invocation; a non-zero exit becomes `Provider` with stderr.
    fn call(&self, operation: &str, invocation: Invocation) -> Result<String> {
        debug!(operation, "aws call");
        let out = self.runner.run(&invocation)?;
        if !out.success() {
            return Err(ClusterError::Provider {
                operation: operation.to_string(),
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    fn call_json<T: for<'de> Deserialize<'de>>(&self, operation: &str, invocation: Invocation) -> Result<T> {
        let stdout = self.call(operation, invocation.args(["--output", "json"]))?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

impl StackLifecycle for AwsCli {
    fn create(
        &self,
        name: &str,
        template: &serde_json::Value,
        params: &[StackParameter],
        capabilities: &[String],
    ) -> Result<String> {
        let mut inv = self
            .invocation("cloudformation", "create-stack")
            .args(["--stack-name", name])
            .arg("--template-body")
            .arg(serde_json::to_string(template)?);
        if !params.is_empty() {
            inv = inv.arg("--parameters").arg(serde_json::to_string(params)?);
        }
        if !capabilities.is_empty() {
            inv = inv.arg("--capabilities").args(capabilities.iter().cloned());
        }
        let resp: CreateStackResponse = self.call_json("create-stack", inv)?;
        info!(stack = name, id = %resp.stack_id, "stack submitted");
        Ok(resp.stack_id)
    }

    fn wait_for_create(&self, name: &str) -> Result<()> {
        info!(stack = name, "waiting for stack-create-complete");
        let inv = self
            .invocation("cloudformation", "wait")
            .arg("stack-create-complete")
            .args(["--stack-name", name]);
        self.call("wait stack-create-complete", inv).map(|_| ())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let inv = self
            .invocation("cloudformation", "delete-stack")
            .args(["--stack-name", name]);
        self.call("delete-stack", inv).map(|_| ())
    }

    fn wait_for_delete(&self, name: &str) -> Result<()> {
        info!(stack = name, "waiting for stack-delete-complete");
        let inv = self
            .invocation("cloudformation", "wait")
            .arg("stack-delete-complete")
            .args(["--stack-name", name]);
        self.call("wait stack-delete-complete", inv).map(|_| ())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        match self.describe(name) {
            Ok(_) => Ok(true),
            Err(ClusterError::Provider { ref detail, .. }) if detail.contains("does not exist") => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn describe(&self, name: &str) -> Result<StackDescription> {
        let inv = self
            .invocation("cloudformation", "describe-stacks")
            .args(["--stack-name", name]);
        let resp: DescribeStacksResponse = self.call_json("describe-stacks", inv)?;
        parse_stack(resp, name)
    }
}

fn parse_stack(resp: DescribeStacksResponse, name: &str) -> Result<StackDescription> {
    let stack = resp.stacks.into_iter().next().ok_or_else(|| ClusterError::Provider {
        operation: "describe-stacks".into(),
        detail: format!("Stack with id {} does not exist", name),
    })?;
    let outputs: BTreeMap<String, String> = stack
        .outputs
        .into_iter()
        .map(|o| (o.output_key, o.output_value))
        .collect();
    Ok(StackDescription {
        stack_id: stack.stack_id,
        status: stack.stack_status,
        outputs,
    })
}

impl GroupDirectory for AwsCli {
    fn list_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let inv = self
            .invocation("autoscaling", "describe-auto-scaling-groups")
            .args(["--auto-scaling-group-names", group_id]);
        let resp: DescribeGroupsResponse = self.call_json("describe-auto-scaling-groups", inv)?;
        let group = resp.auto_scaling_groups.into_iter().next().ok_or_else(|| {
            ClusterError::Resolution(format!("autoscaling group '{}' not found", group_id))
        })?;
        Ok(group.instances.into_iter().map(|i| i.instance_id).collect())
    }

    fn public_address(&self, instance_id: &str) -> Result<Option<String>> {
        Ok(self.describe_instance(instance_id)?.public_ip_address)
    }

    fn private_address(&self, instance_id: &str) -> Result<Option<String>> {
        Ok(self.describe_instance(instance_id)?.private_ip_address)
    }
}

impl AwsCli {
    fn describe_instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        let inv = self
            .invocation("ec2", "describe-instances")
            .args(["--instance-ids", instance_id]);
        let resp: DescribeInstancesResponse = self.call_json("describe-instances", inv)?;
        resp.reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .next()
            .ok_or_else(|| ClusterError::Provider {
                operation: "describe-instances".into(),
                detail: format!("instance '{}' not found", instance_id),
            })
    }
}

impl ImageCatalog for AwsCli {
    fn describe_images(&self, name_prefix: &str) -> Result<Vec<ImageRecord>> {
        let inv = self
            .invocation("ec2", "describe-images")
            .args(["--executable-users", "all"])
            .arg("--filters")
            .arg(format!("Name=name,Values={}*", name_prefix))
            .arg("Name=owner-alias,Values=amazon");
        let resp: DescribeImagesResponse = self.call_json("describe-images", inv)?;
        Ok(resp.images)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::runner::MockRunner;

    fn cli(runner: &MockRunner) -> AwsCli {
        AwsCli::new("us-east-1", None, Box::new(runner.clone()))
    }

    const DESCRIBE: &str = r#"{
        "Stacks": [{
            "StackId": "arn:aws:cloudformation:us-east-1:1:stack/c1/abc",
            "StackName": "c1",
            "StackStatus": "CREATE_COMPLETE",
            "Outputs": [
                {"OutputKey": "MasterAutoScalingGroup", "OutputValue": "asg-1"},
                {"OutputKey": "WorkerAutoScalingGroup", "OutputValue": "asg-2"}
            ]
        }]
    }"#;

    // -- Stacks --

    #[test]
    fn describe_parses_outputs() {
        let runner = MockRunner::with_responses(vec![MockRunner::ok(DESCRIBE)]);
        let desc = cli(&runner).describe("c1").unwrap();
        assert_eq!(desc.status, "CREATE_COMPLETE");
        assert_eq!(desc.outputs["MasterAutoScalingGroup"], "asg-1");
        assert_eq!(desc.outputs["WorkerAutoScalingGroup"], "asg-2");
        assert_eq!(
            runner.executed_commands()[0],
            "aws cloudformation describe-stacks --region us-east-1 --stack-name c1 --output json"
        );
    }

    #[test]
    fn exists_maps_missing_stack_to_false() {
        let runner = MockRunner::with_responses(vec![MockRunner::exit(
            255,
            "An error occurred (ValidationError) when calling the DescribeStacks operation: Stack with id c9 does not exist",
        )]);
        assert!(!cli(&runner).exists("c9").unwrap());
    }

    #[test]
    fn exists_propagates_other_failures() {
        let runner = MockRunner::with_responses(vec![MockRunner::exit(255, "ExpiredToken")]);
        assert!(cli(&runner).exists("c1").is_err());
    }

    #[test]
    fn create_passes_parameters_and_capabilities_as_json() {
        let runner = MockRunner::with_responses(vec![MockRunner::ok(r#"{"StackId": "arn:stack/c1"}"#)]);
        let id = cli(&runner)
            .create(
                "c1",
                &serde_json::json!({"Resources": {}}),
                &[StackParameter::new("WorkerCount", "3")],
                &["CAPABILITY_NAMED_IAM".to_string()],
            )
            .unwrap();
        assert_eq!(id, "arn:stack/c1");

        let inv = &runner.invocations()[0];
        let pos = inv.args.iter().position(|a| a == "--parameters").unwrap();
        assert_eq!(inv.args[pos + 1], r#"[{"ParameterKey":"WorkerCount","ParameterValue":"3"}]"#);
        let pos = inv.args.iter().position(|a| a == "--template-body").unwrap();
        assert_eq!(inv.args[pos + 1], r#"{"Resources":{}}"#);
        assert!(inv.args.contains(&"CAPABILITY_NAMED_IAM".to_string()));
    }

    #[test]
    fn wait_uses_cli_waiter() {
        let runner = MockRunner::new();
        let aws = AwsCli::new("us-west-2", Some("research"), Box::new(runner.clone()));
        aws.wait_for_create("c1").unwrap();
        assert_eq!(
            runner.executed_commands()[0],
            "aws cloudformation wait --region us-west-2 --profile research stack-create-complete --stack-name c1"
        );
    }

    #[test]
    fn failed_wait_is_a_provider_error() {
        let runner = MockRunner::with_responses(vec![MockRunner::exit(255, "Waiter StackCreateComplete failed")]);
        let err = cli(&runner).wait_for_create("c1").unwrap_err();
        assert!(matches!(err, ClusterError::Provider { ref detail, .. } if detail.contains("Waiter")));
    }

    // -- Groups and instances --

    #[test]
    fn group_members_keep_provider_order() {
        let runner = MockRunner::with_responses(vec![MockRunner::ok(
            r#"{"AutoScalingGroups": [{"Instances": [{"InstanceId": "i-bbb"}, {"InstanceId": "i-ccc"}]}]}"#,
        )]);
        assert_eq!(cli(&runner).list_group_members("asg-2").unwrap(), vec!["i-bbb", "i-ccc"]);
    }

    #[test]
    fn unknown_group_is_a_resolution_error() {
        let runner = MockRunner::with_responses(vec![MockRunner::ok(r#"{"AutoScalingGroups": []}"#)]);
        assert!(matches!(
            cli(&runner).list_group_members("asg-x"),
            Err(ClusterError::Resolution(_))
        ));
    }

    #[test]
    fn instance_addresses() {
        let body = r#"{"Reservations": [{"Instances": [{"PublicIpAddress": "1.2.3.4", "PrivateIpAddress": "10.0.0.4"}]}]}"#;
        let runner = MockRunner::with_responses(vec![MockRunner::ok(body), MockRunner::ok(body)]);
        let aws = cli(&runner);
        assert_eq!(aws.public_address("i-aaa").unwrap().as_deref(), Some("1.2.3.4"));
        assert_eq!(aws.private_address("i-aaa").unwrap().as_deref(), Some("10.0.0.4"));
    }

    #[test]
    fn instance_without_public_address() {
        let runner = MockRunner::with_responses(vec![MockRunner::ok(
            r#"{"Reservations": [{"Instances": [{"PrivateIpAddress": "10.0.0.4"}]}]}"#,
        )]);
        assert_eq!(cli(&runner).public_address("i-aaa").unwrap(), None);
    }

    // -- Images --

    #[test]
    fn describe_images_filters_by_prefix() {
        let runner = MockRunner::with_responses(vec![MockRunner::ok(
            r#"{"Images": [{"Name": "Deep Learning AMI (Ubuntu) Version 12.0", "ImageId": "ami-12"}]}"#,
        )]);
        let images = cli(&runner).describe_images("Deep Learning AMI (Ubuntu) Version ").unwrap();
        assert_eq!(images[0].image_id, "ami-12");
        let inv = &runner.invocations()[0];
        assert!(inv.args.contains(&"Name=name,Values=Deep Learning AMI (Ubuntu) Version *".to_string()));
    }

    #[test]
    fn malformed_json_is_reported() {
        let runner = MockRunner::with_responses(vec![MockRunner::ok("not json")]);
        assert!(matches!(cli(&runner).describe("c1"), Err(ClusterError::Json(_))));
    }
}
