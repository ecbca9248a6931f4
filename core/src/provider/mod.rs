//! Infrastructure provider collaborators.
//!
//! The fleet logic only talks to the cloud through two traits:
//! `StackLifecycle` (declarative stack create / wait / describe) and
//! `GroupDirectory` (autoscaling group membership and instance addresses).
//! `aws::AwsCli` implements both by shelling out to the AWS CLI;
//! `memory::InMemoryCloud` is the deterministic fake used in tests.

pub mod ami;
pub mod aws;
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;


/// One stack parameter, in the provider's wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackParameter {
    #[serde(rename = "ParameterKey")]
    pub key: String,
    #[serde(rename = "ParameterValue")]
    pub value: String,
}

impl StackParameter {
    pub fn new(key: &str, value: &str) -> Self {
        StackParameter {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}


/// What `describe` reports about a stack.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackDescription {
    pub stack_id: String,
    pub status: String,
    /// Declared outputs, output key → output value.
    pub outputs: BTreeMap<String, String>,
}


/// Lifecycle of a declarative infrastructure stack.
pub trait StackLifecycle {
    /// Submit a stack. Returns the provider's stack id.
    fn create(
        &self,
        name: &str,
        template: &serde_json::Value,
        params: &[StackParameter],
        capabilities: &[String],
    ) -> Result<String>;

    /// Block until creation completes (or the provider reports failure).
    fn wait_for_create(&self, name: &str) -> Result<()>;

    fn delete(&self, name: &str) -> Result<()>;

    fn wait_for_delete(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> Result<bool>;

    fn describe(&self, name: &str) -> Result<StackDescription>;
}


/// Group membership and per-instance network addresses.
pub trait GroupDirectory {
    /// Instance ids in the group, in provider order.
    fn list_group_members(&self, group_id: &str) -> Result<Vec<String>>;

    fn public_address(&self, instance_id: &str) -> Result<Option<String>>;

    fn private_address(&self, instance_id: &str) -> Result<Option<String>>;
}
