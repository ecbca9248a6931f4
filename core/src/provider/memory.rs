//! In-memory provider for tests.
//!
//! Holds stacks, groups and instance addresses in maps and records every
//! call, making it easy to write deterministic tests for resolution and
//! provisioning flows.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{GroupDirectory, StackDescription, StackLifecycle, StackParameter};
use crate::error::{ClusterError, Result};


#[derive(Debug, Clone, Default)]
struct Instance {
    public: Option<String>,
    private: Option<String>,
}

/// A test-double cloud implementing both provider traits.
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    stacks: Mutex<BTreeMap<String, StackDescription>>,
    groups: BTreeMap<String, Vec<String>>,
    instances: BTreeMap<String, Instance>,
    calls: Mutex<Vec<String>>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing stack with the given outputs.
    pub fn with_stack(self, name: &str, outputs: &[(&str, &str)]) -> Self {
        let description = StackDescription {
            stack_id: format!("arn:stack/{}", name),
            status: "CREATE_COMPLETE".into(),
            outputs: outputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.lock_stacks().insert(name.to_string(), description);
        self
    }

    pub fn with_group(mut self, group: &str, members: &[&str]) -> Self {
        self.groups
            .insert(group.to_string(), members.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn with_instance(mut self, id: &str, public: Option<&str>, private: Option<&str>) -> Self {
        self.instances.insert(
            id.to_string(),
            Instance {
                public: public.map(str::to_string),
                private: private.map(str::to_string),
            },
        );
        self
    }

    /// Every provider call so far, as `operation:argument`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn lock_stacks(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StackDescription>> {
        self.stacks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn instance(&self, id: &str) -> Result<&Instance> {
        self.instances.get(id).ok_or_else(|| ClusterError::Provider {
            operation: "describe-instances".into(),
            detail: format!("instance '{}' not found", id),
        })
    }
}

impl StackLifecycle for InMemoryCloud {
    fn create(
        &self,
        name: &str,
        _template: &serde_json::Value,
        params: &[StackParameter],
        _capabilities: &[String],
    ) -> Result<String> {
        self.record(format!("create:{}:{}", name, params.len()));
        let mut stacks = self.lock_stacks();
        if stacks.contains_key(name) {
            return Err(ClusterError::Provider {
                operation: "create-stack".into(),
                detail: format!("stack '{}' already exists", name),
            });
        }
        let id = format!("arn:stack/{}", name);
        stacks.insert(
            name.to_string(),
            StackDescription {
                stack_id: id.clone(),
                status: "CREATE_IN_PROGRESS".into(),
                outputs: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn wait_for_create(&self, name: &str) -> Result<()> {
        self.record(format!("wait_for_create:{}", name));
        match self.lock_stacks().get_mut(name) {
            Some(stack) => {
                stack.status = "CREATE_COMPLETE".into();
                Ok(())
            }
            None => Err(ClusterError::Provider {
                operation: "wait stack-create-complete".into(),
                detail: format!("stack '{}' does not exist", name),
            }),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.record(format!("delete:{}", name));
        self.lock_stacks().remove(name);
        Ok(())
    }

    fn wait_for_delete(&self, name: &str) -> Result<()> {
        self.record(format!("wait_for_delete:{}", name));
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.record(format!("exists:{}", name));
        Ok(self.lock_stacks().contains_key(name))
    }

    fn describe(&self, name: &str) -> Result<StackDescription> {
        self.record(format!("describe:{}", name));
        self.lock_stacks()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::Provider {
                operation: "describe-stacks".into(),
                detail: format!("stack '{}' does not exist", name),
            })
    }
}

impl GroupDirectory for InMemoryCloud {
    fn list_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        self.record(format!("members:{}", group_id));
        self.groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| ClusterError::Provider {
                operation: "describe-auto-scaling-groups".into(),
                detail: format!("group '{}' not found", group_id),
            })
    }

    fn public_address(&self, instance_id: &str) -> Result<Option<String>> {
        self.record(format!("public:{}", instance_id));
        Ok(self.instance(instance_id)?.public.clone())
    }

    fn private_address(&self, instance_id: &str) -> Result<Option<String>> {
        self.record(format!("private:{}", instance_id));
        Ok(self.instance(instance_id)?.private.clone())
    }
}
