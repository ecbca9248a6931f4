//! Fleet directory: stack name → coordinator and worker addresses.
//!
//! The stack declares two outputs naming its autoscaling groups. The
//! coordinator group must contain exactly one instance (its public address
//! is the controller's entry point); every worker is addressed by its
//! private address, in the order the provider lists the group members.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ClusterError, Result};
use crate::provider::{GroupDirectory, StackLifecycle};


/// Default stack output naming the coordinator autoscaling group.
pub const COORDINATOR_OUTPUT: &str = "MasterAutoScalingGroup";

/// Default stack output naming the worker autoscaling group.
pub const WORKER_OUTPUT: &str = "WorkerAutoScalingGroup";


/// Which stack outputs hold the two group identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputKeys {
    pub coordinator: String,
    pub worker: String,
}

impl Default for OutputKeys {
    fn default() -> Self {
        OutputKeys {
            coordinator: COORDINATOR_OUTPUT.to_string(),
            worker: WORKER_OUTPUT.to_string(),
        }
    }
}


/// A resolved cluster. Holds cached addresses only, so it goes stale if the
/// stack is changed out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    pub stack_name: String,
    pub region: String,
    /// Public address of the coordinator.
    pub coordinator: String,
    /// Private worker addresses, in provider order (this is rank order).
    pub workers: Vec<String>,
    pub username: String,
}

impl ClusterHandle {
    pub fn node_count(&self) -> usize {
        1 + self.workers.len()
    }
}


/// Resolve `stack_name` into a `ClusterHandle`.
///
/// Fails with `Resolution` when either output is missing, the coordinator
/// group does not hold exactly one instance, or any address is missing.
/// Never returns a partial handle.
pub fn resolve(
    stacks: &dyn StackLifecycle,
    groups: &dyn GroupDirectory,
    stack_name: &str,
    region: &str,
    username: &str,
    keys: &OutputKeys,
) -> Result<ClusterHandle> {
    let description = stacks.describe(stack_name).map_err(|e| {
        ClusterError::Resolution(format!("cannot describe stack '{}': {}", stack_name, e))
    })?;

    let output = |key: &str| {
        description.outputs.get(key).cloned().ok_or_else(|| {
            ClusterError::Resolution(format!(
                "stack '{}' has no '{}' output",
                stack_name, key
            ))
        })
    };
    let coordinator_group = output(&keys.coordinator)?;
    let worker_group = output(&keys.worker)?;
    debug!(%coordinator_group, %worker_group, "stack groups");

    let members = groups
        .list_group_members(&coordinator_group)
        .map_err(|e| lookup_failed(&format!("group '{}'", coordinator_group), e))?;
    let coordinator_id = match members.as_slice() {
        [only] => only,
        _ => {
            return Err(ClusterError::Resolution(format!(
                "coordinator group '{}' must have exactly one instance, found {}",
                coordinator_group,
                members.len()
            )))
        }
    };
    let coordinator = groups
        .public_address(coordinator_id)
        .map_err(|e| lookup_failed(&format!("instance '{}'", coordinator_id), e))?
        .ok_or_else(|| {
            ClusterError::Resolution(format!(
                "coordinator instance '{}' has no public address",
                coordinator_id
            ))
        })?;

    let mut workers = Vec::new();
    let worker_ids = groups
        .list_group_members(&worker_group)
        .map_err(|e| lookup_failed(&format!("group '{}'", worker_group), e))?;
    for id in worker_ids {
        let address = groups
            .private_address(&id)
            .map_err(|e| lookup_failed(&format!("instance '{}'", id), e))?
            .ok_or_else(|| {
                ClusterError::Resolution(format!("worker instance '{}' has no private address", id))
            })?;
        workers.push(address);
    }

    info!(stack = stack_name, %coordinator, workers = workers.len(), "cluster resolved");
    Ok(ClusterHandle {
        stack_name: stack_name.to_string(),
        region: region.to_string(),
        coordinator,
        workers,
        username: username.to_string(),
    })
}

fn lookup_failed(what: &str, err: ClusterError) -> ClusterError {
    match err {
        ClusterError::Resolution(_) => err,
        other => ClusterError::Resolution(format!("cannot look up {}: {}", what, other)),
    }
}
