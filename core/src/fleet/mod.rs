//! Fleet operations: the coordinator channel, address resolution and the
//! sequential fan-out built on top of them.
//!
//! All process spawning goes through a `CommandRunner`, so every module here
//! is tested by inspecting the recorded ssh / rsync / scp invocations.

pub mod channel;
pub mod directory;
pub mod hop;
pub mod shell;
pub mod staging;
pub mod transfer;

pub use channel::RemoteChannel;
pub use directory::{resolve, ClusterHandle, OutputKeys};
pub use shell::{FailurePolicy, FleetShell, SyncScope, Target, TargetOutcome};
pub use staging::{removal_looks_dangerous, StagingPath};
