//! dl-cluster core: provision a deep learning training cluster and fan
//! commands and files out across its coordinator and workers.

pub mod config;
pub mod credential;
pub mod error;
pub mod fleet;
pub mod infrastructure;
pub mod provider;
pub mod template;

pub use error::{ClusterError, Result};
