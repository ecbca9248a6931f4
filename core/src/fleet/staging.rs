//! Coordinator-side staging directories and the destructive-path guard.
//!
//! `fetch_from_all` aggregates per-node files in a staging directory on the
//! coordinator and removes it with `sudo rm -r`. Any path that will be
//! handed to a forced recursive delete goes through
//! `removal_looks_dangerous` first.

use uuid::Uuid;

use super::hop;
use crate::error::{ClusterError, Result};


/// Default parent directory for generated staging paths.
pub const STAGING_ROOT: &str = "/tmp";

/// Name prefix shared by all generated staging directories.
pub const STAGING_PREFIX: &str = "dlc_stage_";

/// Absolute roots under which a recursive delete is allowed.
pub const SAFE_REMOVAL_ROOTS: &[&str] = &["/tmp/", "/home/"];

/// Characters a remote shell would interpret inside a path.
const SHELL_METACHARACTERS: &str = ";&|$`'\"\\<>(){}[]*?!#";


/// Whether `sudo rm -r <path>` looks too dangerous to run.
///
/// - relative paths not anchored at `~/` mean different things on
///   different hosts;
/// - `~/` is the home directory itself;
/// - absolute paths must live strictly below one of `SAFE_REMOVAL_ROOTS`;
/// - `..` segments could climb out of an allowed root;
/// - whitespace or shell metacharacters anywhere would let the remote shell
///   split or rewrite the path.
pub fn removal_looks_dangerous(path: &str) -> bool {
    if path
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || SHELL_METACHARACTERS.contains(c))
    {
        return true;
    }

    if !path.starts_with('/') && !path.starts_with("~/") {
        return true;
    }
    if path.trim_end_matches('/') == "~" {
        return true;
    }
    if path.split('/').any(|segment| segment == "..") {
        return true;
    }
    if path.starts_with('/') {
        let under_safe_root = SAFE_REMOVAL_ROOTS.iter().any(|root| {
            path.strip_prefix(root)
                .map(|rest| !rest.trim_matches('/').is_empty())
                .unwrap_or(false)
        });
        if !under_safe_root {
            return true;
        }
    }
    false
}


// ---------------------------------------------------------------------------
// StagingPath
// ---------------------------------------------------------------------------

/// A staging directory on the coordinator that has passed the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPath(String);

impl StagingPath {
    /// A fresh, uniquely named directory under `root`.
    pub fn generate(root: &str) -> Result<StagingPath> {
        let path = format!(
            "{}/{}{}",
            root.trim_end_matches('/'),
            STAGING_PREFIX,
            Uuid::new_v4().simple()
        );
        StagingPath::explicit(&path)
    }

    /// Accept a caller-chosen path, rejecting it with `UnsafePath` if the
    /// guard flags it.
    pub fn explicit(path: &str) -> Result<StagingPath> {
        if removal_looks_dangerous(path) {
            return Err(ClusterError::UnsafePath(path.to_string()));
        }
        Ok(StagingPath(path.trim_end_matches('/').to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `sudo rm -r -f <path>`: tolerant clear before (re)creating.
    pub fn clear_command(&self) -> String {
        format!("sudo rm -r -f {}", hop::quote_dir(&self.0))
    }

    pub fn create_command(&self) -> String {
        format!("mkdir -p {}", hop::quote_dir(&self.0))
    }

    /// `sudo rm -r <path>`: final removal, which must find the directory.
    pub fn remove_command(&self) -> String {
        format!("sudo rm -r {}", hop::quote_dir(&self.0))
    }
}

impl std::fmt::Display for StagingPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}


/// Shell command that lists generated staging directories under `root`,
/// one per line, and succeeds when there are none.
pub fn list_command(root: &str) -> String {
    format!(
        "ls -d {}/{}* 2>/dev/null || true",
        root.trim_end_matches('/'),
        STAGING_PREFIX
    )
}

/// Parse `list_command` output, keeping only generated staging names.
pub fn parse_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim().trim_end_matches('/'))
        .filter(|line| {
            line.rsplit('/')
                .next()
                .map(|name| name.starts_with(STAGING_PREFIX))
                .unwrap_or(false)
        })
        .map(str::to_string)
        .collect()
}
