//! Command templating for the coordinator → worker hop.
//!
//! Workers sit on a private network, so a worker command is executed on the
//! coordinator wrapped in an outer `ssh -A user@worker '<command>'`. The
//! wrapper is a `CommandTemplate` with declared `{placeholder}`s; rendering
//! fails unless exactly the declared placeholders are supplied.

use crate::error::{ClusterError, Result};


/// Outer command used to reach a worker from the coordinator, with the
/// caller's identity forwarded (`-A`).
pub const WORKER_HOP: &str = "ssh -A {user}@{host} {command}";


// ---------------------------------------------------------------------------
// CommandTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Slot(String),
}

/// A command string with named `{placeholder}` slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pieces: Vec<Piece>,
    placeholders: Vec<String>,
}

impl CommandTemplate {
    /// Parse a template. Placeholder names are `[A-Za-z_][A-Za-z0-9_]*`;
    /// unbalanced braces are rejected.
    pub fn parse(template: &str) -> Result<CommandTemplate> {
        let mut pieces = Vec::new();
        let mut placeholders: Vec<String> = Vec::new();
        let mut text = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for n in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed || !is_placeholder_name(&name) {
                        return Err(ClusterError::Template(format!(
                            "bad placeholder '{{{}' in command template '{}'",
                            name, template
                        )));
                    }
                    if !text.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut text)));
                    }
                    if !placeholders.contains(&name) {
                        placeholders.push(name.clone());
                    }
                    pieces.push(Piece::Slot(name));
                }
                '}' => {
                    return Err(ClusterError::Template(format!(
                        "unbalanced '}}' in command template '{}'",
                        template
                    )));
                }
                _ => text.push(c),
            }
        }
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }

        Ok(CommandTemplate { pieces, placeholders })
    }

    /// Declared placeholder names, in first-appearance order.
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Substitute values. Every declared placeholder must be supplied and
    /// no undeclared name may be passed.
    pub fn render(&self, values: &[(&str, &str)]) -> Result<String> {
        for (name, _) in values {
            if !self.placeholders.iter().any(|p| p == name) {
                return Err(ClusterError::Template(format!(
                    "unknown placeholder '{}'",
                    name
                )));
            }
        }

        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(t) => out.push_str(t),
                Piece::Slot(name) => {
                    let value = values
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, v)| *v)
                        .ok_or_else(|| {
                            ClusterError::Template(format!("missing value for '{{{}}}'", name))
                        })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}


// ---------------------------------------------------------------------------
// Quoting
// ---------------------------------------------------------------------------

/// Quote a string as a single POSIX shell word. Strings made only of
/// characters with no special meaning are returned unchanged.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if plain {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Render a working directory for `cd`, keeping a leading `~` outside the
/// quotes so the remote shell still expands it.
pub fn quote_dir(dir: &str) -> String {
    if dir == "~" {
        return dir.to_string();
    }
    match dir.strip_prefix("~/") {
        Some("") => "~/".to_string(),
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(dir),
    }
}

/// `cd <dir> && <command>`: the working directory is explicit on every call.
pub fn in_dir(command: &str, working_dir: &str) -> String {
    format!("cd {} && {}", quote_dir(working_dir), command)
}

/// Wrap `command` for execution on `host` through the coordinator. The
/// working directory is applied on the worker itself.
pub fn worker_command(user: &str, host: &str, command: &str, working_dir: &str) -> Result<String> {
    let inner = shell_quote(&in_dir(command, working_dir));
    CommandTemplate::parse(WORKER_HOP)?.render(&[
        ("user", user),
        ("host", host),
        ("command", &inner),
    ])
}
