//! Command runner abstraction for executing external tools.
//!
//! `CommandRunner` is the trait every component uses to start `ssh`, `rsync`,
//! `scp`, `ssh-agent` and the provider CLI. `ProcessRunner` is the production
//! implementation that spawns the program directly from an argument vector.
//! `MockRunner` is the test double that records invocations and returns
//! preset outputs.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use tracing::debug;


// ---------------------------------------------------------------------------
// Invocation / CommandOutput
// ---------------------------------------------------------------------------

/// A fully described external process: program, arguments, extra
/// environment, optional stdin payload, and whether output is captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    /// Capture stdout/stderr instead of streaming them to the terminal.
    pub capture: bool,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Invocation {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            capture: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn stdin(mut self, payload: Vec<u8>) -> Self {
        self.stdin = Some(payload);
        self
    }

    pub fn capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Human-readable command line, for logs and error messages. Never
    /// includes the stdin payload.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}


/// Exit status and (when captured) output of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code for error reporting; signal deaths are reported as -1.
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(-1)
    }
}


// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Trait for starting external processes. Returns `Err` only when the
/// process could not be started at all; a non-zero exit is a normal
/// `CommandOutput` for the caller to interpret.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput>;
}


/// Production runner that spawns the program directly (no `sh -c`).
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        debug!(command = %invocation.command_line(), "spawning");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        cmd.stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if invocation.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let mut child = cmd.spawn()?;
        let mut written = Ok(());
        if let Some(ref payload) = invocation.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                written = stdin.write_all(payload);
                // Dropping stdin closes the pipe so the child sees EOF.
            }
        }
        // Reap the child even when the write failed.
        let output = child.wait_with_output()?;
        written?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}


// ---------------------------------------------------------------------------
// MockRunner
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    responses: VecDeque<io::Result<CommandOutput>>,
    invocations: Vec<Invocation>,
}

/// Test-double runner that records invocations and returns pre-configured
/// responses in order. Clones share state, so a test can hand one clone to
/// the code under test and inspect the other.
#[derive(Clone, Default)]
pub struct MockRunner {
    state: Arc<Mutex<MockState>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<io::Result<CommandOutput>>) -> Self {
        let runner = MockRunner::new();
        for response in responses {
            runner.push(response);
        }
        runner
    }

    /// Queue one more response. Once the queue is empty every call succeeds
    /// with empty output.
    pub fn push(&self, response: io::Result<CommandOutput>) {
        self.lock().responses.push_back(response);
    }

    /// Successful exit with the given stdout.
    pub fn ok(stdout: &str) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    /// Non-zero exit with the given stderr.
    pub fn exit(code: i32, stderr: &str) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    /// Process could not be started.
    pub fn spawn_error(message: &str) -> io::Result<CommandOutput> {
        Err(io::Error::new(io::ErrorKind::NotFound, message.to_string()))
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    /// Recorded invocations rendered as command lines.
    pub fn executed_commands(&self) -> Vec<String> {
        self.lock()
            .invocations
            .iter()
            .map(Invocation::command_line)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panic inside a test while holding the lock must not hide the
        // recorded state from later assertions.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        let mut state = self.lock();
        state.invocations.push(invocation.clone());
        state
            .responses
            .pop_front()
            .unwrap_or_else(|| MockRunner::ok(""))
    }
}
