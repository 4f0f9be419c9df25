// src/sys/invoker.rs

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::signal::unix::{Signal as UnixSignal, SignalKind, signal as unix_signal};
use tracing::{debug, info, warn};

use crate::error::InvokeError;
use crate::sys::secrets::ProviderCredential;
use crate::sys::traits::ProcessInvoker;

// ==============================================================================
// 1. Outcome
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Non-zero exit. Signal deaths are reported shell-style as `128 + signal`.
    Failure { code: i32 },
}

impl Outcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => Outcome::Success,
            Some(code) => Outcome::Failure { code },
            None => Outcome::Failure {
                code: 128 + status.signal().unwrap_or(0),
            },
        }
    }
}

// ==============================================================================
// 2. Declarative argument list
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArgEntry {
    Positional(String),
    Value { flag: String, value: String },
    Switch { flag: String, enabled: bool },
}

impl ArgEntry {
    fn flag(&self) -> Option<&str> {
        match self {
            ArgEntry::Positional(_) => None,
            ArgEntry::Value { flag, .. } | ArgEntry::Switch { flag, .. } => Some(flag),
        }
    }
}

/// Arguments are declared once, in order, and rendered in that order.
/// Re-declaring a flag replaces the earlier entry in place, so each flag
/// renders at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgList {
    entries: Vec<ArgEntry>,
}

impl ArgList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(mut self, value: impl Into<String>) -> Self {
        self.entries.push(ArgEntry::Positional(value.into()));
        self
    }

    pub fn value(self, flag: &str, value: impl ToString) -> Self {
        self.upsert(ArgEntry::Value {
            flag: flag.to_string(),
            value: value.to_string(),
        })
    }

    /// A bare flag rendered only when `enabled`.
    pub fn switch(self, flag: &str, enabled: bool) -> Self {
        self.upsert(ArgEntry::Switch {
            flag: flag.to_string(),
            enabled,
        })
    }

    pub fn chain(self, other: ArgList) -> Self {
        other.entries.into_iter().fold(self, |list, entry| match entry {
            ArgEntry::Positional(value) => list.positional(value),
            flagged => list.upsert(flagged),
        })
    }

    fn upsert(mut self, entry: ArgEntry) -> Self {
        let existing = self
            .entries
            .iter()
            .position(|e| e.flag().is_some() && e.flag() == entry.flag());
        match existing {
            Some(index) => self.entries[index] = entry,
            None => self.entries.push(entry),
        }
        self
    }

    pub fn render(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.entries.len() * 2);
        for entry in &self.entries {
            match entry {
                ArgEntry::Positional(value) => argv.push(value.clone()),
                ArgEntry::Value { flag, value } => {
                    argv.push(flag.clone());
                    argv.push(value.clone());
                }
                ArgEntry::Switch { flag, enabled: true } => argv.push(flag.clone()),
                ArgEntry::Switch { enabled: false, .. } => {}
            }
        }
        argv
    }
}

// ==============================================================================
// 3. Invocation descriptor
// ==============================================================================

#[derive(Debug)]
pub enum EnvValue {
    Plain(String),
    Secret(ProviderCredential),
    /// Removed from the inherited environment.
    Unset,
}

/// Everything needed to launch one delegated process. The environment is an
/// overlay: the child inherits ours and these entries win on collision.
/// Stdio is always inherited, so the child's output reaches the operator live.
#[derive(Debug)]
pub struct InvocationDescriptor {
    program: PathBuf,
    args: ArgList,
    env: BTreeMap<String, EnvValue>,
}

impl InvocationDescriptor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: ArgList::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn args(mut self, args: ArgList) -> Self {
        self.args = args;
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), EnvValue::Plain(value.into()));
        self
    }

    pub fn secret_env(mut self, key: &str, value: ProviderCredential) -> Self {
        self.env.insert(key.to_string(), EnvValue::Secret(value));
        self
    }

    pub fn unset_env(mut self, key: &str) -> Self {
        self.env.insert(key.to_string(), EnvValue::Unset);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn argv(&self) -> Vec<String> {
        self.args.render()
    }

    pub fn env_entries(&self) -> impl Iterator<Item = (&str, &EnvValue)> {
        self.env.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.args.render())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        for (key, value) in &self.env {
            match value {
                EnvValue::Plain(v) => {
                    command.env(key, v);
                }
                EnvValue::Unset => {
                    command.env_remove(key);
                }
                // 🛡️ The plaintext only lives inside this closure and the
                // command's env table, which is dropped right after spawn.
                EnvValue::Secret(cred) => cred.use_secret(|bytes| {
                    command.env(key, OsStr::from_bytes(bytes));
                }),
            }
        }
        command
    }
}

// ==============================================================================
// 4. Concrete Implementation (tokio::process)
// ==============================================================================

pub struct SystemProcessInvoker;

#[async_trait]
impl ProcessInvoker for SystemProcessInvoker {
    async fn invoke(&self, descriptor: InvocationDescriptor) -> Result<Outcome, InvokeError> {
        let program = descriptor.program().display().to_string();
        let env_keys: Vec<&str> = descriptor.env_entries().map(|(key, _)| key).collect();
        info!(program = %program, argv = ?descriptor.argv(), env = ?env_keys, "spawning delegated process");

        let mut child = {
            let mut command = descriptor.command();
            command.spawn().map_err(|source| InvokeError::Spawn {
                program: program.clone(),
                source,
            })?
        };
        drop(descriptor);

        // Ctrl-C reaches the child through the process group. We keep waiting
        // so whatever wraps this call (the tunnel) is released after the child.
        // SIGTERM is only sent to us, so it is passed on to the child.
        let mut watch_interrupts = true;
        let mut terminate = unix_signal(SignalKind::terminate())
            .inspect_err(|e| debug!(error = %e, "cannot watch for SIGTERM"))
            .ok();
        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|source| InvokeError::Wait {
                        program: program.clone(),
                        source,
                    })?;
                }
                signal = tokio::signal::ctrl_c(), if watch_interrupts => match signal {
                    Ok(()) => warn!(program = %program, "interrupt received; waiting for child to exit"),
                    Err(e) => {
                        debug!(error = %e, "cannot watch for interrupts");
                        watch_interrupts = false;
                    }
                },
                Some(()) = next_signal(&mut terminate) => {
                    warn!(program = %program, "termination requested; forwarding SIGTERM to child");
                    if let Some(pid) = child.id() {
                        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                            debug!(error = %e, "SIGTERM to child failed");
                        }
                    }
                }
            }
        };

        let outcome = Outcome::from_status(status);
        match outcome {
            Outcome::Success => info!(program = %program, "delegated process finished"),
            Outcome::Failure { code } => warn!(program = %program, code, "delegated process failed"),
        }
        Ok(outcome)
    }
}

async fn next_signal(listener: &mut Option<UnixSignal>) -> Option<()> {
    match listener {
        Some(listener) => listener.recv().await,
        None => std::future::pending().await,
    }
}
