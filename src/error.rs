// src/error.rs

use std::io;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::Signal;
use thiserror::Error;

use crate::sys::secrets::SecretKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
#[error("module `{module}` could not be loaded: {reason}")]
pub struct ModuleLoadError {
    pub module: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("secret `{kind}` is not present in the secret store")]
    Missing { kind: SecretKind },

    #[error("secret store unreachable while resolving `{kind}`: {reason}")]
    Unreachable { kind: SecretKind, reason: String },
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no tunnel host configured (set CRAFT_TUNNEL_HOST)")]
    MissingHost,

    #[error("ssh binary `{program}` not found: {reason}")]
    SshUnavailable { program: String, reason: String },

    #[error("local port {port} is already in use")]
    PortBusy {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn ssh: {0}")]
    Spawn(#[source] io::Error),

    #[error("ssh exited before the forward came up ({status})")]
    ExitedEarly { status: ExitStatus },

    #[error("forward on {local} not ready after {timeout:?}")]
    Timeout { local: SocketAddr, timeout: Duration },

    #[error("failed to close tunnel: {0}")]
    Close(#[source] io::Error),

    #[error("cannot listen for interrupts: {0}")]
    Signals(#[source] io::Error),

    #[error("interrupted by {} while establishing the tunnel", .signal.as_str())]
    Interrupted { signal: Signal },
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Everything that can abort one run of `craft`. A child that exits non-zero
/// is not an error here; it comes back as `Outcome::Failure`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown mode `{0}`")]
    Usage(String),

    #[error(transparent)]
    ModuleLoad(#[from] ModuleLoadError),

    #[error("mode `{mode}` is not served by module `{module}`")]
    UnsupportedMode { mode: &'static str, module: &'static str },

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Child(#[from] InvokeError),
}

impl OrchestratorError {
    /// The pipeline stage an operator should look at.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Usage(_) => "usage",
            Self::Tunnel(TunnelError::Config(_)) => "config",
            Self::ModuleLoad(_) | Self::UnsupportedMode { .. } => "load",
            Self::Credential(_) => "credential",
            Self::Tunnel(_) => "tunnel",
            Self::Child(_) => "child",
        }
    }

    /// Process exit status for an aborted run. An operator interrupt exits
    /// shell-style with `128 + signal`, everything else with 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Tunnel(TunnelError::Interrupted { signal }) => (128 + *signal as i32) as u8,
            _ => 1,
        }
    }
}
