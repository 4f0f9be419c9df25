// src/sys/secrets.rs

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use tokio::process::Command;
use tracing::debug;

use crate::error::CredentialError;
use crate::sys::traits::CredentialProvider;

/// ProviderCredential is an ephemeral, memory-safe wrapper for the values we
/// hand to the simulator: the MySQL user and, more importantly, its password.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. When the struct goes out of scope, the memory is zeroized.
pub struct ProviderCredential {
    token: Secret<Vec<u8>>,
}

impl ProviderCredential {
    /// Wraps raw bytes in a zeroizing Secret. Ownership moves straight into
    /// the `Secret`, so the plaintext is never copied to a second allocation.
    pub fn new(raw_token: Vec<u8>) -> Self {
        Self {
            token: Secret::new(raw_token),
        }
    }

    /// Exposes the secret for the duration of `action` only; the borrowed
    /// slice cannot escape the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        action(self.token.expose_secret())
    }
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderCredential([REDACTED])")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    MysqlUser,
    MysqlPassword,
}

impl SecretKind {
    /// Name of the secret in the backing store.
    pub fn name(self) -> &'static str {
        match self {
            SecretKind::MysqlUser => "mysql-user",
            SecretKind::MysqlPassword => "mysql-password",
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where secrets come from. Selected once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// A command template; `{name}` is replaced by the secret name and the
    /// command's stdout is the secret.
    Command(String),
    /// One file per secret, named after the secret.
    Directory(PathBuf),
}

pub fn provider_for(source: &SecretSource) -> Arc<dyn CredentialProvider> {
    match source {
        SecretSource::Command(template) => Arc::new(CommandCredentialProvider::new(template.clone())),
        SecretSource::Directory(dir) => Arc::new(DirectoryCredentialProvider::new(dir.clone())),
    }
}

fn trim_line_ending(bytes: &mut Vec<u8>) {
    while matches!(bytes.last(), Some(b'\n' | b'\r')) {
        bytes.pop();
    }
}

// ==============================================================================
// 1. Command-backed store (gcloud, vault, pass, ...)
// ==============================================================================

pub struct CommandCredentialProvider {
    template: String,
}

impl CommandCredentialProvider {
    pub fn new(template: String) -> Self {
        Self { template }
    }

    /// The template with `{name}` filled in. Secret names are fixed
    /// identifiers, so the result is safe to hand to the shell.
    fn script(&self, kind: SecretKind) -> String {
        self.template.replace("{name}", kind.name())
    }
}

#[async_trait]
impl CredentialProvider for CommandCredentialProvider {
    async fn get_secret(&self, kind: SecretKind) -> Result<ProviderCredential, CredentialError> {
        let script = self.script(kind);
        if script.trim().is_empty() {
            return Err(CredentialError::Unreachable {
                kind,
                reason: "secret command is empty".into(),
            });
        }

        debug!(command = %script, secret = %kind, "resolving secret via command");

        // Run through the shell so templates can quote arguments or use pipes.
        // 🛡️ stdout is captured and moved into the Secret; stderr stays on the terminal.
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|e| CredentialError::Unreachable {
                kind,
                reason: format!("failed to run `{}`: {}", script, e),
            })?;

        if !output.status.success() {
            return Err(CredentialError::Unreachable {
                kind,
                reason: format!("`{}` exited with {}", script, output.status),
            });
        }

        let mut raw = output.stdout;
        trim_line_ending(&mut raw);
        if raw.is_empty() {
            return Err(CredentialError::Missing { kind });
        }
        Ok(ProviderCredential::new(raw))
    }
}

// ==============================================================================
// 2. Directory-backed store (/run/secrets style mounts)
// ==============================================================================

pub struct DirectoryCredentialProvider {
    dir: PathBuf,
}

impl DirectoryCredentialProvider {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl CredentialProvider for DirectoryCredentialProvider {
    async fn get_secret(&self, kind: SecretKind) -> Result<ProviderCredential, CredentialError> {
        let path = self.dir.join(kind.name());
        debug!(path = %path.display(), secret = %kind, "resolving secret from file");

        let mut raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CredentialError::Missing { kind });
            }
            Err(e) => {
                return Err(CredentialError::Unreachable {
                    kind,
                    reason: format!("{}: {}", path.display(), e),
                });
            }
        };

        trim_line_ending(&mut raw);
        if raw.is_empty() {
            return Err(CredentialError::Missing { kind });
        }
        Ok(ProviderCredential::new(raw))
    }
}
