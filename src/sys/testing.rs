// src/sys/testing.rs
//
// Recording fakes for every seam in `sys::traits`.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};

use crate::error::{CredentialError, InvokeError, TunnelError};
use crate::sys::invoker::{EnvValue, InvocationDescriptor, Outcome};
use crate::sys::secrets::{ProviderCredential, SecretKind};
use crate::sys::traits::{CredentialProvider, ProcessInvoker, TunnelConnector, TunnelSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SecretFetched(SecretKind),
    TunnelOpened,
    Spawned,
    Operation,
    TunnelClosed,
    TunnelDropped,
}

/// Shared, ordered log of what the fakes observed.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }
}

// ==============================================================================
// Credentials
// ==============================================================================

pub struct StaticCredentials {
    journal: Journal,
    user: Option<&'static str>,
    password: Option<&'static str>,
}

impl StaticCredentials {
    pub fn new(journal: Journal, user: &'static str, password: &'static str) -> Self {
        Self {
            journal,
            user: Some(user),
            password: Some(password),
        }
    }

    pub fn empty(journal: Journal) -> Self {
        Self {
            journal,
            user: None,
            password: None,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_secret(&self, kind: SecretKind) -> Result<ProviderCredential, CredentialError> {
        self.journal.push(Event::SecretFetched(kind));
        let value = match kind {
            SecretKind::MysqlUser => self.user,
            SecretKind::MysqlPassword => self.password,
        };
        value
            .map(|v| ProviderCredential::new(v.as_bytes().to_vec()))
            .ok_or(CredentialError::Missing { kind })
    }
}

// ==============================================================================
// Tunnel
// ==============================================================================

pub struct FakeConnector {
    journal: Journal,
    healthy: bool,
}

impl FakeConnector {
    pub fn healthy(journal: Journal) -> Self {
        Self { journal, healthy: true }
    }

    pub fn broken(journal: Journal) -> Self {
        Self { journal, healthy: false }
    }
}

#[async_trait]
impl TunnelConnector for FakeConnector {
    async fn open(&self) -> Result<Box<dyn TunnelSession>, TunnelError> {
        if !self.healthy {
            return Err(TunnelError::MissingHost);
        }
        self.journal.push(Event::TunnelOpened);
        Ok(Box::new(FakeSession {
            journal: self.journal.clone(),
            closed: false,
        }))
    }
}

struct FakeSession {
    journal: Journal,
    closed: bool,
}

#[async_trait]
impl TunnelSession for FakeSession {
    fn local_endpoint(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 3306))
    }

    fn remote_endpoint(&self) -> &str {
        "127.0.0.1:3306"
    }

    async fn close(mut self: Box<Self>) -> Result<(), TunnelError> {
        self.closed = true;
        self.journal.push(Event::TunnelClosed);
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if !self.closed {
            self.journal.push(Event::TunnelDropped);
        }
    }
}

// ==============================================================================
// Invoker
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: PathBuf,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Inherited variables the descriptor strips.
    pub unset: Vec<String>,
}

pub struct RecordingInvoker {
    journal: Journal,
    exit_code: i32,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingInvoker {
    pub fn exiting_with(journal: Journal, exit_code: i32) -> Self {
        Self {
            journal,
            exit_code,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessInvoker for RecordingInvoker {
    async fn invoke(&self, descriptor: InvocationDescriptor) -> Result<Outcome, InvokeError> {
        self.journal.push(Event::Spawned);
        let mut env = BTreeMap::new();
        let mut unset = Vec::new();
        for (key, value) in descriptor.env_entries() {
            match value {
                EnvValue::Plain(v) => {
                    env.insert(key.to_string(), v.clone());
                }
                EnvValue::Secret(cred) => {
                    env.insert(key.to_string(), cred.use_secret(|b| String::from_utf8_lossy(b).into_owned()));
                }
                EnvValue::Unset => unset.push(key.to_string()),
            }
        }
        self.calls.lock().unwrap().push(RecordedCall {
            program: descriptor.program().to_path_buf(),
            argv: descriptor.argv(),
            env,
            unset,
        });

        Ok(match self.exit_code {
            0 => Outcome::Success,
            code => Outcome::Failure { code },
        })
    }
}

// ==============================================================================
// Processes
// ==============================================================================

/// Polls `/proc` until `pid` is gone. A zombie counts as gone: nothing runs
/// there any more, it only waits to be reaped.
pub async fn process_exits_within(pid: i32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        let running = std::fs::read_to_string(format!("/proc/{}/stat", pid)).is_ok_and(|stat| {
            stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next()) != Some("Z")
        });
        if !running {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}
