// src/sys/tunnel.rs
//
// 🛡️ The simulator only ever talks to MySQL through 127.0.0.1:<local_port>.
// This module owns the ssh forward that makes that endpoint real.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, setpgid};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::TunnelSettings;
use crate::error::TunnelError;
use crate::sys::traits::{TunnelConnector, TunnelSession};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLOSE_GRACE: Duration = Duration::from_secs(5);

// ==============================================================================
// 1. Scoped lifetime
// ==============================================================================

/// Resolves with the signal once the operator asks the run to stop.
pub type Interruption = Pin<Box<dyn Future<Output = Signal> + Send>>;

type InterruptSource = fn() -> io::Result<Interruption>;

/// SIGINT or SIGTERM. Listeners are registered when this is called, not when
/// the future is first polled: from then on neither signal kills the process.
pub fn os_interruption() -> io::Result<Interruption> {
    let mut interrupt = unix_signal(SignalKind::interrupt())?;
    let mut terminate = unix_signal(SignalKind::terminate())?;
    Ok(Box::pin(async move {
        tokio::select! {
            _ = interrupt.recv() => Signal::SIGINT,
            _ = terminate.recv() => Signal::SIGTERM,
        }
    }))
}

pub struct TunnelManager {
    connector: Arc<dyn TunnelConnector>,
    interruptions: InterruptSource,
}

impl TunnelManager {
    pub fn new(connector: Arc<dyn TunnelConnector>) -> Self {
        Self {
            connector,
            interruptions: os_interruption,
        }
    }

    #[cfg(test)]
    pub fn with_interruptions(mut self, source: InterruptSource) -> Self {
        self.interruptions = source;
        self
    }

    /// Opens a session, runs `operation` against its local endpoint and closes
    /// the session afterwards, whatever `operation` returned. If setup fails
    /// or is interrupted, `operation` never runs and no forward outlives us.
    pub async fn with_tunnel<F, Fut, T>(&self, operation: F) -> Result<T, TunnelError>
    where
        F: FnOnce(SocketAddr) -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        // 🛡️ ssh runs in its own process group, so a terminal Ctrl-C never
        // reaches it. We must survive the signal to tear it down ourselves.
        let mut interrupted = (self.interruptions)().map_err(TunnelError::Signals)?;

        debug!("establishing tunnel");
        // Dropping a half-open `open()` drops its ssh child, which kills it.
        let session = tokio::select! {
            opened = self.connector.open() => opened?,
            signal = &mut interrupted => {
                warn!(signal = signal.as_str(), "interrupted while establishing tunnel");
                return Err(TunnelError::Interrupted { signal });
            }
        };
        let local = session.local_endpoint();
        info!(local = %local, remote = session.remote_endpoint(), "tunnel open");

        // Interrupts during the operation belong to the child; the invoker
        // waits it out and we close afterwards.
        let guard = SessionGuard {
            session: Some(session),
        };
        let value = operation(local).await;
        guard.release().await;
        Ok(value)
    }
}

/// Holds the session while the operation runs. `release` is the orderly
/// path; `Drop` covers panics and cancelled futures.
struct SessionGuard {
    session: Option<Box<dyn TunnelSession>>,
}

impl SessionGuard {
    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            match session.close().await {
                Ok(()) => info!("tunnel closed"),
                Err(e) => warn!(error = %e, "tunnel teardown failed"),
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(local = %session.local_endpoint(), "tunnel released without orderly close");
            drop(session);
        }
    }
}

// ==============================================================================
// 2. Concrete Implementation (OpenSSH local forward)
// ==============================================================================

pub struct SshTunnelConnector {
    settings: TunnelSettings,
}

impl SshTunnelConnector {
    pub fn new(settings: TunnelSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TunnelConnector for SshTunnelConnector {
    async fn open(&self) -> Result<Box<dyn TunnelSession>, TunnelError> {
        let config = self.settings.resolve()?;
        let destination = config.destination().ok_or(TunnelError::MissingHost)?;
        let ssh = which::which(&config.ssh_program).map_err(|e| TunnelError::SshUnavailable {
            program: config.ssh_program.clone(),
            reason: e.to_string(),
        })?;

        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, config.local_port));
        let remote = format!("{}:{}", config.remote_host, config.remote_port);

        // A listener already on the port would make the readiness probe lie.
        drop(TcpListener::bind(local).await.map_err(|source| TunnelError::PortBusy {
            port: local.port(),
            source,
        })?);

        let mut command = Command::new(&ssh);
        command
            .arg("-N")
            .args(["-o", "ExitOnForwardFailure=yes"])
            .args(["-o", "BatchMode=yes"])
            .arg("-L")
            .arg(format!("{}:{}:{}", local.ip(), local.port(), remote))
            .arg("-p")
            .arg(config.port.to_string());
        if let Some(key) = &config.identity_file {
            command.arg("-i").arg(key);
        }
        command
            .arg("--")
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Own process group: an operator Ctrl-C must not drop the forward
        // while the simulator is still draining.
        // SAFETY: setpgid is async-signal-safe.
        unsafe {
            command.pre_exec(|| setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::from));
        }

        info!(destination = %destination, local = %local, remote = %remote, "starting ssh forward");
        let mut child = command.spawn().map_err(TunnelError::Spawn)?;

        wait_until_ready(&mut child, local, config.ready_timeout).await?;

        Ok(Box::new(SshTunnelSession { child, local, remote }))
    }
}

async fn wait_until_ready(child: &mut Child, local: SocketAddr, limit: Duration) -> Result<(), TunnelError> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().map_err(TunnelError::Spawn)? {
            return Err(TunnelError::ExitedEarly { status });
        }
        if TcpStream::connect(local).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TunnelError::Timeout { local, timeout: limit });
        }
        sleep(READY_POLL_INTERVAL).await;
    }
}

pub struct SshTunnelSession {
    child: Child,
    local: SocketAddr,
    remote: String,
}

#[async_trait]
impl TunnelSession for SshTunnelSession {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn remote_endpoint(&self) -> &str {
        &self.remote
    }

    async fn close(self: Box<Self>) -> Result<(), TunnelError> {
        let mut child = self.child;
        if let Some(status) = child.try_wait().map_err(TunnelError::Close)? {
            warn!(%status, "ssh forward had already exited");
            return Ok(());
        }

        if let Some(pid) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(error = %e, "SIGTERM to ssh failed");
            }
        }

        match timeout(CLOSE_GRACE, child.wait()).await {
            Ok(status) => {
                status.map_err(TunnelError::Close)?;
                Ok(())
            }
            Err(_) => {
                warn!("ssh ignored SIGTERM; killing");
                child.kill().await.map_err(TunnelError::Close)
            }
        }
    }
}
