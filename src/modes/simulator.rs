// src/modes/simulator.rs
//
// Modes delegated to the native simulator. All of them read and write the
// remote MySQL store, so every run goes through the tunnel.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::cli::Mode;
use crate::config::PilotConfig;
use crate::error::{ModuleLoadError, OrchestratorError};
use crate::modes::{ModeHandler, ModuleLoader, Services};
use crate::sys::invoker::{ArgList, InvocationDescriptor, Outcome};
use crate::sys::secrets::{ProviderCredential, SecretKind};
use crate::sys::traits::{CredentialProvider, ProcessInvoker};
use crate::sys::tunnel::TunnelManager;

const MODULE: &str = "simulator";

/// Simulator argv for `mode`, or `None` if the simulator does not serve it.
pub fn simulator_args(mode: &Mode, mysql_user: &str) -> Option<ArgList> {
    let args = match mode {
        Mode::Generator(a) => ArgList::new()
            .positional("generator")
            .value("--plays-per-write", a.plays_per_write)
            .value("--thread-num", a.thread_num)
            .value("--mcts-simulation-num", a.mcts_simulation_num)
            .value("--mysql-user", mysql_user)
            .switch("--flamegraph", a.flamegraph),
        Mode::Evaluator(a) => ArgList::new()
            .positional("evaluator")
            .value("--plays-per-write", a.plays_per_write)
            .value("--thread-num", a.thread_num)
            .value("--mcts-simulation-num", a.mcts_simulation_num)
            .value("--mysql-user", mysql_user)
            .switch("--flamegraph", a.flamegraph),
        // The simulator's learner sizes its own buffer; --buffer/--epochs stay
        // on our side of the boundary.
        Mode::Learner2(a) => ArgList::new()
            .positional("learner")
            .value("--mysql-user", mysql_user)
            .switch("--flamegraph", a.flamegraph),
        _ => return None,
    };
    Some(args)
}

pub struct SimulatorLoader {
    simulator: PathBuf,
    library_path: String,
    services: Services,
}

impl SimulatorLoader {
    pub fn new(config: &PilotConfig, services: Services) -> Self {
        Self {
            simulator: config.simulator_path.clone(),
            library_path: config.library_path.clone(),
            services,
        }
    }
}

#[async_trait]
impl ModuleLoader for SimulatorLoader {
    fn module(&self) -> &'static str {
        MODULE
    }

    async fn load(&self) -> Result<Arc<dyn ModeHandler>, ModuleLoadError> {
        let metadata = tokio::fs::metadata(&self.simulator).await.map_err(|e| ModuleLoadError {
            module: MODULE,
            reason: format!("{}: {}", self.simulator.display(), e),
        })?;
        if !metadata.is_file() {
            return Err(ModuleLoadError {
                module: MODULE,
                reason: format!("{} is not an executable file", self.simulator.display()),
            });
        }

        Ok(Arc::new(SimulatorHandler {
            simulator: self.simulator.clone(),
            library_path: self.library_path.clone(),
            invoker: Arc::clone(&self.services.invoker),
            credentials: Arc::clone(&self.services.credentials),
            tunnel: TunnelManager::new(Arc::clone(&self.services.tunnel)),
        }))
    }
}

pub struct SimulatorHandler {
    simulator: PathBuf,
    library_path: String,
    invoker: Arc<dyn ProcessInvoker>,
    credentials: Arc<dyn CredentialProvider>,
    tunnel: TunnelManager,
}

impl SimulatorHandler {
    fn descriptor(&self, args: ArgList, password: ProviderCredential) -> InvocationDescriptor {
        InvocationDescriptor::new(&self.simulator)
            .args(args)
            .env("LD_LIBRARY_PATH", self.library_path.as_str())
            .secret_env("MYSQL_PASSWORD", password)
    }
}

#[async_trait]
impl ModeHandler for SimulatorHandler {
    async fn run(&self, mode: &Mode) -> Result<Outcome, OrchestratorError> {
        // 🛡️ Credentials are fetched fresh for this run, before any tunnel work.
        let user = self.credentials.get_secret(SecretKind::MysqlUser).await?;
        let user = Zeroizing::new(user.use_secret(|bytes| String::from_utf8_lossy(bytes).into_owned()));
        let password = self.credentials.get_secret(SecretKind::MysqlPassword).await?;

        let args = simulator_args(mode, &user).ok_or(OrchestratorError::UnsupportedMode {
            mode: mode.name(),
            module: MODULE,
        })?;
        let descriptor = self.descriptor(args, password);
        info!(mode = mode.name(), simulator = %self.simulator.display(), "starting simulator");

        let invoker = Arc::clone(&self.invoker);
        let outcome = self
            .tunnel
            .with_tunnel(move |local| async move {
                debug!(local = %local, "tunnel live; spawning simulator");
                invoker.invoke(descriptor).await
            })
            .await??;
        Ok(outcome)
    }
}
