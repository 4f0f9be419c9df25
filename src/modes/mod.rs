// src/modes/mod.rs
//
// Mode name -> deferred loader. Nothing here touches a backing module until a
// mode that needs it is resolved.

pub mod runtime;
pub mod simulator;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cli::Mode;
use crate::config::PilotConfig;
use crate::error::{ModuleLoadError, OrchestratorError};
use crate::sys::invoker::{Outcome, SystemProcessInvoker};
use crate::sys::secrets;
use crate::sys::traits::{CredentialProvider, ProcessInvoker, TunnelConnector};
use crate::sys::tunnel::SshTunnelConnector;

use self::runtime::{LearnerRuntimeLoader, TransferRuntimeLoader};
use self::simulator::SimulatorLoader;

#[async_trait]
pub trait ModeHandler: Send + Sync {
    async fn run(&self, mode: &Mode) -> Result<Outcome, OrchestratorError>;
}

/// Deferred factory for one backing module.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    fn module(&self) -> &'static str;

    /// What the progress marker calls this module while it loads.
    fn label(&self) -> &'static str {
        "modules"
    }

    async fn load(&self) -> Result<Arc<dyn ModeHandler>, ModuleLoadError>;
}

/// OS-facing collaborators shared by every handler.
#[derive(Clone)]
pub struct Services {
    pub invoker: Arc<dyn ProcessInvoker>,
    pub tunnel: Arc<dyn TunnelConnector>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl Services {
    pub fn system(config: &PilotConfig) -> Self {
        Self {
            invoker: Arc::new(SystemProcessInvoker),
            tunnel: Arc::new(SshTunnelConnector::new(config.tunnel.clone())),
            credentials: secrets::provider_for(&config.secret_source),
        }
    }
}

struct ModuleSlot {
    loader: Box<dyn ModuleLoader>,
    handler: OnceCell<Arc<dyn ModeHandler>>,
}

#[derive(Default)]
pub struct ModeRegistry {
    slots: Vec<ModuleSlot>,
    routes: BTreeMap<&'static str, usize>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production table: which module backs which mode.
    pub fn standard(config: &PilotConfig, services: Services) -> Self {
        let mut registry = Self::new();
        registry.register(
            Box::new(LearnerRuntimeLoader::new(config, Arc::clone(&services.invoker))),
            &["new", "fit", "learner"],
        );
        registry.register(
            Box::new(SimulatorLoader::new(config, services.clone())),
            &["learner2", "generator", "evaluator"],
        );
        registry.register(
            Box::new(TransferRuntimeLoader::new(config, services.invoker)),
            &["gcs", "upload", "download"],
        );
        registry
    }

    pub fn register(&mut self, loader: Box<dyn ModuleLoader>, modes: &[&'static str]) {
        let index = self.slots.len();
        self.slots.push(ModuleSlot {
            loader,
            handler: OnceCell::new(),
        });
        for &mode in modes {
            let previous = self.routes.insert(mode, index);
            debug_assert!(previous.is_none(), "mode `{}` registered twice", mode);
        }
    }

    #[cfg(test)]
    pub fn modes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }

    fn slot(&self, mode: &str) -> Result<&ModuleSlot, OrchestratorError> {
        self.routes
            .get(mode)
            .map(|&index| &self.slots[index])
            .ok_or_else(|| OrchestratorError::Usage(mode.to_string()))
    }

    pub fn label(&self, mode: &str) -> Result<&'static str, OrchestratorError> {
        Ok(self.slot(mode)?.loader.label())
    }

    /// Name of the backing module that serves `mode`.
    pub fn module(&self, mode: &str) -> Result<&'static str, OrchestratorError> {
        Ok(self.slot(mode)?.loader.module())
    }

    #[cfg(test)]
    pub fn is_loaded(&self, mode: &str) -> bool {
        self.slot(mode).is_ok_and(|slot| slot.handler.initialized())
    }

    /// Loads the module behind `mode` on first request and reuses it afterwards.
    pub async fn resolve(&self, mode: &str) -> Result<Arc<dyn ModeHandler>, OrchestratorError> {
        let slot = self.slot(mode)?;
        let handler = slot
            .handler
            .get_or_try_init(|| async {
                debug!(mode, module = slot.loader.module(), "loading backing module");
                slot.loader.load().await
            })
            .await?;
        Ok(Arc::clone(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHandler;

    #[async_trait]
    impl ModeHandler for NoopHandler {
        async fn run(&self, _mode: &Mode) -> Result<Outcome, OrchestratorError> {
            Ok(Outcome::Success)
        }
    }

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ModuleLoader for CountingLoader {
        fn module(&self) -> &'static str {
            "counting"
        }

        async fn load(&self) -> Result<Arc<dyn ModeHandler>, ModuleLoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ModuleLoadError {
                    module: "counting",
                    reason: "not installed".into(),
                });
            }
            Ok(Arc::new(NoopHandler))
        }
    }

    fn registry(fail: bool) -> (ModeRegistry, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut registry = ModeRegistry::new();
        registry.register(
            Box::new(CountingLoader {
                loads: Arc::clone(&loads),
                fail,
            }),
            &["generator", "evaluator"],
        );
        (registry, loads)
    }

    #[tokio::test]
    async fn nothing_loads_until_requested() {
        let (registry, loads) = registry(false);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(!registry.is_loaded("generator"));

        registry.resolve("generator").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(registry.is_loaded("generator"));
    }

    #[tokio::test]
    async fn modes_sharing_a_module_load_it_once() {
        let (registry, loads) = registry(false);
        registry.resolve("generator").await.unwrap();
        registry.resolve("evaluator").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn load_failure_is_a_module_load_error() {
        let (registry, _) = registry(true);
        let err = registry.resolve("generator").await.err().unwrap();
        assert_eq!(err.stage(), "load");
        assert!(!registry.is_loaded("generator"));
    }

    #[tokio::test]
    async fn unknown_mode_is_a_usage_error() {
        let (registry, loads) = registry(false);
        let err = registry.resolve("selfplay").await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Usage(_)));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn standard_registry_routes_every_cli_mode() {
        let config = PilotConfig::from_lookup(|_| None);
        let registry = ModeRegistry::standard(&config, Services::system(&config));

        let mut routed: Vec<&str> = registry.modes().collect();
        let mut declared: Vec<String> = cli::descriptors().into_iter().map(|d| d.name).collect();
        routed.sort_unstable();
        declared.sort_unstable();
        assert_eq!(routed, declared);
        assert_eq!(registry.label("learner").unwrap(), "tensorflow");
        assert_eq!(registry.label("generator").unwrap(), "modules");
        assert_eq!(registry.module("learner2").unwrap(), "simulator");
        assert_eq!(registry.module("upload").unwrap(), "misc");
    }
}
