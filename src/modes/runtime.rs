// src/modes/runtime.rs
//
// Modes backed by the Python ML runtime: model creation/fitting (`learner`)
// and object storage transfers (`misc`). Each runs as
// `<python> -m <module> <mode> <args...>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::cli::Mode;
use crate::config::PilotConfig;
use crate::error::{InvokeError, ModuleLoadError, OrchestratorError};
use crate::modes::{ModeHandler, ModuleLoader};
use crate::sys::invoker::{ArgList, InvocationDescriptor, Outcome};
use crate::sys::traits::{ObjectTransfer, ProcessInvoker};

const LEARNER_MODULE: &str = "learner";
const TRANSFER_MODULE: &str = "misc";

/// A located runtime module, ready to be invoked.
pub struct PythonRuntime {
    python: PathBuf,
    runtime_dir: PathBuf,
    module: &'static str,
    invoker: Arc<dyn ProcessInvoker>,
}

impl PythonRuntime {
    /// Resolves the interpreter and checks the module is present, without
    /// importing it.
    pub fn locate(
        python: &str,
        runtime_dir: &Path,
        module: &'static str,
        invoker: Arc<dyn ProcessInvoker>,
    ) -> Result<Self, ModuleLoadError> {
        let python = which::which(python).map_err(|e| ModuleLoadError {
            module,
            reason: format!("python interpreter `{}` not found: {}", python, e),
        })?;

        let candidates = [
            runtime_dir.join(format!("{}.py", module)),
            runtime_dir.join(module).join("__init__.py"),
        ];
        if !candidates.iter().any(|path| path.is_file()) {
            return Err(ModuleLoadError {
                module,
                reason: format!("no `{}` module under {}", module, runtime_dir.display()),
            });
        }

        Ok(Self {
            python,
            runtime_dir: runtime_dir.to_path_buf(),
            module,
            invoker,
        })
    }

    fn descriptor(&self, mode: &str, args: ArgList) -> InvocationDescriptor {
        let argv = ArgList::new()
            .positional("-m")
            .positional(self.module)
            .positional(mode)
            .chain(args);

        // 🛡️ Only tunneled simulator runs may see the MySQL password.
        InvocationDescriptor::new(&self.python)
            .args(argv)
            .env("PYTHONPATH", self.runtime_dir.display().to_string())
            .unset_env("MYSQL_PASSWORD")
    }

    async fn run(&self, mode: &str, args: ArgList) -> Result<Outcome, InvokeError> {
        info!(module = self.module, mode, "handing over to runtime module");
        self.invoker.invoke(self.descriptor(mode, args)).await
    }
}

// ==============================================================================
// 1. Learner runtime (new / fit / learner)
// ==============================================================================

pub struct LearnerRuntimeLoader {
    python: String,
    runtime_dir: PathBuf,
    invoker: Arc<dyn ProcessInvoker>,
}

impl LearnerRuntimeLoader {
    pub fn new(config: &PilotConfig, invoker: Arc<dyn ProcessInvoker>) -> Self {
        Self {
            python: config.python.clone(),
            runtime_dir: config.runtime_dir.clone(),
            invoker,
        }
    }
}

#[async_trait]
impl ModuleLoader for LearnerRuntimeLoader {
    fn module(&self) -> &'static str {
        LEARNER_MODULE
    }

    fn label(&self) -> &'static str {
        "tensorflow"
    }

    async fn load(&self) -> Result<Arc<dyn ModeHandler>, ModuleLoadError> {
        let runtime = PythonRuntime::locate(&self.python, &self.runtime_dir, LEARNER_MODULE, Arc::clone(&self.invoker))?;
        Ok(Arc::new(LearnerHandler { runtime }))
    }
}

pub struct LearnerHandler {
    runtime: PythonRuntime,
}

#[async_trait]
impl ModeHandler for LearnerHandler {
    async fn run(&self, mode: &Mode) -> Result<Outcome, OrchestratorError> {
        let args = match mode {
            Mode::New(a) => ArgList::new().positional(&a.filename),
            Mode::Fit(a) => ArgList::new()
                .positional(&a.source)
                .positional(&a.destination)
                .value("--epochs", a.epochs),
            Mode::Learner(a) => ArgList::new().value("--buffer", a.buffer).value("--epochs", a.epochs),
            other => {
                return Err(OrchestratorError::UnsupportedMode {
                    mode: other.name(),
                    module: LEARNER_MODULE,
                });
            }
        };
        Ok(self.runtime.run(mode.name(), args).await?)
    }
}

// ==============================================================================
// 2. Transfer runtime (gcs / upload / download)
// ==============================================================================

#[async_trait]
impl ObjectTransfer for PythonRuntime {
    async fn serve_proxy(&self) -> Result<Outcome, InvokeError> {
        self.run("gcs", ArgList::new()).await
    }

    async fn upload(&self, source: &str, destination: &str, content_type: &str) -> Result<Outcome, InvokeError> {
        let args = ArgList::new()
            .positional(source)
            .positional(destination)
            .value("--content-type", content_type);
        self.run("upload", args).await
    }

    async fn download(&self, source: &str, destination: &str) -> Result<Outcome, InvokeError> {
        self.run("download", ArgList::new().positional(source).positional(destination))
            .await
    }
}

pub struct TransferRuntimeLoader {
    python: String,
    runtime_dir: PathBuf,
    invoker: Arc<dyn ProcessInvoker>,
}

impl TransferRuntimeLoader {
    pub fn new(config: &PilotConfig, invoker: Arc<dyn ProcessInvoker>) -> Self {
        Self {
            python: config.python.clone(),
            runtime_dir: config.runtime_dir.clone(),
            invoker,
        }
    }
}

#[async_trait]
impl ModuleLoader for TransferRuntimeLoader {
    fn module(&self) -> &'static str {
        TRANSFER_MODULE
    }

    async fn load(&self) -> Result<Arc<dyn ModeHandler>, ModuleLoadError> {
        let runtime = PythonRuntime::locate(&self.python, &self.runtime_dir, TRANSFER_MODULE, Arc::clone(&self.invoker))?;
        Ok(Arc::new(TransferHandler::new(Arc::new(runtime))))
    }
}

/// Passes the operator's values to the transfer collaborator untouched.
pub struct TransferHandler {
    transfer: Arc<dyn ObjectTransfer>,
}

impl TransferHandler {
    pub fn new(transfer: Arc<dyn ObjectTransfer>) -> Self {
        Self { transfer }
    }
}

#[async_trait]
impl ModeHandler for TransferHandler {
    async fn run(&self, mode: &Mode) -> Result<Outcome, OrchestratorError> {
        let outcome = match mode {
            Mode::Gcs => self.transfer.serve_proxy().await?,
            Mode::Upload(a) => self.transfer.upload(&a.source, &a.destination, &a.content_type).await?,
            Mode::Download(a) => self.transfer.download(&a.source, &a.destination).await?,
            other => {
                return Err(OrchestratorError::UnsupportedMode {
                    mode: other.name(),
                    module: TRANSFER_MODULE,
                });
            }
        };
        Ok(outcome)
    }
}
