// src/dispatcher.rs

use std::io::Write;
use std::process::ExitCode;

use tracing::{error, info};

use crate::cli::Mode;
use crate::error::OrchestratorError;
use crate::modes::ModeRegistry;
use crate::sys::invoker::Outcome;

/// Single entry and exit point of a run: resolves the mode's handler, runs
/// it, and turns the result into an exit status.
pub struct Dispatcher {
    registry: ModeRegistry,
}

impl Dispatcher {
    pub fn new(registry: ModeRegistry) -> Self {
        Self { registry }
    }

    /// `progress` receives the `loading ...` / `done.` markers that separate
    /// slow module loading from slow execution.
    pub async fn dispatch(&self, mode: &Mode, progress: &mut dyn Write) -> Result<Outcome, OrchestratorError> {
        let name = mode.name();
        let label = self.registry.label(name)?;

        let _ = writeln!(progress, "loading {}...", label);
        let handler = self.registry.resolve(name).await?;
        let _ = writeln!(progress, "done.");

        info!(mode = name, remote_store = mode.requires_remote_store(), "dispatching");
        handler.run(mode).await
    }

    /// Dispatches `mode`, reports the result on stderr and returns the
    /// process exit status.
    pub async fn run(&self, mode: &Mode, progress: &mut dyn Write) -> ExitCode {
        let result = self.dispatch(mode, progress).await;
        if let Err(e) = &result {
            error!(stage = e.stage(), error = %e, "run aborted");
        }

        let delegate = self.registry.module(mode.name()).unwrap_or("craft");
        if let Some(message) = failure_message(delegate, &result) {
            eprintln!("{}", message);
        }
        ExitCode::from(exit_status(&result))
    }
}

/// What the operator is told when a run does not succeed.
fn failure_message(delegate: &str, result: &Result<Outcome, OrchestratorError>) -> Option<String> {
    match result {
        Ok(Outcome::Success) => None,
        Ok(Outcome::Failure { code }) => Some(format!("{} has exit with error code: {}", delegate, code)),
        Err(e) => Some(format!("craft: {} failed: {}", e.stage(), e)),
    }
}

fn exit_status(result: &Result<Outcome, OrchestratorError>) -> u8 {
    match result {
        Ok(Outcome::Success) => 0,
        Ok(Outcome::Failure { code }) => exit_byte(*code),
        Err(e) => e.exit_code(),
    }
}

/// Child codes pass through, except ones that would truncate to success.
fn exit_byte(code: i32) -> u8 {
    match (code & 0xff) as u8 {
        0 => 1,
        byte => byte,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{EvaluatorArgs, GeneratorArgs, Learner2Args, UploadArgs};
    use crate::config::PilotConfig;
    use crate::modes::Services;
    use crate::sys::secrets::SecretKind;
    use crate::sys::testing::{Event, FakeConnector, Journal, RecordingInvoker, StaticCredentials};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct Fixture {
        dispatcher: Dispatcher,
        journal: Journal,
        invoker: Arc<RecordingInvoker>,
        _workdir: tempfile::TempDir,
    }

    fn fixture(tunnel_healthy: bool, exit_code: i32) -> Fixture {
        let workdir = tempfile::tempdir().unwrap();
        let simulator = workdir.path().join("craft-simulator");
        std::fs::write(&simulator, "").unwrap();
        let runtime = workdir.path().join("pysrc");
        std::fs::create_dir(&runtime).unwrap();
        std::fs::write(runtime.join("misc.py"), "").unwrap();

        let vars = [
            ("CRAFT_SIMULATOR", simulator.display().to_string()),
            ("CRAFT_RUNTIME_DIR", runtime.display().to_string()),
            ("CRAFT_PYTHON", "sh".to_string()),
        ];
        let config = PilotConfig::from_lookup(|key| {
            vars.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone())
        });

        let journal = Journal::default();
        let invoker = Arc::new(RecordingInvoker::exiting_with(journal.clone(), exit_code));
        let connector = if tunnel_healthy {
            FakeConnector::healthy(journal.clone())
        } else {
            FakeConnector::broken(journal.clone())
        };
        let services = Services {
            invoker: invoker.clone(),
            tunnel: Arc::new(connector),
            credentials: Arc::new(StaticCredentials::new(journal.clone(), "craft", "hunter2")),
        };

        Fixture {
            dispatcher: Dispatcher::new(ModeRegistry::standard(&config, services)),
            journal,
            invoker,
            _workdir: workdir,
        }
    }

    #[tokio::test]
    async fn generator_scenario() {
        let fx = fixture(true, 0);
        let mode = Mode::Generator(GeneratorArgs {
            plays_per_write: 100,
            thread_num: 8,
            mcts_simulation_num: 1000,
            flamegraph: false,
        });

        let mut progress = Vec::new();
        let outcome = fx.dispatcher.dispatch(&mode, &mut progress).await.unwrap();

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(String::from_utf8(progress).unwrap(), "loading modules...\ndone.\n");
        assert_eq!(
            fx.invoker.calls()[0].argv,
            vec![
                "generator",
                "--plays-per-write",
                "100",
                "--thread-num",
                "8",
                "--mcts-simulation-num",
                "1000",
                "--mysql-user",
                "craft",
            ]
        );
        assert_eq!(
            fx.journal.events(),
            vec![
                Event::SecretFetched(SecretKind::MysqlUser),
                Event::SecretFetched(SecretKind::MysqlPassword),
                Event::TunnelOpened,
                Event::Spawned,
                Event::TunnelClosed,
            ]
        );
    }

    #[tokio::test]
    async fn learner2_with_broken_tunnel_never_spawns() {
        let fx = fixture(false, 0);
        let mode = Mode::Learner2(Learner2Args {
            buffer: 200_000,
            epochs: 100,
            flamegraph: false,
        });

        let result = fx.dispatcher.dispatch(&mode, &mut Vec::new()).await;

        assert_eq!(result.as_ref().err().map(|e| e.stage()), Some("tunnel"));
        assert!(fx.invoker.calls().is_empty());
        assert_eq!(exit_status(&result), 1);
    }

    #[tokio::test]
    async fn upload_is_not_tunnel_wrapped() {
        let fx = fixture(true, 0);
        let mode = Mode::Upload(UploadArgs {
            source: "source.bin".into(),
            destination: "gcs://bucket/key".into(),
            content_type: "application/octet-stream".into(),
        });

        fx.dispatcher.dispatch(&mode, &mut Vec::new()).await.unwrap();

        assert_eq!(fx.journal.events(), vec![Event::Spawned]);
        let call = &fx.invoker.calls()[0];
        assert_eq!(
            call.argv,
            vec!["-m", "misc", "upload", "source.bin", "gcs://bucket/key", "--content-type", "application/octet-stream"]
        );
        assert!(!call.env.contains_key("MYSQL_PASSWORD"));
        assert_eq!(call.unset, vec!["MYSQL_PASSWORD"]);
        assert!(!call.env.contains_key("LD_LIBRARY_PATH"));
        assert!(!fx.dispatcher.registry.is_loaded("generator"));
    }

    #[tokio::test]
    async fn evaluator_exit_code_is_reported() {
        let fx = fixture(true, 3);
        let mode = Mode::Evaluator(EvaluatorArgs {
            plays_per_write: 10,
            thread_num: 4,
            mcts_simulation_num: 500,
            flamegraph: false,
        });

        let result = fx.dispatcher.dispatch(&mode, &mut Vec::new()).await;

        assert_eq!(result.as_ref().ok(), Some(&Outcome::Failure { code: 3 }));
        assert_eq!(exit_status(&result), 3);
        assert_eq!(fx.journal.events().last(), Some(&Event::TunnelClosed));
    }

    #[tokio::test]
    async fn load_failure_skips_the_done_marker() {
        let fx = fixture(true, 0);
        // No learner.py in the runtime dir.
        let mode = Mode::Learner(crate::cli::LearnerArgs {
            buffer: 200_000,
            epochs: 100,
        });

        let mut progress = Vec::new();
        let err = fx.dispatcher.dispatch(&mode, &mut progress).await.unwrap_err();

        assert_eq!(err.stage(), "load");
        assert_eq!(String::from_utf8(progress).unwrap(), "loading tensorflow...\n");
        assert!(fx.journal.events().is_empty());
    }

    #[test]
    fn failure_message_names_the_delegate() {
        let failed = Ok(Outcome::Failure { code: 4 });
        assert_eq!(failure_message("misc", &failed).as_deref(), Some("misc has exit with error code: 4"));
        assert_eq!(
            failure_message("simulator", &Ok(Outcome::Failure { code: 3 })).as_deref(),
            Some("simulator has exit with error code: 3")
        );
        assert_eq!(failure_message("misc", &Ok(Outcome::Success)), None);

        let aborted = Err(OrchestratorError::Usage("selfplay".into()));
        assert_eq!(
            failure_message("craft", &aborted).as_deref(),
            Some("craft: usage failed: unknown mode `selfplay`")
        );
    }

    #[test]
    fn exit_byte_never_reports_success_for_a_failure() {
        assert_eq!(exit_byte(3), 3);
        assert_eq!(exit_byte(137), 137);
        assert_eq!(exit_byte(256), 1);
        assert_eq!(exit_byte(-1), 255);
    }
}
