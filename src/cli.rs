// src/cli.rs

use std::ffi::OsString;

use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};

/// Orchestrates self-play generation, training and evaluation jobs.
#[derive(Parser, Debug)]
#[command(name = "craft", version, about = "Learn neural network.")]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Option<Mode>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// create initial network.
    New(NewArgs),
    /// create network adapted to the sample.
    Fit(FitArgs),
    /// Run learner mode.
    Learner(LearnerArgs),
    /// Run learner mode (native simulator).
    #[command(name = "learner2")]
    Learner2(Learner2Args),
    /// Run generator mode.
    Generator(GeneratorArgs),
    /// Run evaluator mode.
    Evaluator(EvaluatorArgs),
    /// Run gcs api proxy.
    Gcs,
    /// Upload to gcs.
    Upload(UploadArgs),
    /// Download from gcs.
    Download(DownloadArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct NewArgs {
    /// output filename.
    pub filename: String,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct FitArgs {
    /// samples generated by generator.
    pub source: String,
    /// output filename.
    pub destination: String,
    /// epoch num.
    #[arg(long, default_value_t = 100)]
    pub epochs: u32,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct LearnerArgs {
    /// replay buffer size.
    #[arg(long, default_value_t = 200_000)]
    pub buffer: u32,
    /// epoch num.
    #[arg(long, default_value_t = 100)]
    pub epochs: u32,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Learner2Args {
    /// replay buffer size.
    #[arg(long, default_value_t = 200_000)]
    pub buffer: u32,
    /// epoch num.
    #[arg(long, default_value_t = 100)]
    pub epochs: u32,
    /// output flamegraph
    #[arg(long)]
    pub flamegraph: bool,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct GeneratorArgs {
    /// plays per write.
    #[arg(long, default_value_t = 100)]
    pub plays_per_write: u32,
    /// thread num.
    #[arg(long, default_value_t = 4)]
    pub thread_num: u32,
    /// mcts simulation num.
    #[arg(long, default_value_t = 500)]
    pub mcts_simulation_num: u32,
    /// output flamegraph
    #[arg(long)]
    pub flamegraph: bool,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorArgs {
    /// plays per write.
    #[arg(long, default_value_t = 10)]
    pub plays_per_write: u32,
    /// thread num.
    #[arg(long, default_value_t = 4)]
    pub thread_num: u32,
    /// mcts simulation num.
    #[arg(long, default_value_t = 500)]
    pub mcts_simulation_num: u32,
    /// output flamegraph
    #[arg(long)]
    pub flamegraph: bool,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct UploadArgs {
    /// source path.
    pub source: String,
    /// destination path.
    pub destination: String,
    /// content type.
    #[arg(long, default_value = "application/octet-stream")]
    pub content_type: String,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct DownloadArgs {
    /// source path.
    pub source: String,
    /// destination path.
    pub destination: String,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::New(_) => "new",
            Mode::Fit(_) => "fit",
            Mode::Learner(_) => "learner",
            Mode::Learner2(_) => "learner2",
            Mode::Generator(_) => "generator",
            Mode::Evaluator(_) => "evaluator",
            Mode::Gcs => "gcs",
            Mode::Upload(_) => "upload",
            Mode::Download(_) => "download",
        }
    }

    /// Modes whose child talks to the remote MySQL store, and therefore runs
    /// inside a tunnel with credentials injected.
    pub fn requires_remote_store(&self) -> bool {
        matches!(self, Mode::Learner2(_) | Mode::Generator(_) | Mode::Evaluator(_))
    }
}

// ==============================================================================
// Mode descriptors (introspected from the clap tree)
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSpec {
    /// `--flag` for options, the bare id for positionals.
    pub flag: String,
    pub takes_value: bool,
    pub default: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeDescriptor {
    pub name: String,
    pub about: String,
    pub options: Vec<OptionSpec>,
}

pub fn descriptors() -> Vec<ModeDescriptor> {
    let root = Cli::command();
    root.get_subcommands()
        .map(|sub| ModeDescriptor {
            name: sub.get_name().to_string(),
            about: sub.get_about().map(|a| a.to_string()).unwrap_or_default(),
            options: sub
                .get_arguments()
                .filter(|arg| !matches!(arg.get_id().as_str(), "help" | "version"))
                .map(|arg| OptionSpec {
                    flag: match arg.get_long() {
                        Some(long) => format!("--{}", long),
                        None => arg.get_id().to_string(),
                    },
                    takes_value: arg.get_action().takes_values(),
                    default: arg
                        .get_default_values()
                        .first()
                        .map(|v| v.to_string_lossy().into_owned()),
                    required: arg.is_required_set(),
                })
                .collect(),
        })
        .collect()
}

pub fn is_mode_name(token: &str) -> bool {
    descriptors().iter().any(|descriptor| descriptor.name == token)
}

// ==============================================================================
// Parsing
// ==============================================================================

#[derive(Debug)]
pub enum Parsed {
    Mode(Mode),
    /// No mode, or the first token is not a mode: print help and exit 0.
    /// Carries clap's complaint when there was one.
    Usage(Option<String>),
}

/// Parses the full argv (program name first). Errors inside a selected mode
/// are returned for clap to report; help/version requests are returned too
/// so `Error::exit` can print them with status 0.
pub fn parse_from<I, T>(args: I) -> Result<Parsed, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let selected = args.get(1).and_then(|t| t.to_str()).is_some_and(is_mode_name);

    match Cli::try_parse_from(&args) {
        Ok(Cli { mode: Some(mode) }) => Ok(Parsed::Mode(mode)),
        Ok(Cli { mode: None }) => Ok(Parsed::Usage(None)),
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => Err(err),
        Err(err) if !selected => Ok(Parsed::Usage(Some(err.to_string()))),
        Err(err) => Err(err),
    }
}

pub fn usage() -> String {
    Cli::command().render_help().to_string()
}
