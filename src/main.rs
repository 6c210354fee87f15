mod command;
mod composition;
mod config;
mod driver;
mod error;
mod full_context_label;
mod generation;
mod hts_config;
mod inference;
mod overlay;
mod rendering;
mod stage;
mod stream_io;
mod utterance;
mod worker_pool;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use config::RunOptions;
use driver::{scratch_dir, Pipeline};
use error::PipelineError;
use overlay::ImposedOverrides;
use stage::Stage;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use worker_pool::{CancellationToken, WorkerMode};

/// Statistical parametric speech synthesis from full-context labels.
#[derive(Parser, Debug)]
#[command(name = "htsvox", version, about)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    synth: SynthArgs,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write the log to this file
    #[arg(short = 'l', long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SynthArgs {
    /// Configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Parameter generation type given to HMGenS
    #[arg(short, long, default_value_t = 0)]
    pg_type: u32,

    /// Number of workers
    #[arg(short = 'P', long, default_value_t = 1)]
    nb_proc: usize,

    /// Keep intermediate files
    #[arg(short = 'r', long)]
    preserve: bool,

    /// Use the durations given by the labels
    #[arg(short = 'D', long)]
    imposed_duration: bool,

    #[arg(short = 'R', long)]
    renderer: Option<String>,

    #[arg(short = 'G', long)]
    generator: Option<String>,

    #[arg(short = 'M', long)]
    impose_mgc_dir: Option<PathBuf>,

    #[arg(short = 'B', long)]
    impose_bap_dir: Option<PathBuf>,

    #[arg(short = 'F', long)]
    impose_f0_dir: Option<PathBuf>,

    #[arg(short = 'I', long)]
    impose_interpolated_f0_dir: Option<PathBuf>,

    /// STRAIGHT toolkit directory
    #[arg(short = 'S', long)]
    straight_path: Option<String>,

    #[arg(long, value_enum, default_value_t = WorkerMode::Thread)]
    worker_mode: WorkerMode,

    /// Parent of the per-run scratch directory
    #[arg(long, default_value = "tmp")]
    tmp_dir: PathBuf,

    /// Label file, list of label files, or directory of label files
    #[arg(required = true)]
    input: Option<PathBuf>,

    /// Output directory
    #[arg(required = true)]
    output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs one stage for one utterance (used by process-mode workers)
    #[command(hide = true)]
    WorkUnit(WorkUnitArgs),
}

#[derive(Args, Debug)]
struct WorkUnitArgs {
    #[arg(long, value_enum)]
    stage: Stage,
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    tmp_dir: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    preserve: bool,
    #[arg(long)]
    generator: Option<String>,
    #[arg(long)]
    renderer: Option<String>,
    #[arg(long)]
    straight_path: Option<String>,
    base: String,
}

impl SynthArgs {
    fn run_options(&self) -> RunOptions {
        let mut options = RunOptions::new(&self.config, scratch_dir(&self.tmp_dir));
        options.nb_proc = self.nb_proc;
        options.preserve = self.preserve;
        options.imposed_duration = self.imposed_duration;
        options.pg_type = self.pg_type;
        options.worker_mode = self.worker_mode;
        options.generator = self.generator.clone();
        options.renderer = self.renderer.clone();
        options.straight_path = self.straight_path.clone();
        options.overrides = self.overrides();
        options
    }

    fn overrides(&self) -> ImposedOverrides {
        ImposedOverrides {
            f0: self.impose_f0_dir.clone(),
            interpolated_f0: self.impose_interpolated_f0_dir.clone(),
            mgc: self.impose_mgc_dir.clone(),
            bap: self.impose_bap_dir.clone(),
        }
    }
}

impl Cli {
    /// Argument checks that must pass before anything is written.
    fn preflight(&self) -> Result<(), PipelineError> {
        match self.command {
            Some(_) => Ok(()),
            None => self.synth.overrides().validate(),
        }
    }
}

impl WorkUnitArgs {
    fn run_options(&self) -> RunOptions {
        let mut options = RunOptions::new(&self.config, &self.tmp_dir);
        options.preserve = self.preserve;
        options.generator = self.generator.clone();
        options.renderer = self.renderer.clone();
        options.straight_path = self.straight_path.clone();
        options
    }
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn synthesize(args: SynthArgs) -> Result<ExitCode> {
    let (Some(input), Some(output)) = (&args.input, &args.output) else {
        anyhow::bail!("an input and an output are required");
    };

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("interrupted, finishing the utterances in progress");
        handler_token.cancel();
    }) {
        warn!("cannot install the interrupt handler: {}", e);
    }

    let started = Instant::now();
    let epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    info!("Start synthesis at {}s since epoch", epoch.as_secs());

    let pipeline = Pipeline::new(args.run_options(), input, output, cancel)?;
    let ctx = pipeline.context();
    info!(
        "Generator {:?}, renderer {:?}, {} worker(s)",
        ctx.generator, ctx.renderer, ctx.options.nb_proc
    );
    let summary = pipeline.run()?;

    info!(
        "Synthesis done in {:.2} minutes",
        started.elapsed().as_secs_f64() / 60.0
    );
    if summary.is_complete() {
        return Ok(ExitCode::SUCCESS);
    }
    for (base, reason) in &summary.failures {
        error!("{}: {}", base, reason);
    }
    error!(
        "{} of {} utterances failed",
        summary.failures.len(),
        summary.total
    );
    Ok(ExitCode::from(2))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = cli.preflight() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = init_logging(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("warning: {e:#}");
    }

    let result = match cli.command {
        Some(Command::WorkUnit(unit)) => {
            stage::run_work_unit(unit.run_options(), unit.stage, &unit.output, &unit.base)
                .map(|()| ExitCode::SUCCESS)
        }
        None => synthesize(cli.synth),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {e:?}");
            ExitCode::FAILURE
        }
    }
}
