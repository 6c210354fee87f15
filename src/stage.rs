//! Per-utterance stages and how a pool runs them: in this process, or by
//! re-invoking this executable once per utterance.

use crate::command::ToolCommand;
use crate::config::{Context, RunOptions};
use crate::error::PipelineError;
use crate::generation::dnn::{ExtractUnit, PrepareUnit};
use crate::rendering::conversion::ConversionUnit;
use crate::rendering::ema::EmaUnit;
use crate::rendering::weight::WeightUnit;
use crate::rendering::world::WorldUnit;
use crate::worker_pool::{Ledger, WorkUnit, WorkerMode, WorkerPool};
use anyhow::{Context as _, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Stage {
    /// duration -> frame label -> input features
    DnnPrepare,
    /// network output -> smoothed streams
    DnnExtract,
    ParameterConversion,
    WorldSynthesis,
    EmaRendering,
    WeightRendering,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::DnnPrepare => "dnn-prepare",
            Stage::DnnExtract => "dnn-extract",
            Stage::ParameterConversion => "parameter-conversion",
            Stage::WorldSynthesis => "world-synthesis",
            Stage::EmaRendering => "ema-rendering",
            Stage::WeightRendering => "weight-rendering",
        };
        f.write_str(name)
    }
}

/// Builds the in-process implementation of `stage`.
pub fn local_unit(ctx: Arc<Context>, stage: Stage, out_dir: &Path) -> Result<Arc<dyn WorkUnit>> {
    let out_dir = out_dir.to_path_buf();
    Ok(match stage {
        Stage::DnnPrepare => Arc::new(PrepareUnit::new(ctx, out_dir)),
        Stage::DnnExtract => Arc::new(ExtractUnit::new(ctx, out_dir)?),
        Stage::ParameterConversion => Arc::new(ConversionUnit::new(ctx, out_dir)),
        Stage::WorldSynthesis => Arc::new(WorldUnit::new(ctx, out_dir)),
        Stage::EmaRendering => Arc::new(EmaUnit::new(ctx, out_dir)),
        Stage::WeightRendering => Arc::new(WeightUnit::new(ctx, out_dir)?),
    })
}

/// Unit to hand to a pool, honouring the configured worker mode.
pub fn unit_for(ctx: &Arc<Context>, stage: Stage, out_dir: &Path) -> Result<Arc<dyn WorkUnit>> {
    match ctx.options.worker_mode {
        WorkerMode::Thread => local_unit(Arc::clone(ctx), stage, out_dir),
        WorkerMode::Process => Ok(Arc::new(ProcessUnit::new(&ctx.options, stage, out_dir)?)),
    }
}

/// What every pooled stage of one run shares.
pub struct StageRunner<'a> {
    pub ctx: &'a Arc<Context>,
    pub out_dir: &'a Path,
    pub pool: &'a WorkerPool,
}

impl StageRunner<'_> {
    /// Runs `stage` over the utterances of `bases` still in the run; failures
    /// land in the ledger.
    pub fn run(&self, stage: Stage, bases: &[String], ledger: &mut Ledger) -> Result<()> {
        let active = ledger.active(bases);
        if active.is_empty() {
            return Ok(());
        }
        info!("{} ({} utterances, {} workers)", stage, active.len(), self.pool.size());
        let unit = unit_for(self.ctx, stage, self.out_dir)?;
        ledger.absorb(self.pool.run(unit, &active));
        Ok(())
    }

    pub fn preserve(&self) -> bool {
        self.ctx.options.preserve
    }
}

/// Runs one stage for one utterance inside a child process.
pub struct ProcessUnit {
    stage: Stage,
    program: PathBuf,
    prefix: Vec<String>,
}

impl ProcessUnit {
    pub fn new(options: &RunOptions, stage: Stage, out_dir: &Path) -> Result<Self> {
        let program = std::env::current_exe().context("cannot locate the running executable")?;
        Ok(Self::with_program(program, options, stage, out_dir))
    }

    fn with_program(program: PathBuf, options: &RunOptions, stage: Stage, out_dir: &Path) -> Self {
        let mut prefix = vec![
            "work-unit".to_string(),
            "--stage".to_string(),
            stage.to_string(),
            "--config".to_string(),
            options.config_path.display().to_string(),
            "--tmp-dir".to_string(),
            options.scratch_dir.display().to_string(),
            "--output".to_string(),
            out_dir.display().to_string(),
        ];
        if options.preserve {
            prefix.push("--preserve".to_string());
        }
        let forwarded = [
            ("--generator", &options.generator),
            ("--renderer", &options.renderer),
            ("--straight-path", &options.straight_path),
        ];
        for (flag, value) in forwarded {
            if let Some(value) = value {
                prefix.push(flag.to_string());
                prefix.push(value.clone());
            }
        }
        Self {
            stage,
            program,
            prefix,
        }
    }

    fn command(&self, base: &str) -> ToolCommand {
        ToolCommand::new(&self.program).args(&self.prefix).arg(base)
    }
}

impl WorkUnit for ProcessUnit {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn process(&self, base: &str) -> Result<()> {
        let outcome = self.command(base).run()?;
        if !outcome.success() {
            return Err(PipelineError::StageFailed {
                stage: self.stage.to_string(),
                base: base.to_string(),
                status: outcome.status.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Entry point of a child process started by [`ProcessUnit`].
pub fn run_work_unit(options: RunOptions, stage: Stage, out_dir: &Path, base: &str) -> Result<()> {
    let ctx = Arc::new(Context::load(options)?);
    local_unit(ctx, stage, out_dir)?.process(base)
}
