//! One synthesis run: labels in, rendered artefacts out.

use crate::config::{Context, GeneratorKind, RunOptions};
use crate::error::PipelineError;
use crate::generation;
use crate::rendering::Renderer;
use crate::stage::StageRunner;
use crate::utterance::UtteranceSet;
use crate::worker_pool::{CancellationToken, Ledger, WorkerPool};
use anyhow::{Context as _, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct RunSummary {
    pub total: usize,
    /// Utterances that dropped out, with the stage and reason.
    pub failures: BTreeMap<String, String>,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Pipeline {
    ctx: Arc<Context>,
    input: PathBuf,
    out_dir: PathBuf,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        options: RunOptions,
        input: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let ctx = Context::load(options)?;
        Ok(Self {
            ctx: Arc::new(ctx),
            input: input.into(),
            out_dir: out_dir.into(),
            cancel,
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Runs every step, then clears the scratch directory unless asked to keep it.
    pub fn run(&self) -> Result<RunSummary> {
        let result = self.run_steps();
        if !self.ctx.options.preserve {
            let scratch = &self.ctx.scratch.root;
            if scratch.exists() {
                if let Err(e) = std::fs::remove_dir_all(scratch) {
                    warn!("cannot remove {}: {}", scratch.display(), e);
                }
            }
        }
        result
    }

    fn run_steps(&self) -> Result<RunSummary> {
        let ctx = self.ctx.as_ref();
        for dir in [&self.out_dir, &ctx.scratch.root] {
            std::fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
        }

        let utterances = UtteranceSet::resolve(&self.input)?;
        if utterances.is_empty() {
            warn!("no utterance found in {}", self.input.display());
            return Ok(RunSummary::default());
        }
        info!("{} utterances to synthesize", utterances.len());

        if ctx.generator != GeneratorKind::None {
            info!("Generate label list");
            let count = utterances.write_label_list(&ctx.scratch.label_list())?;
            info!("{} distinct context labels", count);
        }

        let pool = WorkerPool::new(ctx.options.nb_proc, self.cancel.clone());
        let runner = StageRunner {
            ctx: &self.ctx,
            out_dir: &self.out_dir,
            pool: &pool,
        };
        let bases = utterances.bases();
        let mut ledger = Ledger::new();

        generation::generate(ctx.generator, &runner, &utterances, ctx.use_gv, &mut ledger)?;
        self.check_cancelled()?;

        if !ctx.options.overrides.is_empty() {
            ctx.options.overrides.apply(&self.out_dir, &bases, &mut ledger)?;
        }

        Renderer::from_kind(ctx.renderer).render(&runner, &bases, &mut ledger)?;
        self.check_cancelled()?;

        Ok(RunSummary {
            total: utterances.len(),
            failures: ledger.failures().clone(),
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled.into());
        }
        Ok(())
    }
}

/// Per-run scratch directory under `tmp_dir`, unique to this process.
pub fn scratch_dir(tmp_dir: &Path) -> PathBuf {
    tmp_dir.join(format!("run_{}", std::process::id()))
}
