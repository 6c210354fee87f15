//! Model composition: HHEd grows the decision trees for the labels to
//! synthesize and writes the tied models HMGenS needs.

use crate::command::ToolCommand;
use crate::config::Context;
use anyhow::{anyhow, Context as _, Result};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::thread;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTarget {
    Cmp,
    Dur,
    Gv,
}

impl ModelTarget {
    pub fn name(&self) -> &'static str {
        match self {
            ModelTarget::Cmp => "cmp",
            ModelTarget::Dur => "dur",
            ModelTarget::Gv => "gv",
        }
    }

    fn trees(&self, ctx: &Context) -> Vec<PathBuf> {
        let ext = &ctx.synthesis.tree_ext;
        match self {
            ModelTarget::Cmp => ctx
                .streams
                .iter()
                .map(|s| ctx.models.cmp_tree.join(format!("{}.{}", s.kind, ext)))
                .collect(),
            ModelTarget::Dur => vec![ctx.models.dur_tree.join(format!("dur.{ext}"))],
            ModelTarget::Gv => ctx
                .streams
                .iter()
                .map(|s| ctx.models.gv_dir.join(format!("{}.inf", s.kind)))
                .collect(),
        }
    }

    /// (untied model, model list)
    fn sources(&self, ctx: &Context) -> (PathBuf, PathBuf) {
        match self {
            ModelTarget::Cmp => (ctx.models.cmp_model.clone(), ctx.models.full_list.clone()),
            ModelTarget::Dur => (ctx.models.dur_model.clone(), ctx.models.full_list.clone()),
            ModelTarget::Gv => (
                ctx.models.gv_dir.join("clustered.mmf"),
                ctx.models.gv_dir.join("gv.list"),
            ),
        }
    }
}

/// HHEd script: load the trees, make the unseen models, compact to the tied list.
pub fn unseen_script(ctx: &Context, target: ModelTarget) -> String {
    let mut script = String::from("\nTR 2\n\n");
    script.push_str("// Load trees\n");
    for tree in target.trees(ctx) {
        let _ = write!(script, "LT \"{}\"\n\n", tree.display());
    }
    script.push_str("// Make unseen\n");
    let _ = write!(script, "AU \"{}\"\n\n", ctx.scratch.label_list().display());
    script.push_str("// Compact\n");
    let _ = write!(
        script,
        "CO \"{}\"\n\n",
        ctx.scratch.tied_list(target.name()).display()
    );
    script
}

pub fn compose(ctx: &Context, target: ModelTarget) -> Result<()> {
    let hed = ctx.scratch.hed_script(target.name());
    std::fs::write(&hed, unseen_script(ctx, target))
        .with_context(|| format!("cannot write {}", hed.display()))?;

    info!("{} unseen model building", target.name().to_uppercase());
    let (model, list) = target.sources(ctx);
    ToolCommand::new(&ctx.tools.hhed)
        .args(["-A", "-B", "-C"])
        .arg(ctx.scratch.train_config())
        .args(["-D", "-T", "1", "-p", "-i", "-H"])
        .arg(model)
        .arg("-w")
        .arg(ctx.scratch.composed_model(target.name()))
        .arg(&hed)
        .arg(list)
        .run_checked()
        .with_context(|| format!("{} model composition failed", target.name()))?;
    Ok(())
}

/// Composes every needed model. Targets are independent, so with more than one
/// worker they run side by side; all of them finish before this returns.
pub fn compose_all(ctx: &Context, use_gv: bool) -> Result<()> {
    let mut targets = vec![ModelTarget::Cmp, ModelTarget::Dur];
    if use_gv {
        targets.push(ModelTarget::Gv);
    }

    if ctx.options.nb_proc == 1 {
        return targets.into_iter().try_for_each(|t| compose(ctx, t));
    }

    thread::scope(|scope| {
        let handles: Vec<_> = targets
            .iter()
            .map(|&target| scope.spawn(move || compose(ctx, target)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("model composition panicked"))?)
            .collect::<Result<Vec<_>>>()
    })?;
    Ok(())
}
