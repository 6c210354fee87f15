//! DNN-based generation.
//!
//! Durations still come from HMGenS. Each duration file becomes a frame-level
//! label and an input feature matrix, all utterances go through the network
//! in one batch, and the output is split back into streams smoothed by `mlpg`.

use crate::command::ToolCommand;
use crate::config::{Context, StreamDescriptor, StreamKind};
use crate::error::PipelineError;
use crate::full_context_label::convert_duration_file;
use crate::generation::default;
use crate::inference::FrameRegressor;
use crate::overlay::UNVOICED;
use crate::stage::{Stage, StageRunner};
use crate::stream_io::{read_f32, read_frames, remove_if_exists, utterance_file, write_f32, write_frames};
use crate::utterance::UtteranceSet;
use crate::worker_pool::{Ledger, WorkUnit};
use anyhow::{Context as _, Result};
use ndarray::{s, Array2, ArrayView2, Axis};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub fn generate(
    runner: &StageRunner<'_>,
    utterances: &UtteranceSet,
    use_gv: bool,
    ledger: &mut Ledger,
) -> Result<()> {
    let ctx = runner.ctx.as_ref();
    default::generate(runner, utterances, use_gv, ledger)?;

    let bases = ledger.active(&utterances.bases());
    for base in &bases {
        for stream in &ctx.streams {
            remove_if_exists(&utterance_file(runner.out_dir, base, stream.kind.extension()))?;
        }
    }

    runner.run(Stage::DnnPrepare, &bases, ledger)?;
    forward_all(ctx, runner.out_dir, &ledger.active(&bases), ledger)?;
    runner.run(Stage::DnnExtract, &bases, ledger)
}

/// Barrier between the two pools: one network pass over every prepared utterance.
fn forward_all(ctx: &Context, out_dir: &Path, bases: &[String], ledger: &mut Ledger) -> Result<()> {
    if bases.is_empty() {
        return Ok(());
    }
    let mut inputs = Vec::with_capacity(bases.len());
    let mut kept = Vec::with_capacity(bases.len());
    for base in bases {
        match read_frames(&utterance_file(out_dir, base, "ffi"), ctx.dnn.num_input_units) {
            Ok(frames) => {
                inputs.push(frames);
                kept.push(base);
            }
            Err(e) => ledger.record("dnn-forward", base, format!("{e:#}")),
        }
    }

    info!("Forward {} utterances through {}", kept.len(), ctx.models.dnn_model.display());
    let regressor = FrameRegressor::load(
        &ctx.models.dnn_model,
        &ctx.dnn.input_name,
        &ctx.dnn.output_name,
    )
    .with_context(|| format!("cannot load {}", ctx.models.dnn_model.display()))?;
    let outputs = regressor.forward_batch(&inputs)?;

    let expected: usize = ctx.dnn_streams.iter().map(StreamDescriptor::dim).sum();
    for (base, output) in kept.into_iter().zip(outputs) {
        if output.nrows() == 0 {
            ledger.record("dnn-forward", base, "no frames to forward");
            continue;
        }
        if output.ncols() != expected {
            ledger.record(
                "dnn-forward",
                base,
                format!("network output has {} columns, streams need {}", output.ncols(), expected),
            );
            continue;
        }
        write_frames(&utterance_file(out_dir, base, "ffo"), &output)?;
        if !ctx.options.preserve {
            remove_if_exists(&utterance_file(out_dir, base, "ffi"))?;
        }
    }
    Ok(())
}

/// `B.dur` -> `B.lab` -> `B.ffi`.
pub struct PrepareUnit {
    ctx: Arc<Context>,
    out_dir: PathBuf,
}

impl PrepareUnit {
    pub fn new(ctx: Arc<Context>, out_dir: PathBuf) -> Self {
        Self { ctx, out_dir }
    }
}

impl WorkUnit for PrepareUnit {
    fn stage(&self) -> Stage {
        Stage::DnnPrepare
    }

    fn process(&self, base: &str) -> Result<()> {
        let ctx = &self.ctx;
        let ticks = ctx.frameshift_ticks();
        let dur = utterance_file(&self.out_dir, base, "dur");
        let lab = utterance_file(&self.out_dir, base, "lab");
        info!("starting DNN generation for {}", base);
        let frames = convert_duration_file(&dur, &lab, ctx.nb_emitting_states, ticks)
            .with_context(|| format!("cannot convert {}", dur.display()))?;
        debug!("{}: {} frames", base, frames);

        let text = utterance_file(&self.out_dir, base, "ffi.txt");
        ToolCommand::from_argv(&ctx.tools.featurizer)?
            .arg(&ctx.models.dnn_qconf)
            .arg(ticks.to_string())
            .arg(&lab)
            .stdout_to(&text)
            .run_checked()?;
        ToolCommand::new(&ctx.tools.x2x)
            .arg("+af")
            .stdin_from(&text)
            .stdout_to(utterance_file(&self.out_dir, base, "ffi"))
            .run_checked()?;
        if !ctx.options.preserve {
            remove_if_exists(&text)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StreamPlan {
    kind: StreamKind,
    order: usize,
    offset: usize,
    dim: usize,
    variance: Vec<f32>,
    delta: Vec<String>,
    accel: Vec<String>,
}

/// `B.ffo` -> one smoothed file per stream.
pub struct ExtractUnit {
    ctx: Arc<Context>,
    out_dir: PathBuf,
    width: usize,
    plans: Vec<StreamPlan>,
}

impl ExtractUnit {
    pub fn new(ctx: Arc<Context>, out_dir: PathBuf) -> Result<Self> {
        let win_dir = ctx.scratch.win_dir();
        let mut plans = Vec::with_capacity(ctx.dnn_streams.len());
        let mut offset = 0;
        for stream in &ctx.dnn_streams {
            let dim = stream.dim();
            let mut plan = StreamPlan {
                kind: stream.kind,
                order: stream.order,
                offset,
                dim,
                variance: Vec::new(),
                delta: Vec::new(),
                accel: Vec::new(),
            };
            if stream.kind != StreamKind::Vuv {
                if stream.winfiles.len() < 3 {
                    return Err(PipelineError::MissingWindows {
                        kind: stream.kind.to_string(),
                        count: stream.winfiles.len(),
                    }
                    .into());
                }
                let var_path = ctx.models.dnn_var_dir.join(format!("{}.var", stream.kind));
                plan.variance = read_f32(&var_path)?;
                if plan.variance.len() != dim {
                    return Err(PipelineError::MalformedStream {
                        path: var_path,
                        reason: format!("{} variances for a {}-dimensional stream", plan.variance.len(), dim),
                    }
                    .into());
                }
                plan.delta = window_coefficients(&window_path(&win_dir, &stream.winfiles[1]))?;
                plan.accel = window_coefficients(&window_path(&win_dir, &stream.winfiles[2]))?;
            }
            offset += dim;
            plans.push(plan);
        }
        Ok(Self {
            ctx,
            out_dir,
            width: offset,
            plans,
        })
    }

    fn file(&self, base: &str, ext: &str) -> PathBuf {
        utterance_file(&self.out_dir, base, ext)
    }

    fn smooth(&self, base: &str, plan: &StreamPlan, ffo: &Array2<f32>) -> Result<()> {
        debug!("{} stream DNN in process", plan.kind);
        let mean = ffo.slice(s![.., plan.offset..plan.offset + plan.dim]);
        let mv = self.file(base, &format!("{}.mv", plan.kind));
        write_frames(&mv, &with_variance(mean, &plan.variance))?;

        let target = self.file(base, plan.kind.extension());
        ToolCommand::new(&self.ctx.tools.mlpg)
            .arg("-m")
            .arg(plan.order.to_string())
            .arg("-d")
            .args(&plan.delta)
            .arg("-d")
            .args(&plan.accel)
            .arg(&mv)
            .stdout_to(&target)
            .run_checked()
            .with_context(|| format!("{} stream of {}", plan.kind, base))?;
        if !self.ctx.options.preserve {
            remove_if_exists(&mv)?;
        }
        Ok(())
    }
}

impl WorkUnit for ExtractUnit {
    fn stage(&self) -> Stage {
        Stage::DnnExtract
    }

    fn process(&self, base: &str) -> Result<()> {
        let ffo_path = self.file(base, "ffo");
        let ffo = read_frames(&ffo_path, self.width)?;

        // the voicing mask is needed by lf0, whatever the stream order
        let mut vuv = None;
        for plan in self.plans.iter().filter(|p| p.kind == StreamKind::Vuv) {
            let mask = voicing_mask(ffo.column(plan.offset).iter().copied());
            write_f32(&self.file(base, "vuv"), &mask)?;
            vuv = Some(mask);
        }

        for plan in self.plans.iter().filter(|p| p.kind != StreamKind::Vuv) {
            self.smooth(base, plan, &ffo)?;
            if plan.kind == StreamKind::Lf0 {
                if let Some(mask) = &vuv {
                    let path = self.file(base, "lf0");
                    write_f32(&path, &mask_unvoiced(read_f32(&path)?, mask))?;
                    if !self.ctx.options.preserve {
                        remove_if_exists(&self.file(base, "vuv"))?;
                    }
                }
            }
        }

        if !self.ctx.options.preserve {
            remove_if_exists(&ffo_path)?;
        }
        Ok(())
    }
}

fn window_path(win_dir: &Path, winfile: &str) -> PathBuf {
    win_dir.join(Path::new(winfile).file_name().unwrap_or_default())
}

/// Coefficients of an HTS window file: its first line minus the leading count.
pub fn window_coefficients(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read window {}", path.display()))?;
    Ok(text
        .lines()
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .skip(1)
        .map(str::to_string)
        .collect())
}

pub fn voicing_mask(mean: impl Iterator<Item = f32>) -> Vec<f32> {
    mean.map(|v| if v >= 0.5 { 1.0 } else { 0.0 }).collect()
}

/// Appends the per-dimension variances to every frame of means, as `mlpg` reads them.
pub fn with_variance(mean: ArrayView2<f32>, variance: &[f32]) -> Array2<f32> {
    let (frames, dim) = mean.dim();
    let mut out = Array2::zeros((frames, 2 * dim));
    out.slice_mut(s![.., ..dim]).assign(&mean);
    for mut row in out.slice_mut(s![.., dim..]).axis_iter_mut(Axis(0)) {
        for (cell, v) in row.iter_mut().zip(variance) {
            *cell = *v;
        }
    }
    out
}

/// Zeroes the unvoiced frames, then marks every zero as unvoiced.
pub fn mask_unvoiced(mut lf0: Vec<f32>, vuv: &[f32]) -> Vec<f32> {
    for (value, voiced) in lf0.iter_mut().zip(vuv) {
        *value *= *voiced;
    }
    for value in lf0.iter_mut() {
        if *value == 0.0 {
            *value = UNVOICED;
        }
    }
    lf0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn voicing_threshold_is_inclusive() {
        assert_eq!(
            voicing_mask([0.2, 0.5, 0.9, -1.0].into_iter()),
            vec![0.0, 1.0, 1.0, 0.0]
        );
    }

    #[test]
    fn variance_follows_each_mean_frame() {
        let mean = array![[1.0, 2.0], [3.0, 4.0]];
        let merged = with_variance(mean.view(), &[0.1, 0.2]);
        assert_eq!(merged, array![[1.0, 2.0, 0.1, 0.2], [3.0, 4.0, 0.1, 0.2]]);
    }

    #[test]
    fn unvoiced_frames_get_the_sentinel() {
        let lf0 = mask_unvoiced(vec![4.6, 4.7, 4.8], &[1.0, 0.0, 1.0]);
        assert_eq!(lf0, vec![4.6, UNVOICED, 4.8]);
    }

    #[test]
    fn window_file_coefficients_skip_the_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mgc.win2");
        std::fs::write(&path, "3 -0.5 0.0 0.5\n").unwrap();
        assert_eq!(window_coefficients(&path).unwrap(), vec!["-0.5", "0.0", "0.5"]);
    }

    #[cfg(unix)]
    #[test]
    fn extract_splits_streams_and_masks_lf0() {
        use crate::config::tests::sample_document;
        use crate::config::RunOptions;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("voice");
        let scratch = dir.path().join("tmp");
        let out = dir.path().join("out");
        for d in [project.join("DNN/var"), scratch.join("win"), out.clone()] {
            std::fs::create_dir_all(d).unwrap();
        }
        for win in ["lf0.win1", "lf0.win2", "lf0.win3"] {
            std::fs::write(scratch.join("win").join(win), "3 -0.5 0.0 0.5\n").unwrap();
        }
        write_f32(&project.join("DNN/var/lf0.var"), &[0.1, 0.2, 0.3]).unwrap();

        // stand-in for mlpg printing a fixed trajectory
        let trajectory = dir.path().join("trajectory");
        write_f32(&trajectory, &[5.0, 6.0]).unwrap();
        let mlpg = dir.path().join("mlpg");
        std::fs::write(&mlpg, format!("#!/bin/sh\ncat {}\n", trajectory.display())).unwrap();
        std::fs::set_permissions(&mlpg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut doc = sample_document();
        doc["settings"]["synthesis"]["generator"] = serde_json::json!("dnn");
        doc["models"]["ffo"] = serde_json::json!({ "streams": [
            { "kind": "lf0", "order": 0, "winfiles": ["win/lf0.win1", "win/lf0.win2", "win/lf0.win3"] },
            { "kind": "vuv", "order": 0 }
        ]});
        doc["path"] = serde_json::json!({ "mlpg": mlpg.display().to_string() });
        let ctx = Context::from_document(
            serde_json::from_value(doc).unwrap(),
            project.clone(),
            RunOptions::new(project.join("config.json"), &scratch),
        )
        .unwrap();

        // 2 frames of 3 lf0 values then 1 vuv value
        write_f32(&out.join("u.ffo"), &[5.0, 0.0, 0.0, 0.9, 6.0, 0.0, 0.0, 0.1]).unwrap();
        let unit = ExtractUnit::new(Arc::new(ctx), out.clone()).unwrap();
        unit.process("u").unwrap();

        assert_eq!(read_f32(&out.join("u.lf0")).unwrap(), vec![5.0, UNVOICED]);
        assert!(!out.join("u.ffo").exists());
        assert!(!out.join("u.vuv").exists());
        assert!(!out.join("u.lf0.mv").exists());
    }
}
