//! STRAIGHT vocoding through one generated MATLAB batch script.

use crate::command::ToolCommand;
use crate::config::Context;
use crate::stage::{Stage, StageRunner};
use crate::stream_io::{remove_if_exists, utterance_file, value_count};
use crate::worker_pool::Ledger;
use anyhow::{Context as _, Result};
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

const FFT_BINS: u32 = 1025;

#[derive(Debug, Clone, Copy, Default)]
pub struct StraightRenderer;

impl StraightRenderer {
    pub fn render(&self, runner: &StageRunner<'_>, bases: &[String], ledger: &mut Ledger) -> Result<()> {
        info!("Parameter conversion (could be quite long)");
        runner.run(Stage::ParameterConversion, bases, ledger)?;

        let ctx = runner.ctx.as_ref();
        let mut entries = Vec::new();
        for base in ledger.active(bases) {
            match value_count(&utterance_file(runner.out_dir, &base, "f0")) {
                Ok(frames) => entries.push((base, frames)),
                Err(e) => ledger.record("straight", &base, format!("{e:#}")),
            }
        }
        if entries.is_empty() {
            return Ok(());
        }

        info!("Audio rendering (could be quite long)");
        let script = ctx.scratch.straight_script();
        std::fs::write(&script, straight_script(ctx, runner.out_dir, &entries))
            .with_context(|| format!("cannot write {}", script.display()))?;
        ToolCommand::new(&ctx.tools.matlab)
            .args(["-nojvm", "-nosplash", "-nodisplay"])
            .stdin_from(&script)
            .run()?;
        if !runner.preserve() {
            remove_if_exists(&script)?;
        }

        // failures inside the script only show up as missing waveforms
        for (base, _) in &entries {
            if !utterance_file(runner.out_dir, base, "wav").is_file() {
                ledger.record("straight", base, "no waveform rendered");
            }
        }
        Ok(())
    }
}

pub fn straight_script(ctx: &Context, out_dir: &Path, entries: &[(String, u64)]) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "path(path, '{}');", ctx.straight_path.as_deref().unwrap_or_default());
    let _ = writeln!(s, "prm.spectralUpdateInterval = {:.6};", ctx.signal.frameshift);
    s.push_str("prm.levelNormalizationIndicator = 0;\n\n");
    let _ = writeln!(s, "out_path = '{}';", out_dir.display());
    let _ = writeln!(s, "fft_len = {FFT_BINS};");
    let _ = writeln!(s, "samplerate = {};", ctx.signal.samplerate);

    s.push_str("basenames = {};\n");
    for (i, (base, _)) in entries.iter().enumerate() {
        let _ = writeln!(s, "basenames{{{}}} = '{}';", i + 1, base);
    }
    s.push('\n');
    s.push_str("nb_frames = [];\n");
    for (i, (_, frames)) in entries.iter().enumerate() {
        let _ = writeln!(s, "nb_frames({}) = {};", i + 1, frames);
    }
    s.push('\n');

    let looping = if ctx.options.nb_proc != 1 { "parfor" } else { "for" };
    let _ = writeln!(s, "{looping} i=1:{}", entries.len());
    s.push_str(
        "\ttry\n\
         \t\tfid_sp = fopen(sprintf('%s/%s.sp', out_path, basenames{i}), 'r', 'ieee-le');\n\
         \t\tfid_ap = fopen(sprintf('%s/%s.ap', out_path, basenames{i}), 'r', 'ieee-le');\n\
         \t\tfid_f0 = fopen(sprintf('%s/%s.f0', out_path, basenames{i}), 'r', 'ieee-le');\n\
         \t\tsp = fread(fid_sp, [fft_len nb_frames(i)], 'float');\n\
         \t\tap = fread(fid_ap, [fft_len nb_frames(i)], 'float');\n\
         \t\tf0 = fread(fid_f0, [1 nb_frames(i)], 'float');\n\
         \t\tfclose(fid_sp);\n\
         \t\tfclose(fid_ap);\n\
         \t\tfclose(fid_f0);\n\
         \t\t[sy] = exstraightsynth(f0, sp, ap, samplerate, prm);\n\
         \t\taudiowrite(sprintf('%s/%s.wav', out_path, basenames{i}), sy, samplerate);\n\
         \tcatch me\n\
         \t\twarning(sprintf('cannot render %s: %s', basenames{i}, me.message));\n\
         \tend;\n\
         end;\n\
         quit;\n",
    );
    s
}
