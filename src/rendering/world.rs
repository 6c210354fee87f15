use crate::command::ToolCommand;
use crate::config::{Context, RendererKind, WorldConversion};
use crate::error::PipelineError;
use crate::stage::{Stage, StageRunner};
use crate::stream_io::{read_f32, remove_if_exists, utterance_file};
use crate::worker_pool::{Ledger, WorkUnit};
use anyhow::{anyhow, Context as _, Result};
use ndarray::Array2;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct WorldRenderer;

impl WorldRenderer {
    pub fn render(&self, runner: &StageRunner<'_>, bases: &[String], ledger: &mut Ledger) -> Result<()> {
        info!("Parameter conversion (could be quite long)");
        runner.run(Stage::ParameterConversion, bases, ledger)?;
        info!("Audio rendering (could be quite long)");
        runner.run(Stage::WorldSynthesis, bases, ledger)
    }
}

/// Reads a converted stream as `frames x dim`, the width following from the
/// F0 frame count.
pub fn frame_major(path: &Path, frames: usize) -> Result<Array2<f32>> {
    let values = read_f32(path)?;
    if frames == 0 || values.len() % frames != 0 {
        return Err(PipelineError::MalformedStream {
            path: path.to_path_buf(),
            reason: format!("{} values do not split into {} frames", values.len(), frames),
        }
        .into());
    }
    let dim = values.len() / frames;
    Ok(Array2::from_shape_vec((frames, dim), values)?)
}

/// Spectrum and aperiodicity as WORLD takes them: one `f64` row per frame,
/// both of the same width.
pub fn spectral_rows(sp: &Path, ap: &Path, frames: usize) -> Result<(Vec<Vec<f64>>, Vec<Vec<f64>>)> {
    let sp_matrix = frame_major(sp, frames)?;
    let ap_matrix = frame_major(ap, frames)?;
    if sp_matrix.ncols() < 2 || sp_matrix.ncols() != ap_matrix.ncols() {
        return Err(PipelineError::MalformedStream {
            path: ap.to_path_buf(),
            reason: format!(
                "{} aperiodicity bins for {} spectrum bins",
                ap_matrix.ncols(),
                sp_matrix.ncols()
            ),
        }
        .into());
    }
    Ok((rows_f64(&sp_matrix), rows_f64(&ap_matrix)))
}

fn rows_f64(matrix: &Array2<f32>) -> Vec<Vec<f64>> {
    matrix
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|v| f64::from(*v)).collect())
        .collect()
}

pub struct WorldUnit {
    ctx: Arc<Context>,
    out_dir: PathBuf,
    conversion: WorldConversion,
}

impl WorldUnit {
    pub fn new(ctx: Arc<Context>, out_dir: PathBuf) -> Self {
        let conversion = match ctx.renderer {
            RendererKind::World(conversion) => conversion,
            _ => WorldConversion::InProcess,
        };
        Self {
            ctx,
            out_dir,
            conversion,
        }
    }

    fn file(&self, base: &str, ext: &str) -> PathBuf {
        utterance_file(&self.out_dir, base, ext)
    }

    fn synthesize_in_process(&self, base: &str) -> Result<()> {
        let f0: Vec<f64> = read_f32(&self.file(base, "f0"))?
            .into_iter()
            .map(f64::from)
            .collect();
        let (sp, ap) = spectral_rows(&self.file(base, "sp"), &self.file(base, "ap"), f0.len())?;

        let samplerate = self.ctx.signal.samplerate;
        let samples = rsworld::synthesis(&f0, &sp, &ap, self.ctx.signal.frameshift, samplerate as i32);
        let wav: Vec<f32> = samples.iter().map(|s| *s as f32).collect();

        let path = self.file(base, "wav");
        let head = wav_io::new_header(samplerate, 32, true, true);
        let mut file = File::create(&path).with_context(|| format!("cannot create {}", path.display()))?;
        wav_io::write_to_file(&mut file, &head, &wav)
            .map_err(|_| anyhow!("cannot write {}", path.display()))?;
        info!("{}: {} samples", path.display(), wav.len());
        Ok(())
    }

    fn synthesize_external(&self, base: &str) -> Result<Vec<PathBuf>> {
        let mut doubles = Vec::with_capacity(3);
        for ext in ["f0", "sp", "ap"] {
            let double = self.file(base, &format!("d{ext}"));
            ToolCommand::new(&self.ctx.tools.x2x)
                .arg("+fd")
                .stdin_from(&self.file(base, ext))
                .stdout_to(&double)
                .run_checked()?;
            doubles.push(double);
        }

        ToolCommand::new(&self.ctx.tools.world_synthesis)
            .arg("-s")
            .arg(self.ctx.signal.samplerate.to_string())
            .arg("-f")
            .arg(self.ctx.signal.frameshift.to_string())
            .args(&doubles)
            .arg(self.file(base, "wav"))
            .run_checked()?;
        Ok(doubles)
    }
}

impl WorkUnit for WorldUnit {
    fn stage(&self) -> Stage {
        Stage::WorldSynthesis
    }

    fn process(&self, base: &str) -> Result<()> {
        let doubles = match self.conversion {
            WorldConversion::InProcess => {
                self.synthesize_in_process(base)?;
                Vec::new()
            }
            WorldConversion::X2x => self.synthesize_external(base)?,
        };

        if !self.ctx.options.preserve {
            for ext in ["f0", "sp", "ap"] {
                remove_if_exists(&self.file(base, ext))?;
            }
            for path in &doubles {
                remove_if_exists(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_io::write_f32;

    #[test]
    fn spectra_are_split_by_f0_frames() {
        let dir = tempfile::tempdir().unwrap();
        let sp = dir.path().join("u.sp");
        write_f32(&sp, &[0.0; 12]).unwrap();
        assert_eq!(frame_major(&sp, 3).unwrap().dim(), (3, 4));
        assert!(frame_major(&sp, 5).is_err());
        assert!(frame_major(&sp, 0).is_err());
    }

    #[test]
    fn spectra_and_aperiodicity_must_agree() {
        let dir = tempfile::tempdir().unwrap();
        let sp = dir.path().join("u.sp");
        let ap = dir.path().join("u.ap");
        write_f32(&sp, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        write_f32(&ap, &[0.5; 6]).unwrap();

        let (sp_rows, ap_rows) = spectral_rows(&sp, &ap, 2).unwrap();
        assert_eq!(sp_rows, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        assert_eq!(ap_rows.len(), 2);

        write_f32(&ap, &[0.5; 4]).unwrap();
        let err = spectral_rows(&sp, &ap, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MalformedStream { .. })
        ));
    }

    #[test]
    fn synthesises_a_waveform_in_process() {
        use crate::config::tests::sample_context;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_path_buf();
        let ctx = sample_context();
        assert_eq!(ctx.renderer, RendererKind::World(WorldConversion::InProcess));
        write_f32(&out.join("u.f0"), &[120.0, 120.0, 0.0, 0.0]).unwrap();
        write_f32(&out.join("u.sp"), &vec![1e-4; 4 * 1025]).unwrap();
        write_f32(&out.join("u.ap"), &vec![0.5; 4 * 1025]).unwrap();

        WorldUnit::new(Arc::new(ctx), out.clone()).process("u").unwrap();

        let wav = std::fs::read(out.join("u.wav")).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert!(wav.len() > 44);
        for ext in ["f0", "sp", "ap", "df0"] {
            assert!(!out.join(format!("u.{ext}")).exists(), "{ext} left behind");
        }
    }

    #[cfg(unix)]
    #[test]
    fn external_variant_converts_with_x2x() {
        use crate::config::tests::sample_context;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_path_buf();
        let stub = |name: &str, body: &str| {
            let tool = dir.path().join(name);
            std::fs::write(&tool, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
            tool.display().to_string()
        };

        let mut ctx = sample_context();
        ctx.renderer = RendererKind::World(WorldConversion::X2x);
        ctx.tools.x2x = stub("x2x", "cat");
        // records its arguments as the "waveform"
        ctx.tools.world_synthesis = stub("world_synthesis", "for last; do :; done\necho \"$@\" > \"$last\"");
        write_f32(&out.join("u.f0"), &[100.0, 0.0]).unwrap();
        write_f32(&out.join("u.sp"), &[1.0; 6]).unwrap();
        write_f32(&out.join("u.ap"), &[0.5; 6]).unwrap();

        WorldUnit::new(Arc::new(ctx), out.clone()).process("u").unwrap();

        let args = std::fs::read_to_string(out.join("u.wav")).unwrap();
        assert!(args.starts_with("-s 48000 -f 5 "));
        assert!(args.contains("u.df0"));
        for ext in ["f0", "sp", "ap", "df0", "dsp", "dap"] {
            assert!(!out.join(format!("u.{ext}")).exists(), "{ext} left behind");
        }
    }
}
