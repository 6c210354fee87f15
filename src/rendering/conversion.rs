//! Generated streams to vocoder parameters: `lf0` -> `f0`, `mgc` -> `sp`,
//! `bap` -> `ap`.

use crate::command::ToolCommand;
use crate::config::{Context, StreamDescriptor, StreamKind};
use crate::overlay::UNVOICED;
use crate::stage::Stage;
use crate::stream_io::{read_f32, remove_if_exists, utterance_file, write_f32};
use crate::worker_pool::WorkUnit;
use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

const FFT_LENGTH: u32 = 2048;
const AMPLITUDE_SCALE: f32 = 32768.0;

pub struct ConversionUnit {
    ctx: Arc<Context>,
    out_dir: PathBuf,
}

impl ConversionUnit {
    pub fn new(ctx: Arc<Context>, out_dir: PathBuf) -> Self {
        Self { ctx, out_dir }
    }

    fn file(&self, base: &str, ext: &str) -> PathBuf {
        utterance_file(&self.out_dir, base, ext)
    }

    fn spectrum(&self, stream: &StreamDescriptor, gamma: f64, input: &Path, output: &Path) -> Result<()> {
        let outcome = ToolCommand::new(&self.ctx.tools.mgc2sp)
            .arg("-a")
            .arg(format!("{:.6}", self.ctx.freq_warping))
            .arg("-g")
            .arg(format!("{gamma:.6}"))
            .arg("-m")
            .arg(stream.order.to_string())
            .arg("-l")
            .arg(FFT_LENGTH.to_string())
            .args(["-o", "2"])
            .arg(input)
            .stdout_to(output)
            .run()?;
        if !outcome.success() {
            warn!("cannot convert {}, keeping going", input.display());
            return Ok(());
        }
        write_f32(output, &power_spectrum(read_f32(output)?))
    }
}

impl WorkUnit for ConversionUnit {
    fn stage(&self) -> Stage {
        Stage::ParameterConversion
    }

    fn process(&self, base: &str) -> Result<()> {
        let mut converted = Vec::new();
        for stream in &self.ctx.streams {
            let input = self.file(base, stream.kind.extension());
            match stream.kind {
                StreamKind::Lf0 => {
                    write_f32(&self.file(base, "f0"), &lf0_to_f0(read_f32(&input)?))?;
                }
                StreamKind::Bap if stream.parameters.keep_bap => {
                    std::fs::copy(&input, self.file(base, "ap"))
                        .with_context(|| format!("cannot copy {}", input.display()))?;
                }
                StreamKind::Bap => self.spectrum(stream, 0.0, &input, &self.file(base, "ap"))?,
                StreamKind::Mgc => {
                    let gamma = stream.parameters.gamma.unwrap_or(0.0);
                    self.spectrum(stream, gamma, &input, &self.file(base, "sp"))?
                }
                _ => continue,
            }
            converted.push(input);
        }

        if !self.ctx.options.preserve {
            for path in converted {
                remove_if_exists(&path)?;
            }
            remove_if_exists(&self.file(base, "dur"))?;
        }
        Ok(())
    }
}

pub fn lf0_to_f0(lf0: Vec<f32>) -> Vec<f32> {
    lf0.into_iter()
        .map(|v| if v == UNVOICED { 0.0 } else { v.exp() })
        .collect()
}

/// `mgc2sp -o 2` amplitudes back to a power spectrum.
pub fn power_spectrum(amplitudes: Vec<f32>) -> Vec<f32> {
    amplitudes
        .into_iter()
        .map(|v| (v / AMPLITUDE_SCALE).powi(2))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unvoiced_frames_have_zero_f0() {
        let f0 = lf0_to_f0(vec![UNVOICED, 0.0, 100f32.ln()]);
        assert_eq!(f0[0], 0.0);
        assert_eq!(f0[1], 1.0);
        assert!((f0[2] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn amplitudes_are_scaled_then_squared() {
        assert_eq!(power_spectrum(vec![32768.0, 16384.0, -32768.0]), vec![1.0, 0.25, 1.0]);
    }

    #[cfg(unix)]
    #[test]
    fn converts_and_cleans_up() {
        use crate::config::tests::{context_from, sample_document};
        use crate::config::RunOptions;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        // stand-in for mgc2sp: prints its last argument
        let mgc2sp = dir.path().join("mgc2sp");
        std::fs::write(&mgc2sp, "#!/bin/sh\nfor last; do :; done\ncat \"$last\"\n").unwrap();
        std::fs::set_permissions(&mgc2sp, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut doc = sample_document();
        doc["path"] = serde_json::json!({ "mgc2sp": mgc2sp.display().to_string() });
        doc["models"]["cmp"]["streams"][2]["parameters"] = serde_json::json!({ "keep_bap": true });
        let ctx = context_from(doc, RunOptions::new("c.json", dir.path().join("tmp"))).unwrap();

        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        write_f32(&out.join("u.lf0"), &[UNVOICED, 0.0]).unwrap();
        write_f32(&out.join("u.mgc"), &[32768.0, 16384.0]).unwrap();
        write_f32(&out.join("u.bap"), &[0.5]).unwrap();
        std::fs::write(out.join("u.dur"), "").unwrap();

        ConversionUnit::new(Arc::new(ctx), out.clone()).process("u").unwrap();

        assert_eq!(read_f32(&out.join("u.f0")).unwrap(), vec![0.0, 1.0]);
        assert_eq!(read_f32(&out.join("u.sp")).unwrap(), vec![1.0, 0.25]);
        assert_eq!(read_f32(&out.join("u.ap")).unwrap(), vec![0.5]);
        for ext in ["lf0", "mgc", "bap", "dur"] {
            assert!(!out.join(format!("u.{ext}")).exists(), "{ext} left behind");
        }
    }
}
