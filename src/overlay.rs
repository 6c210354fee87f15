//! Externally supplied parameters replacing the generated ones before rendering.

use crate::config::StreamKind;
use crate::error::PipelineError;
use crate::stream_io::{read_f32, utterance_file, write_f32};
use crate::worker_pool::Ledger;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Log-F0 value marking an unvoiced frame.
pub const UNVOICED: f32 = -1e10;

#[derive(Debug, Clone, Default)]
pub struct ImposedOverrides {
    pub f0: Option<PathBuf>,
    pub interpolated_f0: Option<PathBuf>,
    pub mgc: Option<PathBuf>,
    pub bap: Option<PathBuf>,
}

impl ImposedOverrides {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.f0.is_some() && self.interpolated_f0.is_some() {
            return Err(PipelineError::ConflictingF0Imposition);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.f0.is_none() && self.interpolated_f0.is_none() && self.mgc.is_none() && self.bap.is_none()
    }

    /// Applies every configured override to the generated files in `out_dir`.
    /// An utterance whose override cannot be applied is dropped from the run.
    pub fn apply(&self, out_dir: &Path, bases: &[String], ledger: &mut Ledger) -> Result<()> {
        self.validate()?;

        if let Some(dir) = &self.f0 {
            info!("replace f0 using imposed one");
            for_each(bases, ledger, |base| copy_imposed(dir, out_dir, base, StreamKind::Lf0));
        }
        if let Some(dir) = &self.interpolated_f0 {
            info!("replace f0 using interpolated one");
            for_each(bases, ledger, |base| {
                let mask_path = utterance_file(out_dir, base, StreamKind::Lf0.extension());
                let mask = read_f32(&mask_path)?;
                let values = read_f32(&utterance_file(dir, base, StreamKind::Lf0.extension()))?;
                write_f32(&mask_path, &apply_voicing_mask(&mask, values))
            });
        }
        if let Some(dir) = &self.mgc {
            info!("replace mgc using imposed one");
            for_each(bases, ledger, |base| copy_imposed(dir, out_dir, base, StreamKind::Mgc));
        }
        if let Some(dir) = &self.bap {
            info!("replace bap using imposed one");
            for_each(bases, ledger, |base| copy_imposed(dir, out_dir, base, StreamKind::Bap));
        }
        Ok(())
    }
}

fn for_each(bases: &[String], ledger: &mut Ledger, mut f: impl FnMut(&str) -> Result<()>) {
    for base in ledger.active(bases) {
        if let Err(e) = f(&base) {
            ledger.record("overlay", &base, format!("{e:#}"));
        }
    }
}

fn copy_imposed(from: &Path, out_dir: &Path, base: &str, kind: StreamKind) -> Result<()> {
    let source = utterance_file(from, base, kind.extension());
    let target = utterance_file(out_dir, base, kind.extension());
    info!("copy {} to {}", source.display(), target.display());
    std::fs::copy(&source, &target)
        .with_context(|| format!("cannot copy {} to {}", source.display(), target.display()))?;
    Ok(())
}

/// Keeps the external values but borrows the voicing decision of `mask`:
/// wherever the mask is unvoiced, so is the result.
pub fn apply_voicing_mask(mask: &[f32], mut values: Vec<f32>) -> Vec<f32> {
    for (value, m) in values.iter_mut().zip(mask) {
        if *m == UNVOICED {
            *value = *m;
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voicing_mask_is_borrowed() {
        let mask = [UNVOICED, 100.0, UNVOICED, 120.0];
        let result = apply_voicing_mask(&mask, vec![90.0, 95.0, 110.0, 115.0]);
        assert_eq!(result, vec![UNVOICED, 95.0, UNVOICED, 115.0]);
        assert_eq!(apply_voicing_mask(&mask, result.clone()), result);
    }

    #[test]
    fn only_common_frames_are_masked() {
        let result = apply_voicing_mask(&[UNVOICED], vec![1.0, 2.0, 3.0]);
        assert_eq!(result, vec![UNVOICED, 2.0, 3.0]);
        let result = apply_voicing_mask(&[1.0, UNVOICED, UNVOICED], vec![5.0]);
        assert_eq!(result, vec![5.0]);
    }

    #[test]
    fn both_f0_overrides_conflict() {
        let overrides = ImposedOverrides {
            f0: Some("f0".into()),
            interpolated_f0: Some("if0".into()),
            ..Default::default()
        };
        assert!(matches!(
            overrides.validate(),
            Err(PipelineError::ConflictingF0Imposition)
        ));
    }

    #[test]
    fn applies_files_and_drops_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let f0 = dir.path().join("if0");
        let mgc = dir.path().join("mgc");
        for d in [&out, &f0, &mgc] {
            std::fs::create_dir_all(d).unwrap();
        }
        write_f32(&out.join("a.lf0"), &[UNVOICED, 100.0, UNVOICED, 120.0]).unwrap();
        write_f32(&f0.join("a.lf0"), &[90.0, 95.0, 110.0, 115.0]).unwrap();
        std::fs::write(out.join("a.mgc"), b"generated").unwrap();
        std::fs::write(mgc.join("a.mgc"), b"imposed").unwrap();
        write_f32(&out.join("b.lf0"), &[1.0]).unwrap();

        let overrides = ImposedOverrides {
            interpolated_f0: Some(f0),
            mgc: Some(mgc),
            ..Default::default()
        };
        let mut ledger = Ledger::new();
        let bases = vec!["a".to_string(), "b".to_string()];
        overrides.apply(&out, &bases, &mut ledger).unwrap();

        assert_eq!(read_f32(&out.join("a.lf0")).unwrap(), vec![UNVOICED, 95.0, UNVOICED, 115.0]);
        assert_eq!(std::fs::read(out.join("a.mgc")).unwrap(), b"imposed");
        assert!(ledger.is_failed("b"));
        assert_eq!(ledger.active(&bases), vec!["a"]);
    }

    #[test]
    fn utterances_already_dropped_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let bap = dir.path().join("bap");
        for d in [&out, &bap] {
            std::fs::create_dir_all(d).unwrap();
        }
        std::fs::write(bap.join("a.bap"), b"imposed").unwrap();
        std::fs::write(bap.join("b.bap"), b"imposed").unwrap();

        let overrides = ImposedOverrides {
            bap: Some(bap),
            ..Default::default()
        };
        let mut ledger = Ledger::new();
        ledger.record("generation", "a", "no duration file");
        let bases = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        overrides.apply(&out, &bases, &mut ledger).unwrap();

        assert!(!out.join("a.bap").exists());
        assert_eq!(std::fs::read(out.join("b.bap")).unwrap(), b"imposed");
        assert!(ledger.failures()["a"].starts_with("generation"));
        assert!(ledger.failures()["c"].starts_with("overlay"));
        assert_eq!(ledger.active(&bases), vec!["b"]);
    }
}
