//! Raw parameter files: flat native-endian float32, no header. The frame count
//! is implied by the byte size.

use crate::error::PipelineError;
use anyhow::{Context, Result};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

pub const FLOAT_SIZE: u64 = 4;

pub fn read_f32(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    if bytes.len() % FLOAT_SIZE as usize != 0 {
        return Err(PipelineError::MalformedStream {
            path: path.to_path_buf(),
            reason: format!("{} bytes is not a whole number of float32 values", bytes.len()),
        }
        .into());
    }
    let mut values = vec![0f32; bytes.len() / FLOAT_SIZE as usize];
    Cursor::new(bytes).read_f32_into::<NativeEndian>(&mut values)?;
    Ok(values)
}

pub fn write_f32(path: &Path, values: &[f32]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for value in values {
        writer.write_f32::<NativeEndian>(*value)?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a file as `frames x dim`.
pub fn read_frames(path: &Path, dim: usize) -> Result<Array2<f32>> {
    let values = read_f32(path)?;
    if dim == 0 || values.len() % dim != 0 {
        return Err(PipelineError::MalformedStream {
            path: path.to_path_buf(),
            reason: format!("{} values cannot be split into frames of {}", values.len(), dim),
        }
        .into());
    }
    let frames = values.len() / dim;
    Ok(Array2::from_shape_vec((frames, dim), values)?)
}

pub fn write_frames(path: &Path, frames: &Array2<f32>) -> Result<()> {
    write_f32(path, &frames.iter().copied().collect::<Vec<_>>())
}

/// Number of float32 values in the file.
pub fn value_count(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).with_context(|| format!("cannot stat {}", path.display()))?;
    Ok(meta.len() / FLOAT_SIZE)
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("cannot remove {}", path.display())),
    }
}

/// `<dir>/<base>.<ext>`; `base` may contain `/`.
pub fn utterance_file(dir: &Path, base: &str, ext: &str) -> PathBuf {
    dir.join(format!("{base}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn frames_keep_row_major_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.mgc");
        write_f32(&path, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let frames = read_frames(&path, 3).unwrap();
        assert_eq!(frames, array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(value_count(&path).unwrap(), 6);
    }

    #[test]
    fn mismatched_dimension_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.bap");
        write_f32(&path, &[0.0; 5]).unwrap();
        let err = read_frames(&path, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MalformedStream { .. })
        ));
    }

    #[test]
    fn truncated_file_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.lf0");
        std::fs::write(&path, [0u8; 6]).unwrap();
        assert!(read_f32(&path).is_err());
    }

    #[test]
    fn nested_base_and_missing_removal() {
        let dir = Path::new("/out");
        assert_eq!(utterance_file(dir, "news/n1", "lf0"), PathBuf::from("/out/news/n1.lf0"));
        let tmp = tempfile::tempdir().unwrap();
        remove_if_exists(&tmp.path().join("absent")).unwrap();
    }
}
