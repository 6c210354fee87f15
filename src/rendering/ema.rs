//! Articulatory (EMA) output: binary coil positions to JSON, and back.

use crate::command::ToolCommand;
use crate::config::{Context, StreamKind};
use crate::error::PipelineError;
use crate::stage::{Stage, StageRunner};
use crate::stream_io::{read_frames, utterance_file};
use crate::worker_pool::{Ledger, WorkUnit};
use anyhow::{Context as _, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_CHANNELS: [&str; 7] = ["T3", "T2", "T1", "ref", "jaw", "upperlip", "lowerlip"];
/// Seconds between two EMA frames.
pub const FRAME_PERIOD: f64 = 0.005;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelTrack {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub position: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaDocument {
    pub channels: BTreeMap<String, ChannelTrack>,
    pub timestamps: Vec<f64>,
}

impl EmaDocument {
    /// `frames` holds x, y, z for every channel, in channel order.
    pub fn from_frames(frames: &Array2<f32>, channels: &[String]) -> Self {
        let mut tracks = BTreeMap::new();
        for (c, name) in channels.iter().enumerate() {
            let position = frames
                .rows()
                .into_iter()
                .flat_map(|row| (0..3).map(move |d| row[c * 3 + d]))
                .collect();
            tracks.insert(name.clone(), ChannelTrack { position });
        }
        tracks.insert("ignore".to_string(), ChannelTrack::default());

        Self {
            channels: tracks,
            timestamps: (0..frames.nrows()).map(|f| f as f64 * FRAME_PERIOD).collect(),
        }
    }

    /// Inverse of [`Self::from_frames`]. Every requested track must hold
    /// whole x, y, z triples, and all of them the same number of frames.
    /// `source` only names the document in errors.
    pub fn to_frames(&self, channels: &[String], source: &Path) -> Result<Array2<f32>> {
        let malformed = |reason: String| PipelineError::MalformedStream {
            path: source.to_path_buf(),
            reason,
        };
        let tracks = channels
            .iter()
            .map(|c| {
                self.channels.get(c).ok_or_else(|| {
                    PipelineError::Config(format!("channel `{c}` missing from the EMA document"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut nb_frames = None;
        for (name, track) in channels.iter().zip(&tracks) {
            let len = track.position.len();
            if len % 3 != 0 {
                let reason = format!("channel `{name}` holds {len} values, not x, y, z triples");
                return Err(malformed(reason).into());
            }
            match nb_frames {
                None => nb_frames = Some(len / 3),
                Some(n) if n != len / 3 => {
                    return Err(malformed(format!(
                        "channel `{name}` has {} frames where `{}` has {n}",
                        len / 3,
                        channels[0]
                    ))
                    .into());
                }
                Some(_) => {}
            }
        }
        let nb_frames = nb_frames.unwrap_or(0);

        let mut frames = Array2::zeros((nb_frames, channels.len() * 3));
        for (j, track) in tracks.iter().enumerate() {
            for (i, xyz) in track.position.chunks_exact(3).enumerate() {
                for (d, value) in xyz.iter().enumerate() {
                    frames[[i, j * 3 + d]] = *value;
                }
            }
        }
        Ok(frames)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("cannot parse {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

/// Channel labels of a stream, falling back to the standard coil set.
pub fn channel_labels(ctx: &Context, kind: StreamKind) -> Vec<String> {
    ctx.stream(kind)
        .and_then(|s| s.parameters.channel_labels.clone())
        .unwrap_or_else(|| DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmaRenderer;

impl EmaRenderer {
    pub fn render(&self, runner: &StageRunner<'_>, bases: &[String], ledger: &mut Ledger) -> Result<()> {
        info!("EMA binary to JSON");
        runner.run(Stage::EmaRendering, bases, ledger)
    }
}

pub struct EmaUnit {
    ctx: Arc<Context>,
    out_dir: PathBuf,
    channels: Vec<String>,
}

impl EmaUnit {
    pub fn new(ctx: Arc<Context>, out_dir: PathBuf) -> Self {
        let channels = channel_labels(&ctx, StreamKind::Ema);
        Self {
            ctx,
            out_dir,
            channels,
        }
    }

    fn export_meshes(&self, base: &str, json: &Path) -> Result<()> {
        for channel in &self.channels {
            let ply = utterance_file(&self.out_dir, &format!("{base}_{channel}"), "ply");
            let outcome = ToolCommand::new(&self.ctx.tools.ema_json_to_mesh)
                .arg("--input")
                .arg(json)
                .args(["--channel", channel])
                .arg("--output")
                .arg(&ply)
                .run()?;
            if !outcome.success() {
                warn!("no debug mesh for channel {} of {}", channel, base);
            }
        }
        Ok(())
    }
}

impl WorkUnit for EmaUnit {
    fn stage(&self) -> Stage {
        Stage::EmaRendering
    }

    fn process(&self, base: &str) -> Result<()> {
        let stream = self
            .ctx
            .stream(StreamKind::Ema)
            .ok_or_else(|| PipelineError::Config("the EMA renderer needs an `ema` stream".into()))?;
        let frames = read_frames(
            &utterance_file(&self.out_dir, base, StreamKind::Ema.extension()),
            self.channels.len() * 3,
        )?;
        let json = utterance_file(&self.out_dir, base, "json");
        EmaDocument::from_frames(&frames, &self.channels).write(&json)?;

        if stream.parameters.debug_mesh {
            self.export_meshes(base, &json)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn frames_become_per_channel_tracks() {
        let frames = array![[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [7.0, 8.0, 9.0, 10.0, 11.0, 12.0]];
        let doc = EmaDocument::from_frames(&frames, &names(&["T1", "jaw"]));
        assert_eq!(doc.channels["T1"].position, vec![1.0, 2.0, 3.0, 7.0, 8.0, 9.0]);
        assert_eq!(doc.channels["jaw"].position, vec![4.0, 5.0, 6.0, 10.0, 11.0, 12.0]);
        assert!(doc.channels["ignore"].position.is_empty());
        assert_eq!(doc.timestamps, vec![0.0, 0.005]);

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["channels"]["ignore"], serde_json::json!({}));
        assert_eq!(doc.to_frames(&names(&["T1", "jaw"]), Path::new("u.json")).unwrap(), frames);
    }

    #[test]
    fn missing_channel_is_reported() {
        let doc = EmaDocument::from_frames(&array![[0.0, 0.0, 0.0]], &names(&["T1"]));
        assert!(doc.to_frames(&names(&["T1", "T2"]), Path::new("u.json")).is_err());
    }

    #[test]
    fn uneven_tracks_are_malformed() {
        let mut doc = EmaDocument::from_frames(
            &array![[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [7.0, 8.0, 9.0, 10.0, 11.0, 12.0]],
            &names(&["T1", "T2"]),
        );
        doc.channels.get_mut("T2").unwrap().position.truncate(3);
        let err = doc.to_frames(&names(&["T1", "T2"]), Path::new("u.json")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MalformedStream { path, .. }) if path == Path::new("u.json")
        ));

        doc.channels.get_mut("T2").unwrap().position = vec![4.0, 5.0, 6.0, 10.0, 11.0];
        let err = doc.to_frames(&names(&["T1", "T2"]), Path::new("u.json")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MalformedStream { .. })
        ));

        doc.channels.get_mut("T2").unwrap().position = vec![4.0, 5.0, 6.0, 10.0, 11.0, 12.0];
        assert_eq!(doc.to_frames(&names(&["T1", "T2"]), Path::new("u.json")).unwrap().nrows(), 2);
    }

    #[test]
    fn default_channels_apply_without_labels() {
        let ctx = crate::config::tests::sample_context();
        assert_eq!(channel_labels(&ctx, StreamKind::Ema), names(&DEFAULT_CHANNELS));
    }

    #[test]
    fn unit_writes_json_next_to_the_stream() {
        use crate::config::tests::{context_from, sample_document};
        use crate::config::RunOptions;
        use crate::stream_io::write_f32;

        let dir = tempfile::tempdir().unwrap();
        let mut doc = sample_document();
        doc["models"]["cmp"]["streams"] = serde_json::json!([
            { "kind": "ema", "order": 5, "parameters": { "channel_labels": ["T1", "T2"] } }
        ]);
        let mut options = RunOptions::new("c.json", dir.path().join("tmp"));
        options.renderer = Some("ema".into());
        let ctx = context_from(doc, options).unwrap();

        write_f32(&dir.path().join("u.ema"), &[0.5; 18]).unwrap();
        EmaUnit::new(Arc::new(ctx), dir.path().to_path_buf()).process("u").unwrap();

        let written = EmaDocument::read(&dir.path().join("u.json")).unwrap();
        assert_eq!(written.timestamps.len(), 3);
        assert_eq!(written.channels["T2"].position.len(), 9);
    }
}
