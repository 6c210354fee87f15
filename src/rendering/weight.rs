//! Tongue-model weights to EMA: weights JSON, the external articulatory model,
//! then binary EMA. The three steps depend on each other and run as one unit.

use crate::command::ToolCommand;
use crate::config::{Context, StreamDescriptor, StreamKind};
use crate::error::PipelineError;
use crate::rendering::ema::{EmaDocument, FRAME_PERIOD};
use crate::stage::{Stage, StageRunner};
use crate::stream_io::{read_frames, utterance_file, write_frames};
use crate::worker_pool::{Ledger, WorkUnit};
use anyhow::{Context as _, Result};
use ndarray::Array2;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightRecord {
    pub phoneme_weights: Vec<f32>,
    pub speaker_weights: Vec<f32>,
    pub time_stamp: f64,
}

pub fn weight_records(frames: &Array2<f32>, speaker_weights: &[f32]) -> Vec<WeightRecord> {
    frames
        .rows()
        .into_iter()
        .enumerate()
        .map(|(f, row)| WeightRecord {
            phoneme_weights: row.to_vec(),
            speaker_weights: speaker_weights.to_vec(),
            time_stamp: f as f64 * FRAME_PERIOD,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WeightRenderer;

impl WeightRenderer {
    pub fn render(&self, runner: &StageRunner<'_>, bases: &[String], ledger: &mut Ledger) -> Result<()> {
        info!("Generate EMA from the weights");
        runner.run(Stage::WeightRendering, bases, ledger)
    }
}

struct WeightModel {
    dim: usize,
    speaker_weights: Vec<f32>,
    tongue_model: String,
    reference: String,
    source_ids: Vec<i64>,
    channels: Vec<String>,
}

impl WeightModel {
    fn from_stream(stream: &StreamDescriptor) -> Result<Self> {
        let p = &stream.parameters;
        let missing = |name: &str| PipelineError::Config(format!("weight stream parameter `{name}` missing"));
        Ok(Self {
            dim: stream.static_dim(),
            speaker_weights: p.speaker_weights.clone().ok_or_else(|| missing("speakerWeights"))?,
            tongue_model: p
                .tongue_model
                .as_ref()
                .ok_or_else(|| missing("tongue_model"))?
                .replace(".json", ".yaml"),
            reference: p.reference.clone().ok_or_else(|| missing("ref"))?,
            source_ids: p.source_ids.clone().ok_or_else(|| missing("sourceIds"))?,
            channels: p.channel_labels.clone().ok_or_else(|| missing("channel_labels"))?,
        })
    }
}

pub struct WeightUnit {
    ctx: Arc<Context>,
    out_dir: PathBuf,
    model: WeightModel,
}

impl WeightUnit {
    pub fn new(ctx: Arc<Context>, out_dir: PathBuf) -> Result<Self> {
        let stream = ctx
            .stream(StreamKind::Weight)
            .ok_or_else(|| PipelineError::Config("the WEIGHT renderer needs a `weight` stream".into()))?;
        let model = WeightModel::from_stream(stream)?;
        Ok(Self { ctx, out_dir, model })
    }

    fn file(&self, name: &str, ext: &str) -> PathBuf {
        utterance_file(&self.out_dir, name, ext)
    }

    fn weights_to_ema(&self, input: &Path, output: &Path) -> ToolCommand {
        ToolCommand::new(&self.ctx.tools.weights_to_ema_json)
            .arg("--input")
            .arg(input)
            .args(["--model", &self.model.tongue_model])
            .arg("--output")
            .arg(output)
            .args(["--reference", &self.model.reference, "--unit", "cm"])
            .arg("--sourceIds")
            .args(self.model.source_ids.iter().map(|i| i.to_string()))
            .arg("--channels")
            .args(&self.model.channels)
    }
}

impl WorkUnit for WeightUnit {
    fn stage(&self) -> Stage {
        Stage::WeightRendering
    }

    fn process(&self, base: &str) -> Result<()> {
        let frames = read_frames(&self.file(base, StreamKind::Weight.extension()), self.model.dim)?;
        let weight_json = self.file(&format!("{base}_weight"), "json");
        let file = File::create(&weight_json)
            .with_context(|| format!("cannot create {}", weight_json.display()))?;
        serde_json::to_writer_pretty(
            BufWriter::new(file),
            &weight_records(&frames, &self.model.speaker_weights),
        )?;

        let ema_json = self.file(&format!("{base}_ema"), "json");
        self.weights_to_ema(&weight_json, &ema_json).run_checked()?;

        let ema = EmaDocument::read(&ema_json)?.to_frames(&self.model.channels, &ema_json)?;
        write_frames(&self.file(base, StreamKind::Ema.extension()), &ema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{context_from, sample_document};
    use crate::config::RunOptions;
    use ndarray::array;

    fn weight_context(scratch: &Path) -> Context {
        let mut doc = sample_document();
        doc["models"]["cmp"]["streams"] = serde_json::json!([{
            "kind": "weight", "order": 1,
            "parameters": {
                "speakerWeights": [0.25, 0.75],
                "tongue_model": "models/tongue.json",
                "ref": "jaw",
                "sourceIds": [3, 4],
                "channel_labels": ["T1", "T2"]
            }
        }]);
        let mut options = RunOptions::new("c.json", scratch);
        options.renderer = Some("weight".into());
        context_from(doc, options).unwrap()
    }

    #[test]
    fn records_carry_speaker_weights_and_time() {
        let records = weight_records(&array![[0.1, 0.9], [0.4, 0.6]], &[1.0]);
        assert_eq!(records[1].phoneme_weights, vec![0.4, 0.6]);
        assert_eq!(records[1].time_stamp, 0.005);
        let value = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "phonemeWeights": [0.1f32, 0.9f32],
                "speakerWeights": [1.0],
                "timeStamp": 0.0
            })
        );
    }

    #[test]
    fn articulatory_model_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let unit = WeightUnit::new(Arc::new(weight_context(dir.path())), PathBuf::from("out")).unwrap();
        let line = unit
            .weights_to_ema(Path::new("out/u_weight.json"), Path::new("out/u_ema.json"))
            .display();
        assert_eq!(
            line,
            "weights-to-ema-json --input out/u_weight.json --model models/tongue.yaml \
             --output out/u_ema.json --reference jaw --unit cm --sourceIds 3 4 --channels T1 T2"
        );
    }

    #[cfg(unix)]
    #[test]
    fn weights_end_up_as_binary_ema() {
        use crate::stream_io::{read_f32, write_f32};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("fixture.json");
        std::fs::write(
            &fixture,
            r#"{"channels": {"T1": {"position": [1, 2, 3]}, "T2": {"position": [4, 5, 6]}, "ignore": {}},
                "timestamps": [0.0]}"#,
        )
        .unwrap();
        // stand-in for weights-to-ema-json: copies the fixture to --output
        let tool = dir.path().join("weights-to-ema-json");
        std::fs::write(
            &tool,
            format!(
                "#!/bin/sh\nwhile [ \"$1\" != --output ]; do shift; done\ncp {} \"$2\"\n",
                fixture.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut ctx = weight_context(dir.path());
        ctx.tools.weights_to_ema_json = tool.display().to_string();
        write_f32(&dir.path().join("u.weight"), &[0.1, 0.9]).unwrap();

        WeightUnit::new(Arc::new(ctx), dir.path().to_path_buf())
            .unwrap()
            .process("u")
            .unwrap();

        assert!(dir.path().join("u_weight.json").is_file());
        assert_eq!(
            read_f32(&dir.path().join("u.ema")).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }
}
