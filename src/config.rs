//! Run configuration.
//!
//! The JSON document is parsed once into [`ConfigDocument`], validated, and
//! frozen into a [`Context`] which every stage receives by reference. Nothing
//! in here is mutated once the pipeline starts.

use crate::error::PipelineError;
use crate::overlay::ImposedOverrides;
use crate::worker_pool::WorkerMode;
use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const FREQ_WARPING: &[(u32, f64)] = &[
    (8000, 0.31),
    (10000, 0.35),
    (12000, 0.37),
    (16000, 0.42),
    (22050, 0.45),
    (32000, 0.45),
    (44100, 0.53),
    (48000, 0.55),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Mgc,
    Lf0,
    Bap,
    Vuv,
    Ema,
    Weight,
}

impl StreamKind {
    pub fn extension(&self) -> &'static str {
        match self {
            StreamKind::Mgc => "mgc",
            StreamKind::Lf0 => "lf0",
            StreamKind::Bap => "bap",
            StreamKind::Vuv => "vuv",
            StreamKind::Ema => "ema",
            StreamKind::Weight => "weight",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub order: usize,
    #[serde(default)]
    pub winfiles: Vec<String>,
    #[serde(default)]
    pub is_msd: bool,
    #[serde(default)]
    pub vflr: f64,
    #[serde(default)]
    pub parameters: StreamParameters,
}

impl StreamDescriptor {
    pub fn static_dim(&self) -> usize {
        self.order + 1
    }

    /// Width of one frame of this stream once the dynamic features are stacked.
    pub fn dim(&self) -> usize {
        self.static_dim() * self.winfiles.len().max(1)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamParameters {
    pub gamma: Option<f64>,
    pub channel_labels: Option<Vec<String>>,
    #[serde(default)]
    pub debug_mesh: bool,
    #[serde(default)]
    pub keep_bap: bool,
    #[serde(rename = "speakerWeights")]
    pub speaker_weights: Option<Vec<f32>>,
    pub tongue_model: Option<String>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    #[serde(rename = "sourceIds")]
    pub source_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigDocument {
    pub models: Models,
    pub settings: Settings,
    pub signal: Signal,
    #[serde(default)]
    pub gv: GvSwitches,
    #[serde(default)]
    pub path: ToolPaths,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Models {
    pub global: GlobalModel,
    pub cmp: StreamSet,
    pub dur: DurationModel,
    pub ffo: Option<StreamSet>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalModel {
    pub nb_emitting_states: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSet {
    pub streams: Vec<StreamDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DurationModel {
    pub vflr: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub training: Training,
    pub synthesis: SynthesisSettings,
    #[serde(default)]
    pub dnn: DnnSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Training {
    pub beam: Scalar,
    pub maxdev: Scalar,
    pub mindur: Scalar,
}

impl Training {
    /// HMGenS takes the beam as up to three separate numbers.
    pub fn beam_args(&self) -> Vec<String> {
        self.beam
            .to_string()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisSettings {
    pub generator: Option<String>,
    pub renderer: Option<String>,
    pub kind: Option<String>,
    #[serde(default = "default_tree_ext")]
    pub tree_ext: String,
    #[serde(default = "default_maxemiter")]
    pub maxemiter: u32,
    #[serde(default)]
    pub gv: GvSettings,
}

fn default_tree_ext() -> String {
    "inf".into()
}

fn default_maxemiter() -> u32 {
    20
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GvSettings {
    pub emepsilon: f64,
    pub maxgviter: u32,
    pub gvepsilon: f64,
    pub mineucnorm: f64,
    pub stepinit: f64,
    pub stepinc: f64,
    pub stepdec: f64,
    pub hmmweight: f64,
    pub gvweight: f64,
    pub optkind: String,
}

impl Default for GvSettings {
    fn default() -> Self {
        Self {
            emepsilon: 0.0001,
            maxgviter: 50,
            gvepsilon: 0.0001,
            mineucnorm: 0.01,
            stepinit: 1.0,
            stepinc: 1.2,
            stepdec: 0.5,
            hmmweight: 1.0,
            gvweight: 1.0,
            optkind: "NEWTON".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GvSwitches {
    pub silences: Option<Vec<String>>,
    #[serde(rename = "use", default)]
    pub enabled: bool,
    #[serde(default)]
    pub cdgv: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnnSettings {
    pub model: Option<String>,
    pub input_name: String,
    pub output_name: String,
    pub num_input_units: usize,
    pub featurizer: Vec<String>,
}

impl Default for DnnSettings {
    fn default() -> Self {
        Self {
            model: None,
            input_name: "input".into(),
            output_name: "output".into(),
            num_input_units: 691,
            featurizer: vec!["perl".into(), "utils/makefeature.pl".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Signal {
    pub samplerate: u32,
    /// Milliseconds.
    pub frameshift: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolPaths {
    pub straight: Option<String>,
    pub matlab: Option<String>,
    pub hts: Option<String>,
    pub hhed: Option<String>,
    pub hmgens: Option<String>,
    pub mgc2sp: Option<String>,
    pub mlpg: Option<String>,
    pub x2x: Option<String>,
    pub world_synthesis: Option<String>,
    pub ema_json_to_mesh: Option<String>,
    pub weights_to_ema_json: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    None,
    Default,
    Dnn,
}

impl FromStr for GeneratorKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(GeneratorKind::None),
            "default" => Ok(GeneratorKind::Default),
            "dnn" => Ok(GeneratorKind::Dnn),
            _ => Err(PipelineError::UnknownGenerator(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldConversion {
    /// WORLD linked in, the waveform written by this crate.
    InProcess,
    /// float32 -> float64 by `x2x +fd`, then the `world_synthesis` binary.
    X2x,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    Straight,
    World(WorldConversion),
    Ema,
    Weight,
    StraightEma,
}

impl FromStr for RendererKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "straight" => Ok(RendererKind::Straight),
            "world" => Ok(RendererKind::World(WorldConversion::InProcess)),
            "world_x2x" => Ok(RendererKind::World(WorldConversion::X2x)),
            "ema" => Ok(RendererKind::Ema),
            "weight" => Ok(RendererKind::Weight),
            "straightema" | "straight_ema" => Ok(RendererKind::StraightEma),
            _ => Err(PipelineError::UnknownRenderer(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tools {
    pub hhed: String,
    pub hmgens: String,
    pub mgc2sp: String,
    pub mlpg: String,
    pub x2x: String,
    pub matlab: String,
    pub world_synthesis: String,
    pub ema_json_to_mesh: String,
    pub weights_to_ema_json: String,
    pub featurizer: Vec<String>,
}

impl Tools {
    fn resolve(paths: &ToolPaths, featurizer: Vec<String>) -> Self {
        let hts = |name: &str, explicit: &Option<String>| {
            explicit.clone().unwrap_or_else(|| match &paths.hts {
                Some(dir) => format!("{dir}/{name}"),
                None => name.to_string(),
            })
        };
        let plain = |name: &str, explicit: &Option<String>| {
            explicit.clone().unwrap_or_else(|| name.to_string())
        };

        Self {
            hhed: hts("HHEd", &paths.hhed),
            hmgens: hts("HMGenS", &paths.hmgens),
            mgc2sp: plain("mgc2sp", &paths.mgc2sp),
            mlpg: plain("mlpg", &paths.mlpg),
            x2x: plain("x2x", &paths.x2x),
            matlab: plain("matlab", &paths.matlab),
            world_synthesis: plain("world_synthesis", &paths.world_synthesis),
            ema_json_to_mesh: plain("ema-json-to-mesh", &paths.ema_json_to_mesh),
            weights_to_ema_json: plain("weights-to-ema-json", &paths.weights_to_ema_json),
            featurizer,
        }
    }
}

/// Trained voice files, all relative to the directory holding the configuration.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub cmp_model: PathBuf,
    pub dur_model: PathBuf,
    pub full_list: PathBuf,
    pub cmp_tree: PathBuf,
    pub dur_tree: PathBuf,
    pub gv_dir: PathBuf,
    pub win_dir: PathBuf,
    pub dnn_model: PathBuf,
    pub dnn_var_dir: PathBuf,
    pub dnn_qconf: PathBuf,
}

impl ModelFiles {
    fn new(project: &Path, dnn: &DnnSettings) -> Self {
        Self {
            cmp_model: project.join("models/re_clustered_cmp.mmf"),
            dur_model: project.join("models/re_clustered_dur.mmf"),
            full_list: project.join("full.list"),
            cmp_tree: project.join("trees"),
            dur_tree: project.join("trees"),
            gv_dir: project.join("gv"),
            win_dir: project.join("win"),
            dnn_model: dnn
                .model
                .as_ref()
                .map(|m| project.join(m))
                .unwrap_or_else(|| project.join("DNN/models/model.onnx")),
            dnn_var_dir: project.join("DNN/var"),
            dnn_qconf: project.join("DNN/qconf.conf"),
        }
    }
}

/// Per-run scratch directory holding generated configs, scripts and composed models.
#[derive(Debug, Clone)]
pub struct Scratch {
    pub root: PathBuf,
}

impl Scratch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn train_config(&self) -> PathBuf {
        self.root.join("train.cfg")
    }

    pub fn synth_config(&self) -> PathBuf {
        self.root.join("synth.cfg")
    }

    pub fn label_list(&self) -> PathBuf {
        self.root.join("list_all")
    }

    pub fn utterance_list(&self, bucket: usize) -> PathBuf {
        self.root.join(format!("list_input_labels_{bucket}"))
    }

    pub fn tied_list(&self, target: &str) -> PathBuf {
        self.root.join(format!("tiedlist_{target}"))
    }

    pub fn hed_script(&self, target: &str) -> PathBuf {
        self.root.join(format!("mku_{target}.hed"))
    }

    pub fn composed_model(&self, target: &str) -> PathBuf {
        self.root.join(format!("{target}.mmf"))
    }

    pub fn straight_script(&self) -> PathBuf {
        self.root.join("straight.m")
    }

    pub fn win_dir(&self) -> PathBuf {
        self.root.join("win")
    }
}

/// Everything the command line contributes to a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub nb_proc: usize,
    pub preserve: bool,
    pub imposed_duration: bool,
    pub pg_type: u32,
    pub worker_mode: WorkerMode,
    pub generator: Option<String>,
    pub renderer: Option<String>,
    pub straight_path: Option<String>,
    pub overrides: ImposedOverrides,
}

impl RunOptions {
    pub fn new(config_path: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            scratch_dir: scratch_dir.into(),
            nb_proc: 1,
            preserve: false,
            imposed_duration: false,
            pg_type: 0,
            worker_mode: WorkerMode::Thread,
            generator: None,
            renderer: None,
            straight_path: None,
            overrides: ImposedOverrides::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Context {
    pub project_path: PathBuf,
    pub generator: GeneratorKind,
    pub renderer: RendererKind,
    pub streams: Vec<StreamDescriptor>,
    pub dnn_streams: Vec<StreamDescriptor>,
    pub nb_emitting_states: usize,
    pub signal: Signal,
    pub freq_warping: f64,
    pub training: Training,
    pub synthesis: SynthesisSettings,
    pub dur_vflr: f64,
    pub gv_switches: GvSwitches,
    pub use_gv: bool,
    pub dnn: DnnSettings,
    pub straight_path: Option<String>,
    pub tools: Tools,
    pub models: ModelFiles,
    pub scratch: Scratch,
    pub options: RunOptions,
}

impl Context {
    pub fn load(options: RunOptions) -> Result<Self> {
        // checked before touching the filesystem
        options.overrides.validate()?;

        let text = std::fs::read_to_string(&options.config_path)
            .with_context(|| format!("cannot read {}", options.config_path.display()))?;
        let document: ConfigDocument = serde_json::from_str(&text)
            .with_context(|| format!("cannot parse {}", options.config_path.display()))?;
        let project_path = options
            .config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self::from_document(document, project_path, options)
    }

    pub fn from_document(
        document: ConfigDocument,
        project_path: PathBuf,
        options: RunOptions,
    ) -> Result<Self> {
        options.overrides.validate()?;

        let synthesis = &document.settings.synthesis;
        let generator = match (&options.generator, &synthesis.generator) {
            (Some(name), _) | (None, Some(name)) => name.parse::<GeneratorKind>()?,
            // older configurations only name the renderer, as `kind`
            (None, None) => GeneratorKind::Default,
        };
        let renderer_name = options
            .renderer
            .as_ref()
            .or(synthesis.renderer.as_ref())
            .or(synthesis.kind.as_ref())
            .ok_or_else(|| PipelineError::Config("a renderer needs to be defined".into()))?;
        let renderer = renderer_name.parse::<RendererKind>()?;

        let freq_warping = FREQ_WARPING
            .iter()
            .find(|(rate, _)| *rate == document.signal.samplerate)
            .map(|(_, alpha)| *alpha)
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "no frequency warping known for sample rate {}",
                    document.signal.samplerate
                ))
            })?;

        let dnn_streams = document
            .models
            .ffo
            .as_ref()
            .map(|ffo| ffo.streams.clone())
            .unwrap_or_default();
        if generator == GeneratorKind::Dnn {
            if dnn_streams.is_empty() {
                return Err(
                    PipelineError::Config("DNN generation needs `models.ffo.streams`".into()).into(),
                );
            }
            for stream in dnn_streams.iter().filter(|s| s.kind != StreamKind::Vuv) {
                if stream.winfiles.len() < 3 {
                    return Err(PipelineError::MissingWindows {
                        kind: stream.kind.to_string(),
                        count: stream.winfiles.len(),
                    }
                    .into());
                }
            }
        }

        let straight_path = options
            .straight_path
            .clone()
            .or_else(|| document.path.straight.clone());
        if matches!(renderer, RendererKind::Straight | RendererKind::StraightEma)
            && straight_path.is_none()
        {
            return Err(PipelineError::Config(
                "the STRAIGHT renderer needs `path.straight` (or --straight-path)".into(),
            )
            .into());
        }
        if renderer == RendererKind::Weight {
            validate_weight_stream(&document.models.cmp.streams)?;
        }

        let models = ModelFiles::new(&project_path, &document.settings.dnn);
        let use_gv = document.gv.enabled && models.gv_dir.is_dir();
        let tools = Tools::resolve(&document.path, document.settings.dnn.featurizer.clone());

        Ok(Self {
            generator,
            renderer,
            streams: document.models.cmp.streams,
            dnn_streams,
            nb_emitting_states: document.models.global.nb_emitting_states,
            freq_warping,
            training: document.settings.training,
            synthesis: document.settings.synthesis,
            dur_vflr: document.models.dur.vflr,
            gv_switches: document.gv,
            use_gv,
            dnn: document.settings.dnn,
            signal: document.signal,
            straight_path,
            tools,
            models,
            scratch: Scratch::new(options.scratch_dir.clone()),
            project_path,
            options,
        })
    }

    /// Frame shift in HTK units (100 ns).
    pub fn frameshift_ticks(&self) -> u64 {
        (self.signal.frameshift * 10_000.0).round() as u64
    }

    pub fn stream(&self, kind: StreamKind) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.kind == kind)
    }
}

fn validate_weight_stream(streams: &[StreamDescriptor]) -> Result<()> {
    let stream = streams
        .iter()
        .find(|s| s.kind == StreamKind::Weight)
        .ok_or_else(|| PipelineError::Config("the WEIGHT renderer needs a `weight` stream".into()))?;
    let p = &stream.parameters;
    let missing = [
        ("speakerWeights", p.speaker_weights.is_none()),
        ("tongue_model", p.tongue_model.is_none()),
        ("ref", p.reference.is_none()),
        ("sourceIds", p.source_ids.is_none()),
        ("channel_labels", p.channel_labels.is_none()),
    ]
    .into_iter()
    .filter_map(|(name, absent)| absent.then_some(name))
    .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(PipelineError::Config(format!(
            "weight stream parameters missing: {}",
            missing.join(", ")
        ))
        .into());
    }
    Ok(())
}
