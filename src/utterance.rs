//! Turns the synthesis input into utterance identifiers.
//!
//! The input is a directory tree of `.lab` files, where the base keeps its
//! sub-directory (`news/n001`), a single `.lab` file, or a list file naming one
//! label path per line. Outside a directory the base is the file stem.

use crate::error::PipelineError;
use crate::full_context_label::context_label;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub base: String,
    pub label: PathBuf,
}

impl Utterance {
    /// Directory part of the base, relative to the output directory.
    pub fn bucket(&self) -> PathBuf {
        Path::new(&self.base)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct UtteranceSet {
    pub utterances: Vec<Utterance>,
}

impl UtteranceSet {
    pub fn resolve(input: &Path) -> Result<Self> {
        if input.is_dir() {
            Self::from_directory(input)
        } else if input.extension().is_some_and(|e| e == "lab") {
            Self::from_label(input)
        } else {
            Self::from_list(input)
        }
    }

    /// A single label file is one utterance named after its stem.
    pub fn from_label(label: &Path) -> Result<Self> {
        if !label.is_file() {
            return Err(PipelineError::MissingLabelFile(label.to_path_buf()).into());
        }
        let base = label
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::MissingLabelFile(label.to_path_buf()))?;
        Ok(Self {
            utterances: vec![Utterance {
                base,
                label: label.to_path_buf(),
            }],
        })
    }

    pub fn from_directory(root: &Path) -> Result<Self> {
        let mut utterances = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("cannot scan {}", root.display()))?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map_or(true, |e| e != "lab") {
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
            let base = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            info!("Add {}", path.display());
            utterances.push(Utterance {
                base,
                label: path.to_path_buf(),
            });
        }
        Ok(Self { utterances })
    }

    pub fn from_list(list: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(list)
            .with_context(|| format!("cannot read label list {}", list.display()))?;
        let mut seen = HashSet::new();
        let mut utterances = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let label = PathBuf::from(line);
            let base = label
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| PipelineError::MissingLabelFile(label.clone()))?;
            let label = label.with_extension("lab");
            if !label.is_file() {
                return Err(PipelineError::MissingLabelFile(label).into());
            }
            if !seen.insert(base.clone()) {
                warn!("{} shares the base `{}` with an earlier entry, skipped", label.display(), base);
                continue;
            }
            utterances.push(Utterance { base, label });
        }
        Ok(Self { utterances })
    }

    pub fn bases(&self) -> Vec<String> {
        self.utterances.iter().map(|u| u.base.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    /// Utterances grouped by output sub-directory.
    pub fn buckets(&self) -> BTreeMap<PathBuf, Vec<&Utterance>> {
        let mut buckets: BTreeMap<PathBuf, Vec<&Utterance>> = BTreeMap::new();
        for utterance in &self.utterances {
            buckets.entry(utterance.bucket()).or_default().push(utterance);
        }
        buckets
    }

    pub fn context_labels(&self) -> Result<BTreeSet<String>> {
        let mut labels = BTreeSet::new();
        for utterance in &self.utterances {
            let text = std::fs::read_to_string(&utterance.label)
                .map_err(|_| PipelineError::MissingLabelFile(utterance.label.clone()))?;
            labels.extend(text.lines().filter_map(context_label).map(str::to_string));
        }
        Ok(labels)
    }

    pub fn write_label_list(&self, path: &Path) -> Result<usize> {
        let labels = self.context_labels()?;
        let content = labels.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        std::fs::write(path, content)
            .with_context(|| format!("cannot write label list {}", path.display()))?;
        Ok(labels.len())
    }
}
