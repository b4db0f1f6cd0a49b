//! Appearance model store: label map, LBPH classifier and training corpus.
//!
//! Readers take a cheap clone of the current `Arc<StoreState>`, so a
//! prediction never observes a half-applied mutation. Mutations are
//! serialized by a writer mutex, built on a private copy of the state,
//! persisted, and only then swapped in.

use crate::corpus::TrainingCorpus;
use crate::labels::LabelMap;
use crate::lbph::{LbphModel, LbphParams};
use crate::snapshot;
use crate::types::{FacePatch, Label, Prediction};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

pub const DEFAULT_CORPUS_PER_IDENTITY: usize = 10;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {artifact}: {message}")]
    Encode {
        artifact: &'static str,
        message: String,
    },

    #[error("invalid snapshot {path}: {message}")]
    InvalidSnapshot { path: PathBuf, message: String },

    #[error("label {0} is not assigned to any identity")]
    UnknownLabel(Label),

    #[error("cannot retrain: no retained patches for labels {0:?}")]
    IncompleteCorpus(Vec<Label>),

    #[error("appearance store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreOptions {
    pub lbph: LbphParams,
    /// Patches retained per label for [`AppearanceStore::retrain`]; 0 disables retention.
    pub corpus_per_identity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lbph: LbphParams::default(),
            corpus_per_identity: DEFAULT_CORPUS_PER_IDENTITY,
        }
    }
}

/// Whether a model exists yet, made explicit instead of inferred from files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Classifier {
    Empty,
    Trained(LbphModel),
}

impl Classifier {
    pub fn is_trained(&self) -> bool {
        matches!(self, Classifier::Trained(_))
    }

    pub fn model(&self) -> Option<&LbphModel> {
        match self {
            Classifier::Empty => None,
            Classifier::Trained(model) => Some(model),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreState {
    pub labels: LabelMap,
    pub classifier: Classifier,
    pub corpus: TrainingCorpus,
}

impl StoreState {
    pub fn empty(options: &StoreOptions) -> Self {
        Self {
            labels: LabelMap::default(),
            classifier: Classifier::Empty,
            corpus: TrainingCorpus::new(options.corpus_per_identity),
        }
    }

    /// First call trains, later calls update incrementally.
    fn extend(&mut self, samples: &[(&FacePatch, Label)], params: LbphParams) {
        if samples.is_empty() {
            return;
        }
        if let Classifier::Trained(model) = &mut self.classifier {
            model.update(samples.iter().copied());
        } else {
            tracing::info!(samples = samples.len(), "initial appearance model training");
            self.classifier = Classifier::Trained(LbphModel::train(params, samples.iter().copied()));
        }
        for &(patch, label) in samples {
            self.corpus.push(label, patch.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub identities: usize,
    pub trained: bool,
    pub model_samples: usize,
    pub model_labels: usize,
    pub corpus_patches: usize,
    pub corpus_per_identity: usize,
    pub next_label: Label,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrainSummary {
    pub labels: usize,
    pub samples: usize,
    /// Labels that had signatures in the old model but no longer map to anyone.
    pub purged_labels: Vec<Label>,
}

pub struct AppearanceStore {
    dir: PathBuf,
    options: StoreOptions,
    writer: Mutex<()>,
    state: RwLock<Arc<StoreState>>,
}

impl AppearanceStore {
    /// Restore from `dir`, or start empty when no usable snapshot exists.
    pub fn open(dir: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, StoreError> {
        let dir = dir.into();
        let state = match snapshot::read(&dir, &options)? {
            Some(state) => state,
            None => StoreState::empty(&options),
        };
        tracing::info!(
            dir = %dir.display(),
            identities = state.labels.len(),
            trained = state.classifier.is_trained(),
            "appearance store opened"
        );
        Ok(Self {
            dir,
            options,
            writer: Mutex::new(()),
            state: RwLock::new(Arc::new(state)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Consistent view of the current state.
    pub fn snapshot(&self) -> Result<Arc<StoreState>, StoreError> {
        let guard = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(Arc::clone(&guard))
    }

    pub fn label_of(&self, identity: &str) -> Result<Option<Label>, StoreError> {
        Ok(self.snapshot()?.labels.label_of(identity))
    }

    pub fn identity_of(&self, label: Label) -> Result<Option<String>, StoreError> {
        Ok(self.snapshot()?.labels.identity_of(label).map(str::to_string))
    }

    pub fn is_enrolled(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.label_of(identity)?.is_some())
    }

    pub fn is_trained(&self) -> Result<bool, StoreError> {
        Ok(self.snapshot()?.classifier.is_trained())
    }

    /// Label for `identity`, issuing and persisting a new one if needed.
    pub fn assign_label(&self, identity: &str) -> Result<Label, StoreError> {
        if let Some(label) = self.label_of(identity)? {
            return Ok(label);
        }
        self.mutate(|state| {
            let (label, issued) = state.labels.assign(identity);
            if issued {
                tracing::info!(identity, label, "label issued");
            }
            Ok(label)
        })
    }

    /// Train (first call) or update the model with already-labelled patches.
    pub fn extend<'a, I>(&self, samples: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (&'a FacePatch, Label)>,
    {
        let samples: Vec<(&FacePatch, Label)> = samples.into_iter().collect();
        if samples.is_empty() {
            return Ok(0);
        }
        let params = self.options.lbph;
        self.mutate(|state| {
            if let Some(&(_, label)) = samples.iter().find(|(_, l)| !state.labels.contains_label(*l)) {
                return Err(StoreError::UnknownLabel(label));
            }
            state.extend(&samples, params);
            Ok(samples.len())
        })
    }

    /// Label assignment and model update as one persisted step.
    pub fn enroll(&self, identity: &str, patches: &[FacePatch]) -> Result<Label, StoreError> {
        let params = self.options.lbph;
        self.mutate(|state| {
            let (label, issued) = state.labels.assign(identity);
            let samples: Vec<(&FacePatch, Label)> = patches.iter().map(|p| (p, label)).collect();
            state.extend(&samples, params);
            tracing::info!(identity, label, issued, patches = patches.len(), "identity enrolled");
            Ok(label)
        })
    }

    /// `None` while untrained.
    pub fn predict(&self, patch: &FacePatch) -> Result<Option<Prediction>, StoreError> {
        let state = self.snapshot()?;
        Ok(state.classifier.model().and_then(|m| m.predict(patch)))
    }

    /// Remove an identity from the map and corpus.
    ///
    /// Its model signatures remain until [`AppearanceStore::retrain`]; since its
    /// label no longer maps to anyone, a match on them can never verify.
    pub fn forget(&self, identity: &str) -> Result<Option<Label>, StoreError> {
        if self.label_of(identity)?.is_none() {
            return Ok(None);
        }
        self.mutate(|state| {
            let label = state.labels.remove(identity);
            if let Some(label) = label {
                let dropped = state.corpus.remove(label);
                tracing::info!(identity, label, dropped, "identity forgotten");
            }
            Ok(label)
        })
    }

    /// Rebuild the model from the retained corpus of mapped labels only.
    pub fn retrain(&self) -> Result<RetrainSummary, StoreError> {
        let params = self.options.lbph;
        self.mutate(|state| {
            let missing: Vec<Label> = state
                .labels
                .labels()
                .filter(|&l| !state.corpus.has_label(l))
                .collect();
            if !missing.is_empty() {
                return Err(StoreError::IncompleteCorpus(missing));
            }

            let labels = &state.labels;
            state.corpus.retain_labels(|l| labels.contains_label(l));
            let purged_labels: Vec<Label> = state
                .classifier
                .model()
                .map(|m| m.labels().into_iter().filter(|&l| !labels.contains_label(l)).collect())
                .unwrap_or_default();

            let samples: Vec<(&FacePatch, Label)> = state.corpus.samples().collect();
            let count = samples.len();
            state.classifier = if samples.is_empty() {
                Classifier::Empty
            } else {
                Classifier::Trained(LbphModel::train(params, samples))
            };

            tracing::info!(
                labels = state.labels.len(),
                samples = count,
                purged = purged_labels.len(),
                "appearance model retrained"
            );
            Ok(RetrainSummary {
                labels: state.labels.len(),
                samples: count,
                purged_labels,
            })
        })
    }

    /// Write the current state to disk.
    pub fn persist(&self) -> Result<(), StoreError> {
        let _writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let state = self.snapshot()?;
        snapshot::write(&self.dir, &state)
    }

    /// Replace in-memory state with what is on disk.
    pub fn restore(&self) -> Result<(), StoreError> {
        let _writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let state = match snapshot::read(&self.dir, &self.options)? {
            Some(state) => state,
            None => StoreState::empty(&self.options),
        };
        *self.state.write().map_err(|_| StoreError::Poisoned)? = Arc::new(state);
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.snapshot()?;
        let model = state.classifier.model();
        Ok(StoreStats {
            identities: state.labels.len(),
            trained: state.classifier.is_trained(),
            model_samples: model.map(LbphModel::sample_count).unwrap_or(0),
            model_labels: model.map(|m| m.labels().len()).unwrap_or(0),
            corpus_patches: state.corpus.len(),
            corpus_per_identity: state.corpus.capacity(),
            next_label: state.labels.next_label(),
        })
    }

    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        let current = self.snapshot()?;
        let mut next = StoreState::clone(&current);
        let out = op(&mut next)?;
        snapshot::write(&self.dir, &next)?;
        *self.state.write().map_err(|_| StoreError::Poisoned)? = Arc::new(next);
        Ok(out)
    }
}
