//! On-disk snapshot of the appearance store.
//!
//! Three artifacts live side by side in the data directory:
//!
//! - `appearance.<sha256>.model`: the classifier, MessagePack.
//! - `corpus.<sha256>.bin`: retained training patches, MessagePack (optional).
//! - `labels.json`: the label map plus the digests naming the other two.
//!
//! Model and corpus files are content-addressed, so writing them never
//! touches the files the current `labels.json` names. Renaming the new
//! `labels.json` into place is the single commit point; superseded artifacts
//! are deleted only after it. A crash at any step leaves the last committed
//! snapshot intact.

use crate::corpus::TrainingCorpus;
use crate::labels::LabelMap;
use crate::store::{Classifier, StoreError, StoreOptions, StoreState};
use crate::types::Label;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LABELS_FILE: &str = "labels.json";
const MODEL_PREFIX: &str = "appearance.";
const MODEL_SUFFIX: &str = ".model";
const CORPUS_PREFIX: &str = "corpus.";
const CORPUS_SUFFIX: &str = ".bin";

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Versioned<T> {
    version: u32,
    body: T,
}

/// Contents of `labels.json`: the map and the artifacts it was saved with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Manifest {
    version: u32,
    saved_at: String,
    next_label: Label,
    label_map: BTreeMap<String, Label>,
    reverse_map: BTreeMap<Label, String>,
    model_sha256: String,
    #[serde(default)]
    corpus_sha256: Option<String>,
}

pub fn model_path(dir: &Path, digest: &str) -> PathBuf {
    dir.join(format!("{MODEL_PREFIX}{digest}{MODEL_SUFFIX}"))
}

pub fn corpus_path(dir: &Path, digest: &str) -> PathBuf {
    dir.join(format!("{CORPUS_PREFIX}{digest}{CORPUS_SUFFIX}"))
}

fn is_artifact(name: &str) -> bool {
    (name.starts_with(MODEL_PREFIX) && name.ends_with(MODEL_SUFFIX))
        || (name.starts_with(CORPUS_PREFIX) && name.ends_with(CORPUS_SUFFIX))
}

fn is_digest(text: &str) -> bool {
    text.len() == 64 && text.bytes().all(|b| b.is_ascii_hexdigit())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn encode_err(artifact: &'static str) -> impl FnOnce(rmp_serde::encode::Error) -> StoreError {
    move |e| StoreError::Encode {
        artifact,
        message: e.to_string(),
    }
}

fn invalid(path: &Path, message: impl ToString) -> StoreError {
    StoreError::InvalidSnapshot {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Persist `state` under `dir` and make it the current snapshot.
pub fn write(dir: &Path, state: &StoreState) -> Result<(), StoreError> {
    let manifest = stage(dir, state)?;
    commit(dir, &manifest)
}

/// Write the model and corpus artifacts for `state` without committing them.
pub(crate) fn stage(dir: &Path, state: &StoreState) -> Result<Manifest, StoreError> {
    fs::create_dir_all(dir).map_err(|source| StoreError::Write {
        path: dir.to_path_buf(),
        source,
    })?;

    let model_bytes = rmp_serde::to_vec_named(&Versioned {
        version: SNAPSHOT_VERSION,
        body: &state.classifier,
    })
    .map_err(encode_err("appearance model"))?;
    let model_sha256 = sha256_hex(&model_bytes);
    write_atomic(&model_path(dir, &model_sha256), &model_bytes)?;

    let corpus_sha256 = if state.corpus.is_empty() {
        None
    } else {
        let corpus_bytes = rmp_serde::to_vec_named(&Versioned {
            version: SNAPSHOT_VERSION,
            body: &state.corpus,
        })
        .map_err(encode_err("training corpus"))?;
        let digest = sha256_hex(&corpus_bytes);
        write_atomic(&corpus_path(dir, &digest), &corpus_bytes)?;
        Some(digest)
    };

    tracing::debug!(
        dir = %dir.display(),
        model_bytes = model_bytes.len(),
        "snapshot artifacts staged"
    );
    Ok(Manifest {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now().to_rfc3339(),
        next_label: state.labels.next_label(),
        label_map: state.labels.by_identity().clone(),
        reverse_map: state.labels.by_label().clone(),
        model_sha256,
        corpus_sha256,
    })
}

/// Rename the label map into place, then delete artifacts it no longer names.
pub(crate) fn commit(dir: &Path, manifest: &Manifest) -> Result<(), StoreError> {
    let labels_bytes = serde_json::to_vec_pretty(manifest).map_err(|e| StoreError::Encode {
        artifact: "label map",
        message: e.to_string(),
    })?;
    write_atomic(&dir.join(LABELS_FILE), &labels_bytes)?;

    let keep = [
        Some(model_path(dir, &manifest.model_sha256)),
        manifest.corpus_sha256.as_deref().map(|d| corpus_path(dir, d)),
    ];
    for stale in artifacts(dir)? {
        if keep.iter().flatten().any(|k| *k == stale) {
            continue;
        }
        // Already committed; a leftover file is harmless and goes on the next save.
        if let Err(e) = fs::remove_file(&stale) {
            tracing::warn!(path = %stale.display(), error = %e, "could not remove superseded artifact");
        }
    }

    tracing::debug!(
        dir = %dir.display(),
        identities = manifest.label_map.len(),
        "snapshot committed"
    );
    Ok(())
}

/// Every model and corpus file under `dir`, committed or not.
pub fn artifacts(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Read {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_name().to_str().is_some_and(is_artifact) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Load the snapshot under `dir`.
///
/// `Ok(None)` means "start fresh": nothing was committed yet, or the files
/// the map names are gone or do not match. Unreadable or structurally
/// invalid files are errors so they are never silently overwritten.
pub fn read(dir: &Path, options: &StoreOptions) -> Result<Option<StoreState>, StoreError> {
    let labels_path = dir.join(LABELS_FILE);
    if !labels_path.exists() {
        if artifacts(dir)?.is_empty() {
            tracing::info!(dir = %dir.display(), "no snapshot found, starting empty");
        } else {
            tracing::warn!(dir = %dir.display(), "model artifacts without a label map, starting empty");
        }
        return Ok(None);
    }

    let labels_bytes = read_file(&labels_path)?;
    let manifest: Manifest =
        serde_json::from_slice(&labels_bytes).map_err(|e| invalid(&labels_path, e))?;
    if manifest.version != SNAPSHOT_VERSION {
        return Err(invalid(
            &labels_path,
            format!("unsupported snapshot version {}", manifest.version),
        ));
    }
    let digests = std::iter::once(manifest.model_sha256.as_str()).chain(manifest.corpus_sha256.as_deref());
    if let Some(bad) = digests.into_iter().find(|d| !is_digest(d)) {
        return Err(invalid(&labels_path, format!("malformed artifact digest {bad:?}")));
    }

    let model_path = model_path(dir, &manifest.model_sha256);
    if !model_path.exists() {
        tracing::warn!(
            path = %model_path.display(),
            "label map names a missing model, starting empty"
        );
        return Ok(None);
    }
    let model_bytes = read_file(&model_path)?;
    if sha256_hex(&model_bytes) != manifest.model_sha256 {
        tracing::warn!(
            path = %model_path.display(),
            "model does not match label map digest, starting empty"
        );
        return Ok(None);
    }
    let model: Versioned<Classifier> =
        rmp_serde::from_slice(&model_bytes).map_err(|e| invalid(&model_path, e))?;
    if model.version != SNAPSHOT_VERSION {
        return Err(invalid(
            &model_path,
            format!("unsupported model version {}", model.version),
        ));
    }

    let labels = LabelMap::from_parts(manifest.next_label, manifest.label_map, manifest.reverse_map)
        .map_err(|m| invalid(&labels_path, m))?;

    if let Classifier::Trained(m) = &model.body {
        if let Some(&max) = m.labels().iter().next_back() {
            if max >= labels.next_label() {
                return Err(invalid(
                    &model_path,
                    format!("model holds label {max} which was never issued"),
                ));
            }
        }
        if *m.params() != options.lbph {
            tracing::warn!(
                stored = ?m.params(),
                configured = ?options.lbph,
                "LBPH parameters differ from stored model; keeping stored until retrain"
            );
        }
    }

    let corpus = read_corpus(dir, manifest.corpus_sha256.as_deref(), options.corpus_per_identity);

    tracing::info!(
        dir = %dir.display(),
        saved_at = %manifest.saved_at,
        identities = labels.len(),
        "snapshot restored"
    );
    Ok(Some(StoreState {
        labels,
        classifier: model.body,
        corpus,
    }))
}

/// The corpus only feeds retrains, so any problem with it degrades to empty.
fn read_corpus(dir: &Path, digest: Option<&str>, capacity: usize) -> TrainingCorpus {
    let Some(digest) = digest else {
        return TrainingCorpus::new(capacity);
    };
    let path = corpus_path(dir, digest);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "training corpus unreadable");
            return TrainingCorpus::new(capacity);
        }
    };
    if sha256_hex(&bytes) != digest {
        tracing::warn!(path = %path.display(), "training corpus digest mismatch");
        return TrainingCorpus::new(capacity);
    }
    match rmp_serde::from_slice::<Versioned<TrainingCorpus>>(&bytes) {
        Ok(artifact) if artifact.version == SNAPSHOT_VERSION => {
            let mut corpus = artifact.body;
            corpus.set_capacity(capacity);
            corpus
        }
        Ok(artifact) => {
            tracing::warn!(
                path = %path.display(),
                version = artifact.version,
                "unsupported training corpus version"
            );
            TrainingCorpus::new(capacity)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "training corpus undecodable");
            TrainingCorpus::new(capacity)
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, StoreError> {
    fs::read(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Write to a temp file in the same directory, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let write_err = |source: std::io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.flush().map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(write_err)?;
    }

    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
