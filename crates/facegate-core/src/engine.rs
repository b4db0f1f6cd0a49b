//! Facade wiring detector, normalizer, store and both engines from one config.

use crate::config::EngineConfig;
use crate::detector::{CascadeDetector, DetectorError, FaceDetector};
use crate::enroll::{EnrollError, Enrollment, EnrollmentEngine};
use crate::normalizer::{ImageInput, ImageNormalizer, ImageRejection};
use crate::store::{AppearanceStore, RetrainSummary, StoreError, StoreStats};
use crate::types::{FacePatch, FaceRegion, Label};
use crate::verify::{Verification, VerificationEngine};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Shareable entry point; all methods take `&self` and are safe to call concurrently.
pub struct FaceGate {
    normalizer: Arc<ImageNormalizer>,
    store: Arc<AppearanceStore>,
    enrollment: EnrollmentEngine,
    verification: VerificationEngine,
}

impl FaceGate {
    /// Load the cascade from `config.cascade_path()` and open the store under `config.data_dir`.
    pub fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        let detector = CascadeDetector::load(&config.cascade_path(), config.scan_params())?;
        Self::with_detector(config, Arc::new(detector))
    }

    /// Same as [`FaceGate::open`] with a caller-supplied detector.
    pub fn with_detector(
        config: &EngineConfig,
        detector: Arc<dyn FaceDetector>,
    ) -> Result<Self, EngineError> {
        let normalizer = Arc::new(ImageNormalizer::new(detector, config.normalizer_params()));
        let store = Arc::new(AppearanceStore::open(&config.data_dir, config.store_options())?);
        let enrollment = EnrollmentEngine::new(
            Arc::clone(&normalizer),
            Arc::clone(&store),
            config.enroll_limits(),
        );
        let verification = VerificationEngine::new(
            Arc::clone(&normalizer),
            Arc::clone(&store),
            config.decision_policy(),
        );
        Ok(Self {
            normalizer,
            store,
            enrollment,
            verification,
        })
    }

    pub fn enroll(&self, identity: &str, images: &[ImageInput<'_>]) -> Result<Enrollment, EnrollError> {
        self.enrollment.enroll(identity, images)
    }

    pub fn verify(&self, identity: &str, probe: &ImageInput<'_>) -> Result<Verification, StoreError> {
        self.verification.verify(identity, probe)
    }

    pub fn is_enrolled(&self, identity: &str) -> Result<bool, StoreError> {
        self.store.is_enrolled(identity)
    }

    pub fn forget(&self, identity: &str) -> Result<Option<Label>, StoreError> {
        self.store.forget(identity)
    }

    pub fn retrain(&self) -> Result<RetrainSummary, StoreError> {
        self.store.retrain()
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.store.stats()
    }

    /// Detector output for one image, without quality gates.
    pub fn locate(&self, image: &ImageInput<'_>) -> Result<Vec<FaceRegion>, ImageRejection> {
        self.normalizer.locate(image)
    }

    /// Normalized patch of the strongest detection, without quality gates.
    pub fn extract(&self, image: &ImageInput<'_>) -> Result<FacePatch, ImageRejection> {
        self.normalizer.extract(image)
    }

    pub fn store(&self) -> &Arc<AppearanceStore> {
        &self.store
    }

    pub fn normalizer(&self) -> &Arc<ImageNormalizer> {
        &self.normalizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::tests::center_bright_cascade;
    use crate::testing::{self, ScriptedDetector, Subject};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            data_dir: dir.path().join("data"),
            ..EngineConfig::default()
        }
    }

    fn gate(dir: &TempDir) -> FaceGate {
        let detector = Arc::new(ScriptedDetector::single(testing::face_region()));
        FaceGate::with_detector(&config(dir), detector).unwrap()
    }

    #[test]
    fn test_open_without_cascade_fails() {
        let dir = TempDir::new().unwrap();
        let cfg = EngineConfig {
            cascade_path: Some(dir.path().join("missing.xml")),
            ..config(&dir)
        };
        assert!(matches!(
            FaceGate::open(&cfg),
            Err(EngineError::Detector(DetectorError::ModelNotFound(_)))
        ));
    }

    #[test]
    fn test_open_with_cascade_file() {
        let dir = TempDir::new().unwrap();
        let cfg = EngineConfig {
            cascade_path: Some(dir.path().join("cascade.json")),
            ..config(&dir)
        };
        std::fs::write(
            cfg.cascade_path(),
            serde_json::to_vec(&center_bright_cascade()).unwrap(),
        )
        .unwrap();
        let gate = FaceGate::open(&cfg).unwrap();
        assert!(!gate.stats().unwrap().trained);
    }

    #[test]
    fn test_enroll_verify_forget_cycle() {
        let dir = TempDir::new().unwrap();
        let gate = gate(&dir);
        let subject = Subject::new(71);
        let photos: Vec<Vec<u8>> = (0..3).map(|v| subject.photo(v)).collect();
        let inputs: Vec<ImageInput<'_>> = photos.iter().map(|p| ImageInput::Encoded(p.as_slice())).collect();

        let enrollment = gate.enroll("W1", &inputs).unwrap();
        assert_eq!(enrollment.label, 1);
        assert!(gate.is_enrolled("W1").unwrap());

        let probe = subject.photo(4);
        assert!(gate.verify("W1", &ImageInput::Encoded(&probe)).unwrap().accepted);

        assert_eq!(gate.forget("W1").unwrap(), Some(1));
        assert!(!gate.verify("W1", &ImageInput::Encoded(&probe)).unwrap().accepted);
        assert_eq!(gate.retrain().unwrap().purged_labels, vec![1]);
        assert!(!gate.stats().unwrap().trained);
    }

    #[test]
    fn test_extract_returns_patch_without_gates() {
        let dir = TempDir::new().unwrap();
        let gate = gate(&dir);
        let patch = gate.extract(&ImageInput::Encoded(&Subject::new(73).photo(0))).unwrap();
        assert_eq!(patch.size(), 200);
        assert!(matches!(
            FaceGate::with_detector(&config(&dir), Arc::new(ScriptedDetector::new(Vec::new())))
                .unwrap()
                .extract(&ImageInput::Encoded(&Subject::new(73).photo(0))),
            Err(ImageRejection::NoFace)
        ));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let subject = Subject::new(72);
        let photos: Vec<Vec<u8>> = (0..3).map(|v| subject.photo(v)).collect();
        let inputs: Vec<ImageInput<'_>> = photos.iter().map(|p| ImageInput::Encoded(p.as_slice())).collect();
        gate(&dir).enroll("W1", &inputs).unwrap();

        let reopened = gate(&dir);
        assert!(reopened.is_enrolled("W1").unwrap());
        let probe = subject.photo(5);
        assert!(reopened.verify("W1", &ImageInput::Encoded(&probe)).unwrap().accepted);
    }
}
