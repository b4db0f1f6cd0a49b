//! facegate-core — Face enrollment and 1:1 verification engine.
//!
//! Faces are localized with a Haar cascade, normalized into fixed-size
//! patches and matched with an incrementally trained LBPH model. The model
//! and its identity map persist together as one snapshot.

pub mod config;
pub mod corpus;
pub mod detector;
pub mod engine;
pub mod enroll;
pub mod labels;
pub mod lbph;
pub mod normalizer;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod verify;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, EngineConfig};
pub use detector::{CascadeDetector, DetectorError, FaceDetector, ScanParams};
pub use engine::{EngineError, FaceGate};
pub use enroll::{EnrollError, EnrollLimits, Enrollment, EnrollmentEngine, ImageOutcome};
pub use normalizer::{ImageInput, ImageNormalizer, ImageRejection, NormalizerParams};
pub use store::{AppearanceStore, StoreError, StoreOptions, StoreStats};
pub use types::{FacePatch, FaceRegion, Label, Prediction};
pub use verify::{DecisionPolicy, Verification, VerificationEngine, VerifyReason};
