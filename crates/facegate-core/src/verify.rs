//! 1:1 verification of a claimed identity against a probe image.

use crate::normalizer::{ImageInput, ImageNormalizer, ImageRejection};
use crate::store::{AppearanceStore, StoreError};
use crate::types::{Label, Prediction};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_ACCEPT_THRESHOLD: f64 = 0.6;
pub const DEFAULT_DISTANCE_SCALE: f64 = 100.0;

/// Maps classifier distance to a confidence and decides acceptance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    /// Minimum confidence for acceptance, inclusive.
    pub accept_threshold: f64,
    /// Distance at which confidence reaches 0.
    pub distance_scale: f64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            distance_scale: DEFAULT_DISTANCE_SCALE,
        }
    }
}

impl DecisionPolicy {
    /// `clamp(scale - distance, 0, scale) / scale`, always in `[0, 1]`.
    pub fn confidence(&self, distance: f64) -> f64 {
        if self.distance_scale <= 0.0 || distance.is_nan() {
            return 0.0;
        }
        (self.distance_scale - distance).clamp(0.0, self.distance_scale) / self.distance_scale
    }

    /// Accept only when the classifier picked the claimed label with enough confidence.
    pub fn decide(&self, claimed: Label, prediction: Prediction) -> Verification {
        let confidence = self.confidence(prediction.distance);
        let reason = if prediction.label != claimed {
            Some(VerifyReason::IdentityMismatch {
                predicted: prediction.label,
            })
        } else if confidence < self.accept_threshold {
            Some(VerifyReason::LowConfidence {
                confidence,
                threshold: self.accept_threshold,
            })
        } else {
            None
        };
        Verification {
            accepted: reason.is_none(),
            confidence,
            prediction: Some(prediction),
            reason,
        }
    }
}

/// Why a probe was not accepted.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum VerifyReason {
    #[error("identity is not enrolled")]
    NotEnrolled,
    #[error("{0}")]
    Image(ImageRejection),
    #[error("no appearance model trained yet")]
    Untrained,
    #[error("face matched a different enrolled label ({predicted})")]
    IdentityMismatch { predicted: Label },
    #[error("confidence {confidence:.2} below threshold {threshold:.2}")]
    LowConfidence { confidence: f64, threshold: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub accepted: bool,
    pub confidence: f64,
    /// Classifier output, when the probe got that far.
    pub prediction: Option<Prediction>,
    /// Set on every rejection.
    pub reason: Option<VerifyReason>,
}

impl Verification {
    pub fn rejected(reason: VerifyReason) -> Self {
        Self {
            accepted: false,
            confidence: 0.0,
            prediction: None,
            reason: Some(reason),
        }
    }
}

pub struct VerificationEngine {
    normalizer: Arc<ImageNormalizer>,
    store: Arc<AppearanceStore>,
    policy: DecisionPolicy,
}

impl VerificationEngine {
    pub fn new(
        normalizer: Arc<ImageNormalizer>,
        store: Arc<AppearanceStore>,
        policy: DecisionPolicy,
    ) -> Self {
        Self {
            normalizer,
            store,
            policy,
        }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    /// Read-only. Errors only on store failures; every biometric outcome is a `Verification`.
    pub fn verify(&self, identity: &str, probe: &ImageInput<'_>) -> Result<Verification, StoreError> {
        if !self.store.is_enrolled(identity)? {
            tracing::info!(identity, "verification rejected: not enrolled");
            return Ok(Verification::rejected(VerifyReason::NotEnrolled));
        }

        let patch = match self.normalizer.validate(probe) {
            Ok(patch) => patch,
            Err(rejection) => {
                tracing::info!(identity, reason = %rejection, "verification rejected: bad probe");
                return Ok(Verification::rejected(VerifyReason::Image(rejection)));
            }
        };

        // Label lookup and prediction against one consistent state.
        let state = self.store.snapshot()?;
        let Some(claimed) = state.labels.label_of(identity) else {
            return Ok(Verification::rejected(VerifyReason::NotEnrolled));
        };
        let Some(prediction) = state.classifier.model().and_then(|m| m.predict(&patch)) else {
            tracing::info!(identity, "verification rejected: untrained");
            return Ok(Verification::rejected(VerifyReason::Untrained));
        };

        let verification = self.policy.decide(claimed, prediction);
        tracing::info!(
            identity,
            claimed,
            predicted = prediction.label,
            distance = prediction.distance,
            confidence = verification.confidence,
            accepted = verification.accepted,
            "verification decided"
        );
        Ok(verification)
    }
}
