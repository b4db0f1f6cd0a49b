//! Multi-image enrollment: validate every candidate, then commit survivors.

use crate::normalizer::{ImageInput, ImageNormalizer, ImageRejection};
use crate::store::{AppearanceStore, StoreError};
use crate::types::{FacePatch, Label};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_MIN_IMAGES: usize = 3;
pub const DEFAULT_MAX_IMAGES: usize = 10;
pub const DEFAULT_MIN_VALID: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollLimits {
    pub min_images: usize,
    pub max_images: usize,
    /// Accepted candidates required before anything is committed.
    pub min_valid: usize,
}

impl Default for EnrollLimits {
    fn default() -> Self {
        Self {
            min_images: DEFAULT_MIN_IMAGES,
            max_images: DEFAULT_MAX_IMAGES,
            min_valid: DEFAULT_MIN_VALID,
        }
    }
}

/// Verdict for one candidate image, positionally aligned with the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ImageOutcome {
    Accepted,
    Rejected(ImageRejection),
}

impl ImageOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ImageOutcome::Accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enrollment {
    pub identity: String,
    pub label: Label,
    pub outcomes: Vec<ImageOutcome>,
    /// Patches added to the model by this call.
    pub patches_added: usize,
}

impl Enrollment {
    pub fn success_flags(&self) -> Vec<bool> {
        self.outcomes.iter().map(ImageOutcome::is_accepted).collect()
    }

    pub fn rejected_indices(&self) -> Vec<usize> {
        rejected_indices(&self.outcomes)
    }
}

fn rejected_indices(outcomes: &[ImageOutcome]) -> Vec<usize> {
    outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| !o.is_accepted())
        .map(|(i, _)| i)
        .collect()
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("identity must not be empty")]
    EmptyIdentity,

    #[error("at least {min} images required, got {given}")]
    TooFewImages { given: usize, min: usize },

    #[error("at most {max} images allowed, got {given}")]
    TooManyImages { given: usize, max: usize },

    #[error("only {valid} valid face images, need {required} (rejected indices {rejected:?})")]
    TooFewValid {
        valid: usize,
        required: usize,
        rejected: Vec<usize>,
        outcomes: Vec<ImageOutcome>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct EnrollmentEngine {
    normalizer: Arc<ImageNormalizer>,
    store: Arc<AppearanceStore>,
    limits: EnrollLimits,
}

impl EnrollmentEngine {
    pub fn new(
        normalizer: Arc<ImageNormalizer>,
        store: Arc<AppearanceStore>,
        limits: EnrollLimits,
    ) -> Self {
        Self {
            normalizer,
            store,
            limits,
        }
    }

    pub fn limits(&self) -> &EnrollLimits {
        &self.limits
    }

    /// Enroll `identity` from candidate images.
    ///
    /// Every image is judged; failures are reported per position and do not
    /// abort the call. Only when enough images survive are the label and
    /// the trained patches committed, together, in one persisted step.
    pub fn enroll(&self, identity: &str, images: &[ImageInput<'_>]) -> Result<Enrollment, EnrollError> {
        if identity.trim().is_empty() {
            return Err(EnrollError::EmptyIdentity);
        }
        if images.len() < self.limits.min_images {
            return Err(EnrollError::TooFewImages {
                given: images.len(),
                min: self.limits.min_images,
            });
        }
        if images.len() > self.limits.max_images {
            return Err(EnrollError::TooManyImages {
                given: images.len(),
                max: self.limits.max_images,
            });
        }

        // Normalization runs outside the store's writer lock.
        let mut patches: Vec<FacePatch> = Vec::with_capacity(images.len());
        let mut outcomes = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            match self.normalizer.validate(image) {
                Ok(patch) => {
                    patches.push(patch);
                    outcomes.push(ImageOutcome::Accepted);
                }
                Err(reason) => {
                    tracing::debug!(identity, index, %reason, "enrollment image rejected");
                    outcomes.push(ImageOutcome::Rejected(reason));
                }
            }
        }

        if patches.len() < self.limits.min_valid {
            tracing::info!(
                identity,
                valid = patches.len(),
                required = self.limits.min_valid,
                "enrollment rejected: too few valid images"
            );
            return Err(EnrollError::TooFewValid {
                valid: patches.len(),
                required: self.limits.min_valid,
                rejected: rejected_indices(&outcomes),
                outcomes,
            });
        }

        let label = self.store.enroll(identity, &patches)?;
        tracing::info!(
            identity,
            label,
            accepted = patches.len(),
            submitted = images.len(),
            "enrollment committed"
        );

        Ok(Enrollment {
            identity: identity.to_string(),
            label,
            outcomes,
            patches_added: patches.len(),
        })
    }
}
