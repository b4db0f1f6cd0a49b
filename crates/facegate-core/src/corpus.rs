//! Bounded per-label retention of training patches, used for full retrains.

use crate::types::{FacePatch, Label};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Keeps at most `capacity` of the most recent patches per label.
///
/// A capacity of 0 disables retention entirely. Patches are shared between
/// clones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingCorpus {
    capacity: usize,
    patches: BTreeMap<Label, VecDeque<Arc<FacePatch>>>,
}

impl TrainingCorpus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            patches: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the retention bound, evicting the oldest overflow.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        for queue in self.patches.values_mut() {
            while queue.len() > capacity {
                queue.pop_front();
            }
        }
        self.patches.retain(|_, q| !q.is_empty());
    }

    pub fn push(&mut self, label: Label, patch: impl Into<Arc<FacePatch>>) {
        if self.capacity == 0 {
            return;
        }
        let queue = self.patches.entry(label).or_default();
        queue.push_back(patch.into());
        while queue.len() > self.capacity {
            queue.pop_front();
        }
    }

    pub fn remove(&mut self, label: Label) -> usize {
        self.patches.remove(&label).map(|q| q.len()).unwrap_or(0)
    }

    pub fn retain_labels(&mut self, mut keep: impl FnMut(Label) -> bool) {
        self.patches.retain(|label, _| keep(*label));
    }

    pub fn has_label(&self, label: Label) -> bool {
        self.patches.contains_key(&label)
    }

    pub fn len(&self) -> usize {
        self.patches.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Every retained (patch, label) pair, grouped by label in ascending order.
    pub fn samples(&self) -> impl Iterator<Item = (&FacePatch, Label)> + '_ {
        self.patches
            .iter()
            .flat_map(|(&label, queue)| queue.iter().map(move |p| (p.as_ref(), label)))
    }
}
