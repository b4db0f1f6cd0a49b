//! Identity ↔ label bijection with a monotonic label counter.

use crate::types::Label;
use std::collections::BTreeMap;

const FIRST_LABEL: Label = 1;

/// Both directions of the identity/label mapping, always updated together.
///
/// Labels come from `next_label`, which only ever grows: a removed identity's
/// label is retired, never handed to a newcomer.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    by_identity: BTreeMap<String, Label>,
    by_label: BTreeMap<Label, String>,
    next_label: Label,
}

impl Default for LabelMap {
    fn default() -> Self {
        Self {
            by_identity: BTreeMap::new(),
            by_label: BTreeMap::new(),
            next_label: FIRST_LABEL,
        }
    }
}

impl LabelMap {
    /// Rebuild from persisted tables, rejecting anything that is not a bijection.
    pub fn from_parts(
        next_label: Label,
        by_identity: BTreeMap<String, Label>,
        by_label: BTreeMap<Label, String>,
    ) -> Result<Self, String> {
        if by_identity.len() != by_label.len() {
            return Err(format!(
                "label tables disagree: {} identities vs {} labels",
                by_identity.len(),
                by_label.len()
            ));
        }
        for (identity, label) in &by_identity {
            match by_label.get(label) {
                Some(back) if back == identity => {}
                Some(back) => {
                    return Err(format!(
                        "label {label} maps to '{identity}' but reverses to '{back}'"
                    ))
                }
                None => return Err(format!("label {label} of '{identity}' has no reverse entry")),
            }
            if *label < FIRST_LABEL || *label >= next_label {
                return Err(format!(
                    "label {label} of '{identity}' outside issued range {FIRST_LABEL}..{next_label}"
                ));
            }
        }
        Ok(Self {
            by_identity,
            by_label,
            next_label,
        })
    }

    /// Return the identity's label, allocating the next one on first sight.
    ///
    /// The boolean is `true` when a new label was issued.
    pub fn assign(&mut self, identity: &str) -> (Label, bool) {
        if let Some(&label) = self.by_identity.get(identity) {
            return (label, false);
        }
        let label = self.next_label;
        self.next_label += 1;
        self.by_identity.insert(identity.to_string(), label);
        self.by_label.insert(label, identity.to_string());
        (label, true)
    }

    pub fn remove(&mut self, identity: &str) -> Option<Label> {
        let label = self.by_identity.remove(identity)?;
        self.by_label.remove(&label);
        Some(label)
    }

    pub fn label_of(&self, identity: &str) -> Option<Label> {
        self.by_identity.get(identity).copied()
    }

    pub fn identity_of(&self, label: Label) -> Option<&str> {
        self.by_label.get(&label).map(String::as_str)
    }

    pub fn contains_label(&self, label: Label) -> bool {
        self.by_label.contains_key(&label)
    }

    pub fn next_label(&self) -> Label {
        self.next_label
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    pub fn by_identity(&self) -> &BTreeMap<String, Label> {
        &self.by_identity
    }

    pub fn by_label(&self) -> &BTreeMap<Label, String> {
        &self.by_label
    }

    pub fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        self.by_label.keys().copied()
    }
}
