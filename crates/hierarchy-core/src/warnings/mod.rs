//! Duplicate and conflict warnings.
//!
//! [`scan`] re-derives the `warnings` of every staged record of one contact
//! type from scratch. Warnings are advisory: a scan never fails and never
//! blocks anything.
//!
//! # Scan
//!
//! The staged records (as [`ResolvedRecord`]s) and the authoritative records
//! of the type are flattened into one list, staged first. Each staged record
//! is offered to every [`Classifier`] together with the part of the list
//! after it, so each pair is compared once. A hit pushes one message onto
//! every implicated staged record and marks all of them for that classifier,
//! so a group of three produces one message per record rather than three.

mod redundant_replacement;
mod unique_property;

pub use redundant_replacement::RedundantReplacementClassifier;
pub use unique_property::UniquePropertyClassifier;

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::ContactType;
use crate::models::{ResolvedRecord, StagedRecord};

/// Detects one kind of collision among records of a contact type.
pub trait Classifier {
    /// Stable identifier, used in dedupe keys.
    fn key(&self) -> String;

    /// Records colliding with `candidate` among `remainder`, including
    /// `candidate` itself; `None` when nothing collides.
    fn detect(
        &self,
        candidate: &ResolvedRecord,
        remainder: &[ResolvedRecord],
    ) -> Option<Vec<ResolvedRecord>>;

    fn dedupe_key(&self, record: &ResolvedRecord) -> String {
        format!("{}:{}", self.key(), record.id)
    }

    /// Message shown on every implicated staged record.
    fn describe(&self, implicated: &[ResolvedRecord]) -> String;
}

/// A collision found during a scan.
#[derive(Debug, Clone)]
pub struct WarningGroup {
    pub classifier_key: String,
    pub implicated: Vec<ResolvedRecord>,
}

/// The classifiers that apply to a contact type: one per unique property,
/// plus the redundant replacement check.
pub fn classifiers_for(contact_type: &ContactType) -> Vec<Box<dyn Classifier>> {
    let mut classifiers: Vec<Box<dyn Classifier>> = contact_type
        .unique_properties()
        .map(|(property, scope)| {
            Box::new(UniquePropertyClassifier::new(contact_type, property, scope))
                as Box<dyn Classifier>
        })
        .collect();
    classifiers.push(Box::new(RedundantReplacementClassifier::new(contact_type)));
    classifiers
}

/// Rebuild the warnings on the staged records of `contact_type`.
///
/// `authoritative` is the cached platform bucket for the type. Platform
/// records a staged record stands in for (it replaces them, or was created
/// as them) are left out of the comparison.
pub fn scan(
    contact_type: &ContactType,
    authoritative: &[ResolvedRecord],
    staged: &mut [StagedRecord],
) -> Vec<WarningGroup> {
    let staged_indices: Vec<usize> = staged
        .iter()
        .enumerate()
        .filter(|(_, r)| r.contact_type == contact_type.name)
        .map(|(i, _)| i)
        .collect();

    for &i in &staged_indices {
        staged[i].warnings.clear();
    }

    let staged_resolved: Vec<ResolvedRecord> = staged_indices
        .iter()
        .map(|&i| staged[i].as_resolved(contact_type))
        .collect();

    let represented: HashSet<&str> = staged_resolved
        .iter()
        .flat_map(|r| {
            std::iter::once(r.id.as_str()).chain(r.replaces.as_ref().map(|x| x.id.as_str()))
        })
        .collect();

    let flattened: Vec<ResolvedRecord> = staged_resolved
        .iter()
        .cloned()
        .chain(
            authoritative
                .iter()
                .filter(|r| r.record_type == contact_type.name)
                .filter(|r| !represented.contains(r.id.as_str()))
                .cloned(),
        )
        .collect();

    let staged_position: HashMap<&str, usize> = staged_resolved
        .iter()
        .zip(&staged_indices)
        .map(|(r, &i)| (r.id.as_str(), i))
        .collect();

    let classifiers = classifiers_for(contact_type);
    let mut flagged: HashSet<String> = HashSet::new();
    let mut groups = Vec::new();
    let mut messages: Vec<(usize, String)> = Vec::new();

    for (position, record) in flattened.iter().take(staged_resolved.len()).enumerate() {
        for classifier in &classifiers {
            if flagged.contains(&classifier.dedupe_key(record)) {
                continue;
            }
            let implicated = match classifier.detect(record, &flattened[position + 1..]) {
                Some(implicated) => implicated,
                None => continue,
            };

            let message = classifier.describe(&implicated);
            for other in &implicated {
                flagged.insert(classifier.dedupe_key(other));
                if let Some(&index) = staged_position.get(other.id.as_str()) {
                    messages.push((index, message.clone()));
                }
            }
            groups.push(WarningGroup {
                classifier_key: classifier.key(),
                implicated,
            });
        }
    }

    for (index, message) in messages {
        staged[index].warnings.push(message);
    }

    debug!(
        contact_type = %contact_type.name,
        staged = staged_indices.len(),
        groups = groups.len(),
        "warning scan complete"
    );
    groups
}
