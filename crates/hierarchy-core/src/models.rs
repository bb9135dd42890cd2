//! Core data models used throughout Hierarchy Manager.
//!
//! These types represent the staged records an operator is preparing, the
//! authoritative records that already exist on the platform, and the outcome
//! of resolving one against the other.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ContactType;
use crate::normalize::format_name;

/// A raw user-supplied value alongside its display form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertyValue {
    pub original: String,
    pub formatted: String,
}

impl PropertyValue {
    /// A name-like value; the display form is title-cased.
    pub fn name(original: &str) -> Self {
        Self {
            original: original.trim().to_string(),
            formatted: format_name(original),
        }
    }

    pub fn plain(original: &str) -> Self {
        Self {
            original: original.trim().to_string(),
            formatted: original.trim().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }
}

/// Where a [`ResolvedRecord`] lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Already exists on the platform.
    Remote,
    /// A staged record that has not been created yet.
    Local { staged_id: String },
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local { .. })
    }
}

/// Id and display name of a record referenced from another one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub id: String,
    pub name: String,
}

/// A concrete record a hierarchy level can resolve to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    pub id: String,
    pub name: PropertyValue,
    pub record_type: String,
    /// Ancestor ids, nearest first. Staged records may have gaps.
    pub lineage: Vec<Option<String>>,
    /// Values of the properties configured as unique for this type.
    pub unique_values: BTreeMap<String, String>,
    pub contact_id: Option<String>,
    pub origin: Origin,
    /// For staged records: the authoritative record being replaced.
    pub replaces: Option<RecordRef>,
}

impl ResolvedRecord {
    /// Ancestor id `offset` steps above this record's parent (0 = parent).
    pub fn lineage_at(&self, offset: usize) -> Option<&str> {
        self.lineage.get(offset).and_then(|id| id.as_deref())
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.lineage_at(0)
    }
}

/// Outcome of resolving one hierarchy level.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(ResolvedRecord),
    NotFound,
    /// More than one distinct record matched the input.
    Ambiguous(Vec<ResolvedRecord>),
}

impl Resolution {
    pub fn found(&self) -> Option<&ResolvedRecord> {
        match self {
            Resolution::Found(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }

    /// Ids this resolution still admits: the found id, or every candidate
    /// of an ambiguity. `NotFound` admits nothing.
    pub fn admitted_ids(&self) -> Vec<&str> {
        match self {
            Resolution::Found(record) => vec![record.id.as_str()],
            Resolution::Ambiguous(candidates) => candidates.iter().map(|c| c.id.as_str()).collect(),
            Resolution::NotFound => Vec::new(),
        }
    }
}

/// A place being prepared locally before it is created on the platform.
#[derive(Debug, Clone)]
pub struct StagedRecord {
    pub id: String,
    pub contact_type: String,
    pub properties: BTreeMap<String, PropertyValue>,
    pub hierarchy_properties: BTreeMap<String, PropertyValue>,
    /// Indexed by hierarchy level, 0 = replacement.
    pub resolved_hierarchy: Vec<Option<Resolution>>,
    pub validation_errors: BTreeMap<String, String>,
    pub warnings: Vec<String>,
    /// Platform id once the record has been created.
    pub created_id: Option<String>,
}

impl StagedRecord {
    pub fn new(contact_type: &ContactType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            contact_type: contact_type.name.clone(),
            properties: BTreeMap::new(),
            hierarchy_properties: BTreeMap::new(),
            resolved_hierarchy: vec![None; contact_type.depth() + 1],
            validation_errors: BTreeMap::new(),
            warnings: Vec::new(),
            created_id: None,
        }
    }

    pub fn set_property(&mut self, name: &str, value: &str) {
        let value = if name == "name" {
            PropertyValue::name(value)
        } else {
            PropertyValue::plain(value)
        };
        self.properties.insert(name.to_string(), value);
    }

    pub fn set_hierarchy_property(&mut self, name: &str, value: &str) {
        self.hierarchy_properties
            .insert(name.to_string(), PropertyValue::name(value));
    }

    /// The non-empty raw input for a hierarchy property.
    pub fn hierarchy_input(&self, property_name: &str) -> Option<&str> {
        self.hierarchy_properties
            .get(property_name)
            .map(|v| v.original.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> PropertyValue {
        self.properties.get("name").cloned().unwrap_or_default()
    }

    pub fn resolved(&self, level: usize) -> Option<&Resolution> {
        self.resolved_hierarchy.get(level).and_then(Option::as_ref)
    }

    pub fn is_created(&self) -> bool {
        self.created_id.is_some()
    }

    pub fn mark_created(&mut self, platform_id: &str) {
        self.created_id = Some(platform_id.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }

    /// This record as a resolution candidate for other records.
    pub fn as_resolved(&self, contact_type: &ContactType) -> ResolvedRecord {
        let lineage = self
            .resolved_hierarchy
            .iter()
            .skip(1)
            .map(|r| r.as_ref().and_then(Resolution::found).map(|f| f.id.clone()))
            .collect();

        let unique_values = contact_type
            .unique_properties()
            .filter_map(|(p, _)| {
                self.properties
                    .get(&p.property_name)
                    .filter(|v| !v.is_empty())
                    .map(|v| (p.property_name.clone(), v.formatted.clone()))
            })
            .collect();

        let replaces = self
            .resolved(0)
            .and_then(Resolution::found)
            .map(|r| RecordRef {
                id: r.id.clone(),
                name: r.name.formatted.clone(),
            });

        let (id, origin) = match &self.created_id {
            Some(created) => (created.clone(), Origin::Remote),
            None => (
                self.id.clone(),
                Origin::Local {
                    staged_id: self.id.clone(),
                },
            ),
        };

        ResolvedRecord {
            id,
            name: self.name(),
            record_type: self.contact_type.clone(),
            lineage,
            unique_values,
            contact_id: None,
            origin,
            replaces,
        }
    }
}
