use crate::config::{ContactType, PlaceProperty, UniqueScope};
use crate::models::ResolvedRecord;
use crate::normalize::fold;

use super::Classifier;

/// Two records collide when a unique property has the same value, ignoring
/// case and diacritics. With [`UniqueScope::Parent`] only records under the
/// same parent are compared.
pub struct UniquePropertyClassifier {
    type_friendly: String,
    property: PlaceProperty,
    scope: UniqueScope,
}

impl UniquePropertyClassifier {
    pub fn new(contact_type: &ContactType, property: &PlaceProperty, scope: UniqueScope) -> Self {
        Self {
            type_friendly: contact_type.friendly.clone(),
            property: property.clone(),
            scope,
        }
    }

    fn value_of(&self, record: &ResolvedRecord) -> Option<String> {
        record
            .unique_values
            .get(&self.property.property_name)
            .map(|v| fold(v))
            .filter(|v| !v.is_empty())
    }

    fn same_scope(&self, a: &ResolvedRecord, b: &ResolvedRecord) -> bool {
        match self.scope {
            UniqueScope::All => true,
            UniqueScope::Parent => match (a.parent_id(), b.parent_id()) {
                (Some(pa), Some(pb)) => pa == pb,
                _ => false,
            },
        }
    }
}

impl Classifier for UniquePropertyClassifier {
    fn key(&self) -> String {
        format!("unique:{}", self.property.property_name)
    }

    fn detect(
        &self,
        candidate: &ResolvedRecord,
        remainder: &[ResolvedRecord],
    ) -> Option<Vec<ResolvedRecord>> {
        let value = self.value_of(candidate)?;
        let matches: Vec<ResolvedRecord> = remainder
            .iter()
            .filter(|other| self.value_of(other).as_deref() == Some(value.as_str()))
            .filter(|other| self.same_scope(candidate, other))
            .cloned()
            .collect();

        if matches.is_empty() {
            return None;
        }
        let mut implicated = Vec::with_capacity(matches.len() + 1);
        implicated.push(candidate.clone());
        implicated.extend(matches);
        Some(implicated)
    }

    fn describe(&self, implicated: &[ResolvedRecord]) -> String {
        let value = implicated
            .first()
            .and_then(|r| r.unique_values.get(&self.property.property_name))
            .cloned()
            .unwrap_or_default();
        let scope = match self.scope {
            UniqueScope::All => "",
            UniqueScope::Parent => " under the same parent",
        };
        format!(
            "{} '{}' records share the {} '{}'{}",
            implicated.len(),
            self.type_friendly,
            self.property.friendly_name,
            value,
            scope
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::chu_type;
    use crate::models::{Origin, PropertyValue};

    fn record(id: &str, parent: Option<&str>, name: &str) -> ResolvedRecord {
        ResolvedRecord {
            id: id.to_string(),
            name: PropertyValue::name(name),
            record_type: "c_community_health_unit".to_string(),
            lineage: vec![parent.map(str::to_string)],
            unique_values: [("name".to_string(), name.to_string())].into_iter().collect(),
            contact_id: None,
            origin: Origin::Remote,
            replaces: None,
        }
    }

    fn name_classifier() -> UniquePropertyClassifier {
        let chu = chu_type();
        let property = chu.place_properties[0].clone();
        UniquePropertyClassifier::new(&chu, &property, UniqueScope::Parent)
    }

    #[test]
    fn test_missing_parent_never_collides_within_parent() {
        let classifier = name_classifier();
        let a = record("a", None, "Kitui");
        let b = record("b", None, "Kitui");
        assert!(classifier.detect(&a, &[b]).is_none());
    }

    #[test]
    fn test_describe_names_value_and_scope() {
        let classifier = name_classifier();
        let a = record("a", Some("p"), "Kitui");
        let b = record("b", Some("p"), "KITUI");
        let implicated = classifier.detect(&a, &[b]).unwrap();
        assert_eq!(
            classifier.describe(&implicated),
            "2 'Community Health Unit' records share the Name 'Kitui' under the same parent"
        );
    }
}
