use crate::config::ContactType;
use crate::models::ResolvedRecord;

use super::Classifier;

/// Two staged records that both replace the same platform record.
pub struct RedundantReplacementClassifier {
    type_friendly: String,
}

impl RedundantReplacementClassifier {
    pub fn new(contact_type: &ContactType) -> Self {
        Self {
            type_friendly: contact_type.friendly.clone(),
        }
    }
}

impl Classifier for RedundantReplacementClassifier {
    fn key(&self) -> String {
        "redundant-replacement".to_string()
    }

    fn detect(
        &self,
        candidate: &ResolvedRecord,
        remainder: &[ResolvedRecord],
    ) -> Option<Vec<ResolvedRecord>> {
        let target = candidate.replaces.as_ref()?;
        let matches: Vec<ResolvedRecord> = remainder
            .iter()
            .filter(|other| other.replaces.as_ref().map(|r| &r.id) == Some(&target.id))
            .cloned()
            .collect();

        if matches.is_empty() {
            return None;
        }
        let mut implicated = vec![candidate.clone()];
        implicated.extend(matches);
        Some(implicated)
    }

    fn describe(&self, implicated: &[ResolvedRecord]) -> String {
        let target = implicated
            .first()
            .and_then(|r| r.replaces.as_ref())
            .map(|r| r.name.clone())
            .unwrap_or_default();
        format!(
            "{} staged records replace the same '{}' '{}'",
            implicated.len(),
            self.type_friendly,
            target
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::chu_type;
    use crate::models::{Origin, PropertyValue, RecordRef};

    fn replacing(id: &str, target: Option<&str>) -> ResolvedRecord {
        ResolvedRecord {
            id: id.to_string(),
            name: PropertyValue::name(id),
            record_type: "c_community_health_unit".to_string(),
            lineage: vec![],
            unique_values: Default::default(),
            contact_id: None,
            origin: Origin::Local {
                staged_id: id.to_string(),
            },
            replaces: target.map(|t| RecordRef {
                id: t.to_string(),
                name: "Old Chu".to_string(),
            }),
        }
    }

    #[test]
    fn test_detects_shared_target() {
        let classifier = RedundantReplacementClassifier::new(&chu_type());
        let a = replacing("a", Some("old"));
        let rest = vec![replacing("b", Some("other")), replacing("c", Some("old"))];
        let implicated = classifier.detect(&a, &rest).unwrap();
        let ids: Vec<&str> = implicated.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(
            classifier.describe(&implicated),
            "2 staged records replace the same 'Community Health Unit' 'Old Chu'"
        );
    }

    #[test]
    fn test_no_replacement_no_collision() {
        let classifier = RedundantReplacementClassifier::new(&chu_type());
        let a = replacing("a", None);
        assert!(classifier.detect(&a, &[replacing("b", None)]).is_none());
    }
}
