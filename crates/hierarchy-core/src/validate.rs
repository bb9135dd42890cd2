//! Hierarchy validation.
//!
//! Turns unresolved, missing and ambiguous hierarchy levels into the
//! user-facing messages stored on [`StagedRecord::validation_errors`].
//! Errors are keyed `hierarchy_<property_name>`; other keys on the record
//! (from field validators) are left alone.

use crate::config::{ContactType, HierarchyLevel, Order};
use crate::models::{Resolution, StagedRecord};

const KEY_PREFIX: &str = "hierarchy_";

/// Recompute the hierarchy errors of `staged`.
pub fn validate_hierarchy(staged: &mut StagedRecord, contact_type: &ContactType) {
    staged
        .validation_errors
        .retain(|key, _| !key.starts_with(KEY_PREFIX));

    for level in contact_type.hierarchy_with_replacement(Order::Ascending) {
        if let Some(message) = level_error(staged, &level) {
            staged
                .validation_errors
                .insert(format!("{}{}", KEY_PREFIX, level.property_name), message);
        }
    }
}

fn level_error(staged: &StagedRecord, level: &HierarchyLevel) -> Option<String> {
    let input = match staged.hierarchy_input(&level.property_name) {
        Some(input) => input,
        None if level.required => {
            return Some(format!(
                "Required property '{}' is missing",
                level.friendly_name
            ))
        }
        None => return None,
    };

    match staged.resolved(level.level) {
        Some(Resolution::Found(_)) => None,
        Some(Resolution::Ambiguous(_)) => Some(format!(
            "Found multiple '{}' matching '{}'",
            level.friendly_name, input
        )),
        Some(Resolution::NotFound) | None => Some(format!(
            "Cannot find '{}' matching '{}'",
            level.friendly_name, input
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::chu_type;
    use crate::models::{Origin, PropertyValue, ResolvedRecord};

    fn found(id: &str) -> Resolution {
        Resolution::Found(ResolvedRecord {
            id: id.to_string(),
            name: PropertyValue::name(id),
            record_type: "b_sub_county".to_string(),
            lineage: vec![],
            unique_values: Default::default(),
            contact_id: None,
            origin: Origin::Remote,
            replaces: None,
        })
    }

    #[test]
    fn test_missing_required_level() {
        let chu = chu_type();
        let mut record = StagedRecord::new(&chu);
        validate_hierarchy(&mut record, &chu);
        assert_eq!(
            record.validation_errors["hierarchy_SUBCOUNTY"],
            "Required property 'Sub County' is missing"
        );
        // the replacement level is optional
        assert!(!record.validation_errors.contains_key("hierarchy_replacement"));
    }

    #[test]
    fn test_not_found_and_ambiguous_messages() {
        let chu = chu_type();
        let mut record = StagedRecord::new(&chu);
        record.set_hierarchy_property("SUBCOUNTY", "kitui");
        record.set_hierarchy_property("replacement", "old chu");
        record.resolved_hierarchy[1] = Some(Resolution::NotFound);
        record.resolved_hierarchy[0] = Some(Resolution::Ambiguous(vec![]));
        validate_hierarchy(&mut record, &chu);

        assert_eq!(
            record.validation_errors["hierarchy_SUBCOUNTY"],
            "Cannot find 'Sub County' matching 'kitui'"
        );
        assert_eq!(
            record.validation_errors["hierarchy_replacement"],
            "Found multiple 'Community Health Unit' matching 'old chu'"
        );
    }

    #[test]
    fn test_resolved_clears_previous_errors_only_for_hierarchy() {
        let chu = chu_type();
        let mut record = StagedRecord::new(&chu);
        record
            .validation_errors
            .insert("phone".to_string(), "Invalid phone".to_string());
        record.set_hierarchy_property("SUBCOUNTY", "kitui");
        validate_hierarchy(&mut record, &chu);
        assert!(record.validation_errors.contains_key("hierarchy_SUBCOUNTY"));

        record.resolved_hierarchy[1] = Some(found("sub-1"));
        validate_hierarchy(&mut record, &chu);
        assert!(!record.validation_errors.contains_key("hierarchy_SUBCOUNTY"));
        assert!(record.validation_errors.contains_key("phone"));
    }
}
