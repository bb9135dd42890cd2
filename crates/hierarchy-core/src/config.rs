//! Contact-type hierarchy metadata.
//!
//! Every contact type that can be staged declares the ancestor levels it
//! sits under. Level 0 is the replacement pseudo-level (an existing record
//! of the same type that the staged record replaces in place); levels
//! `1..=N` are ancestors, increasing with distance.
//!
//! ```toml
//! [[contact_types]]
//! name = "c_community_health_unit"
//! friendly = "Community Health Unit"
//!
//! [[contact_types.hierarchy]]
//! level = 1
//! property_name = "SUBCOUNTY"
//! contact_type = "b_sub_county"
//! friendly_name = "Sub County"
//! required = true
//! fuzz_strip = ["sub county"]
//!
//! [[contact_types.place_properties]]
//! property_name = "name"
//! friendly_name = "Name"
//! unique = "parent"
//! ```

use anyhow::{bail, Result};
use serde::Deserialize;

/// Direction in which to walk a contact type's hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Nearest first: replacement (0), parent (1), grandparent (2), ...
    Ascending,
    /// Farthest ancestor first, replacement last.
    Descending,
}

/// One level of a contact type's hierarchy.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HierarchyLevel {
    pub level: usize,
    pub property_name: String,
    /// Record type expected at this level.
    pub contact_type: String,
    pub friendly_name: String,
    #[serde(default)]
    pub required: bool,
    /// Generic words dropped from names when fuzzy matching (e.g. "sub county").
    #[serde(default)]
    pub fuzz_strip: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UniqueScope {
    /// Unique across every record of the type.
    All,
    /// Unique among records sharing the same parent.
    Parent,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PlaceProperty {
    pub property_name: String,
    pub friendly_name: String,
    #[serde(default)]
    pub unique: Option<UniqueScope>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContactType {
    pub name: String,
    pub friendly: String,
    #[serde(default)]
    pub hierarchy: Vec<HierarchyLevel>,
    #[serde(default = "default_replacement_property")]
    pub replacement_property: String,
    #[serde(default)]
    pub fuzz_strip: Vec<String>,
    #[serde(default)]
    pub place_properties: Vec<PlaceProperty>,
}

fn default_replacement_property() -> String {
    "replacement".to_string()
}

impl ContactType {
    /// Deepest configured ancestor level.
    pub fn depth(&self) -> usize {
        self.hierarchy.iter().map(|h| h.level).max().unwrap_or(0)
    }

    /// The replacement pseudo-level for this type.
    pub fn replacement_level(&self) -> HierarchyLevel {
        HierarchyLevel {
            level: 0,
            property_name: self.replacement_property.clone(),
            contact_type: self.name.clone(),
            friendly_name: self.friendly.clone(),
            required: false,
            fuzz_strip: self.fuzz_strip.clone(),
        }
    }

    /// All ancestor levels plus the replacement level, in the given order.
    pub fn hierarchy_with_replacement(&self, order: Order) -> Vec<HierarchyLevel> {
        let mut levels = self.hierarchy.clone();
        levels.push(self.replacement_level());
        levels.sort_by_key(|h| h.level);
        if order == Order::Descending {
            levels.reverse();
        }
        levels
    }

    pub fn level(&self, level: usize) -> Option<HierarchyLevel> {
        if level == 0 {
            return Some(self.replacement_level());
        }
        self.hierarchy.iter().find(|h| h.level == level).cloned()
    }

    pub fn unique_properties(&self) -> impl Iterator<Item = (&PlaceProperty, UniqueScope)> {
        self.place_properties
            .iter()
            .filter_map(|p| p.unique.map(|scope| (p, scope)))
    }

    fn validate(&self) -> Result<()> {
        for (expected, level) in (1..).zip(self.hierarchy_with_replacement(Order::Ascending).iter().skip(1)) {
            if level.level != expected {
                bail!(
                    "contact type '{}': hierarchy levels must be contiguous from 1 (found level {} where {} was expected)",
                    self.name,
                    level.level,
                    expected
                );
            }
            if level.property_name == self.replacement_property {
                bail!(
                    "contact type '{}': property '{}' is used by both level {} and the replacement level",
                    self.name,
                    level.property_name,
                    level.level
                );
            }
        }
        Ok(())
    }
}

/// The set of contact types the resolver knows about.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HierarchyConfig {
    #[serde(default)]
    pub contact_types: Vec<ContactType>,
}

impl HierarchyConfig {
    pub fn new(contact_types: Vec<ContactType>) -> Result<Self> {
        let config = Self { contact_types };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for contact_type in &self.contact_types {
            contact_type.validate()?;
        }
        Ok(())
    }

    pub fn contact_type(&self, name: &str) -> Result<&ContactType> {
        match self.contact_types.iter().find(|c| c.name == name) {
            Some(c) => Ok(c),
            None => bail!("Unknown contact type: '{}'", name),
        }
    }

    /// Unique properties declared for a record type, or none when the type
    /// is only ever used as an ancestor.
    pub fn unique_property_names(&self, record_type: &str) -> Vec<String> {
        self.contact_types
            .iter()
            .find(|c| c.name == record_type)
            .map(|c| {
                c.unique_properties()
                    .map(|(p, _)| p.property_name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_hierarchy_orders() {
        let chu = deep_chu_type();
        let down: Vec<usize> = chu
            .hierarchy_with_replacement(Order::Descending)
            .iter()
            .map(|h| h.level)
            .collect();
        assert_eq!(down, vec![2, 1, 0]);

        let up: Vec<usize> = chu
            .hierarchy_with_replacement(Order::Ascending)
            .iter()
            .map(|h| h.level)
            .collect();
        assert_eq!(up, vec![0, 1, 2]);
        assert_eq!(chu.depth(), 2);
    }

    #[test]
    fn test_replacement_level_uses_own_type() {
        let chu = chu_type();
        let replacement = chu.level(0).unwrap();
        assert_eq!(replacement.contact_type, "c_community_health_unit");
        assert_eq!(replacement.property_name, "replacement");
        assert!(!replacement.required);
    }

    #[test]
    fn test_gap_in_levels_rejected() {
        let mut chu = deep_chu_type();
        chu.hierarchy.retain(|h| h.level != 1);
        let err = HierarchyConfig::new(vec![chu]).unwrap_err();
        assert!(err.to_string().contains("contiguous"));
    }

    #[test]
    fn test_unknown_contact_type() {
        let config = config();
        assert!(config.contact_type("nope").is_err());
        assert_eq!(
            config.unique_property_names("c_community_health_unit"),
            vec!["name".to_string(), "code".to_string()]
        );
        assert!(config.unique_property_names("b_sub_county").is_empty());
    }
}
