//! `hmgr check`: resolve, validate and scan a batch of staged places.
//!
//! Input is a JSON array of objects, one per place. Keys naming a hierarchy
//! property of the contact type (`SUBCOUNTY`, `replacement`, ...) are
//! hierarchy inputs; every other string value is a place property.
//!
//! ```json
//! [
//!   { "name": "Kitui East", "code": "1001", "SUBCOUNTY": "Kitui" },
//!   { "name": "Mwingi", "SUBCOUNTY": "Mwingi Sub County", "replacement": "old mwingi" }
//! ]
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use hierarchy_core::cache::RemotePlaceCache;
use hierarchy_core::config::{ContactType, HierarchyConfig, Order};
use hierarchy_core::models::{Resolution, StagedRecord};
use hierarchy_core::resolver::{resolve_all, ResolveOptions};
use hierarchy_core::session::Session;
use hierarchy_core::validate::validate_hierarchy;
use hierarchy_core::warnings;

use crate::config::Config;
use crate::platform::{open_session, HttpPlaceSource};

/// Staged records from a JSON array of property maps.
pub fn load_staged(json: &str, contact_type: &ContactType) -> Result<Vec<StagedRecord>> {
    let value: Value = serde_json::from_str(json).context("Failed to parse staged records")?;
    let rows = match value.as_array() {
        Some(rows) => rows,
        None => bail!("Staged records must be a JSON array of objects"),
    };

    let hierarchy_properties: Vec<String> = contact_type
        .hierarchy_with_replacement(Order::Ascending)
        .into_iter()
        .map(|level| level.property_name)
        .collect();

    let mut records = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let fields = row
            .as_object()
            .with_context(|| format!("Staged record {} is not an object", index + 1))?;
        let mut record = StagedRecord::new(contact_type);
        for (key, value) in fields {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if hierarchy_properties.contains(key) {
                record.set_hierarchy_property(key, &text);
            } else {
                record.set_property(key, &text);
            }
        }
        records.push(record);
    }
    Ok(records)
}

/// Resolve every record against the others and the platform, validate the
/// hierarchy of each, and rebuild warnings.
pub async fn check_records(
    records: &mut [StagedRecord],
    contact_type: &ContactType,
    session: &Session,
    cache: &mut RemotePlaceCache,
    config: &HierarchyConfig,
    options: ResolveOptions,
) -> Result<()> {
    resolve_all(records, session, cache, config, options).await?;
    for record in records.iter_mut() {
        validate_hierarchy(record, contact_type);
    }

    let authoritative = cache.get(&session.instance, &contact_type.name).await?;
    warnings::scan(contact_type, authoritative, records);
    Ok(())
}

pub async fn run_check(config: &Config, path: &Path, contact_type_name: &str) -> Result<()> {
    let hierarchy = Arc::new(config.hierarchy()?);
    let contact_type = hierarchy.contact_type(contact_type_name)?.clone();

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut records = load_staged(&json, &contact_type)?;

    let (client, session) = open_session(config).await?;
    let source = Arc::new(HttpPlaceSource::new(client, &session));
    let mut cache = RemotePlaceCache::new(source, hierarchy.clone());
    let options = ResolveOptions {
        fuzz: config.resolver.fuzz,
    };

    check_records(
        &mut records,
        &contact_type,
        &session,
        &mut cache,
        &hierarchy,
        options,
    )
    .await?;

    print_report(&records, &contact_type);
    Ok(())
}

fn print_report(records: &[StagedRecord], contact_type: &ContactType) {
    let mut invalid = 0;
    let mut warned = 0;

    for (i, record) in records.iter().enumerate() {
        println!(
            "[{}] {} ({})",
            i + 1,
            record.name().formatted,
            contact_type.friendly
        );
        for level in contact_type.hierarchy_with_replacement(Order::Descending) {
            let input = match record.hierarchy_input(&level.property_name) {
                Some(input) => input,
                None => continue,
            };
            let outcome = match record.resolved(level.level) {
                Some(Resolution::Found(place)) => {
                    format!("{} ({})", place.name.formatted, place.id)
                }
                Some(Resolution::Ambiguous(candidates)) => {
                    format!("ambiguous, {} candidates", candidates.len())
                }
                Some(Resolution::NotFound) | None => "not found".to_string(),
            };
            println!("    {}: {} -> {}", level.friendly_name, input, outcome);
        }
        for error in record.validation_errors.values() {
            println!("    error: {}", error);
        }
        for warning in &record.warnings {
            println!("    warning: {}", warning);
        }
        if !record.is_valid() {
            invalid += 1;
        }
        if !record.warnings.is_empty() {
            warned += 1;
        }
    }

    println!();
    println!(
        "{} records: {} valid, {} with errors, {} with warnings",
        records.len(),
        records.len() - invalid,
        invalid,
        warned
    );
}
