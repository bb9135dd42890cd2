//! Hierarchy resolution.
//!
//! Turns the raw hierarchy strings of a [`StagedRecord`] into concrete
//! records, one [`Resolution`] per level.
//!
//! # Algorithm
//!
//! 1. Walk the levels farthest ancestor first, replacement last.
//! 2. At each level, clear the previous result and skip empty input.
//! 3. Gather candidates whose name matches the input: other staged records
//!    of the level's type (ancestor levels only), and cached authoritative
//!    records the session may see that sit under every farther level
//!    resolved so far.
//! 4. Index candidates by lowercased name (and, with fuzz, by
//!    [`fuzz_key`]); different ids on one key collapse into
//!    [`Resolution::Ambiguous`].
//! 5. Pick the raw lookup, or the fuzzy one when only it is `Found`.
//! 6. [`disambiguate`]: a second pass that uses concretely resolved farther
//!    levels to collapse ambiguities found on the way down.
//!
//! Unresolved data is never an error. Errors come only from configuration
//! (unknown contact type) or from fetching authoritative places.

use std::collections::HashMap;

use anyhow::Result;
use tracing::trace;

use crate::cache::RemotePlaceCache;
use crate::config::{HierarchyConfig, HierarchyLevel, Order};
use crate::models::{Resolution, ResolvedRecord, StagedRecord};
use crate::normalize::{fuzz_key, raw_key};
use crate::session::Session;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Also match on cleaned names (generic words stripped, punctuation and
    /// diacritics ignored).
    pub fuzz: bool,
}

/// Resolve every hierarchy level of `staged`.
///
/// `local_pool` holds the other staged records (see
/// [`StagedRecord::as_resolved`]) that may serve as ancestors before they
/// exist on the platform.
pub async fn resolve(
    staged: &mut StagedRecord,
    local_pool: &[ResolvedRecord],
    session: &Session,
    cache: &mut RemotePlaceCache,
    config: &HierarchyConfig,
    options: ResolveOptions,
) -> Result<()> {
    let contact_type = config.contact_type(&staged.contact_type)?;
    let top_down = contact_type.hierarchy_with_replacement(Order::Descending);
    staged
        .resolved_hierarchy
        .resize(contact_type.depth() + 1, None);

    for level in &top_down {
        staged.resolved_hierarchy[level.level] = None;
        let input = match staged.hierarchy_input(&level.property_name) {
            Some(input) => input.to_string(),
            None => continue,
        };

        let mut candidates = CandidateMap::new(&input, level, options.fuzz);

        if level.level > 0 {
            for record in local_pool
                .iter()
                .filter(|r| r.record_type == level.contact_type && r.id != staged.id)
            {
                candidates.offer(record);
            }
        }

        let remote = cache.get(&session.instance, &level.contact_type).await?;
        for record in remote
            .iter()
            .filter(|r| session.is_authorized(r))
            .filter(|r| within_resolved_ancestors(r, level.level, &staged.resolved_hierarchy))
        {
            candidates.offer(record);
        }

        let picked = candidates.pick();
        trace!(level = level.level, input = %input, ?picked, "resolved level");
        staged.resolved_hierarchy[level.level] = Some(picked);
    }

    disambiguate(&mut staged.resolved_hierarchy);
    Ok(())
}

/// Resolve every staged record of `contact_type`, in order, each against the
/// others as they stand at that moment.
pub async fn resolve_all(
    records: &mut [StagedRecord],
    session: &Session,
    cache: &mut RemotePlaceCache,
    config: &HierarchyConfig,
    options: ResolveOptions,
) -> Result<()> {
    for index in 0..records.len() {
        let pool = local_pool(records, config);
        resolve(&mut records[index], &pool, session, cache, config, options).await?;
    }
    Ok(())
}

/// Every staged record as a candidate, skipping types the config does not know.
pub fn local_pool(records: &[StagedRecord], config: &HierarchyConfig) -> Vec<ResolvedRecord> {
    records
        .iter()
        .filter_map(|r| {
            config
                .contact_type(&r.contact_type)
                .ok()
                .map(|ct| r.as_resolved(ct))
        })
        .collect()
}

/// Whether `record`, a candidate for `level`, lies under every farther level
/// resolved so far. An unresolved farther level does not constrain; a
/// `NotFound` one admits nothing.
fn within_resolved_ancestors(
    record: &ResolvedRecord,
    level: usize,
    resolved: &[Option<Resolution>],
) -> bool {
    resolved
        .iter()
        .enumerate()
        .skip(level + 1)
        .all(|(farther, resolution)| match resolution {
            None => true,
            Some(resolution) => {
                let admitted = resolution.admitted_ids();
                record
                    .lineage_at(farther - level - 1)
                    .map(|id| admitted.contains(&id))
                    .unwrap_or(false)
            }
        })
}

/// Collapse ambiguities using farther levels that resolved to one record.
///
/// For each ambiguous level, nearest first, the first farther `Found` level
/// that admits exactly one candidate (by lineage) decides it. Repeats until
/// nothing changes, so a level settled late can still settle a nearer one;
/// running this twice is the same as running it once.
pub fn disambiguate(resolved: &mut [Option<Resolution>]) {
    loop {
        let mut changed = false;
        for level in 0..resolved.len() {
            let candidates = match &resolved[level] {
                Some(Resolution::Ambiguous(candidates)) => candidates,
                _ => continue,
            };

            let mut chosen = None;
            for farther in level + 1..resolved.len() {
                let anchor = match &resolved[farther] {
                    Some(Resolution::Found(anchor)) => anchor,
                    _ => continue,
                };
                let offset = farther - level - 1;
                let matching: Vec<&ResolvedRecord> = candidates
                    .iter()
                    .filter(|c| c.lineage_at(offset) == Some(anchor.id.as_str()))
                    .collect();
                if matching.len() == 1 {
                    chosen = Some(matching[0].clone());
                    break;
                }
            }

            if let Some(record) = chosen {
                resolved[level] = Some(Resolution::Found(record));
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Name-keyed candidates for one level.
struct CandidateMap<'a> {
    level: &'a HierarchyLevel,
    fuzz: bool,
    raw_lookup: String,
    fuzz_lookup: String,
    slots: HashMap<String, Resolution>,
}

impl<'a> CandidateMap<'a> {
    fn new(input: &str, level: &'a HierarchyLevel, fuzz: bool) -> Self {
        Self {
            level,
            fuzz,
            raw_lookup: raw_key(input),
            fuzz_lookup: fuzz_key(input, &level.fuzz_strip),
            slots: HashMap::new(),
        }
    }

    fn keys_for(&self, record: &ResolvedRecord) -> Vec<String> {
        let mut keys = vec![raw_key(&record.name.original)];
        if self.fuzz {
            let fuzzed = fuzz_key(&record.name.original, &self.level.fuzz_strip);
            if !keys.contains(&fuzzed) {
                keys.push(fuzzed);
            }
        }
        keys
    }

    /// Index `record` under each of its keys that a lookup will consult.
    fn offer(&mut self, record: &ResolvedRecord) {
        for key in self.keys_for(record) {
            let wanted = key == self.raw_lookup || (self.fuzz && key == self.fuzz_lookup);
            if !wanted || key.is_empty() {
                continue;
            }
            match self.slots.get_mut(&key) {
                None => {
                    self.slots.insert(key, Resolution::Found(record.clone()));
                }
                Some(slot) => merge_into(slot, record),
            }
        }
    }

    /// Raw match first; with fuzz, a `Found` fuzzy match wins over a raw
    /// match that is missing or ambiguous. Otherwise the raw result, then the
    /// fuzzy one, then `NotFound`.
    fn pick(&self) -> Resolution {
        let raw = self.slots.get(&self.raw_lookup);
        if !self.fuzz {
            return raw.cloned().unwrap_or(Resolution::NotFound);
        }
        let fuzzy = self.slots.get(&self.fuzz_lookup);
        if let Some(r) = raw.filter(|r| r.is_found()) {
            return r.clone();
        }
        if let Some(f) = fuzzy.filter(|f| f.is_found()) {
            return f.clone();
        }
        raw.or(fuzzy).cloned().unwrap_or(Resolution::NotFound)
    }
}

/// A second distinct id on one key turns the slot into an ambiguity.
fn merge_into(slot: &mut Resolution, record: &ResolvedRecord) {
    match slot {
        Resolution::Found(existing) if existing.id == record.id => {}
        Resolution::Found(existing) => {
            let existing = existing.clone();
            *slot = Resolution::Ambiguous(vec![existing, record.clone()]);
        }
        Resolution::Ambiguous(candidates) => {
            if !candidates.iter().any(|c| c.id == record.id) {
                candidates.push(record.clone());
            }
        }
        Resolution::NotFound => {}
    }
}
