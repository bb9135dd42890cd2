//! Cache of authoritative places, bucketed by `(instance domain, record type)`.
//!
//! A bucket is filled on first [`RemotePlaceCache::get`] and then kept for
//! the lifetime of the cache object; nothing expires on its own. Callers own
//! the cache and pass it by `&mut` into resolution and warning scans, so two
//! sessions never share one by accident.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::config::HierarchyConfig;
use crate::models::{Origin, PropertyValue, ResolvedRecord};
use crate::session::Instance;

/// A parent reference as stored on platform documents (nested, nearest first).
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRef {
    pub id: String,
    pub parent: Option<Box<ParentRef>>,
}

impl ParentRef {
    /// Build a nested chain from ids given nearest first.
    pub fn chain(ids: &[&str]) -> Option<ParentRef> {
        ids.iter().rev().fold(None, |parent, id| {
            Some(ParentRef {
                id: id.to_string(),
                parent: parent.map(Box::new),
            })
        })
    }
}

/// A place document as fetched from the platform.
#[derive(Debug, Clone)]
pub struct PlatformPlace {
    pub id: String,
    pub name: String,
    pub record_type: String,
    pub contact_id: Option<String>,
    pub parent: Option<ParentRef>,
    /// Top-level string properties of the document.
    pub properties: BTreeMap<String, String>,
}

/// Fetches every place of one type from an instance.
#[async_trait]
pub trait PlaceSource: Send + Sync {
    async fn places_of_type(&self, instance: &Instance, record_type: &str)
        -> Result<Vec<PlatformPlace>>;
}

type BucketKey = (String, String);

pub struct RemotePlaceCache {
    source: Arc<dyn PlaceSource>,
    config: Arc<HierarchyConfig>,
    buckets: HashMap<BucketKey, Vec<ResolvedRecord>>,
}

impl RemotePlaceCache {
    pub fn new(source: Arc<dyn PlaceSource>, config: Arc<HierarchyConfig>) -> Self {
        Self {
            source,
            config,
            buckets: HashMap::new(),
        }
    }

    /// Cached places of a type, fetching the bucket on first use.
    pub async fn get(&mut self, instance: &Instance, record_type: &str) -> Result<&[ResolvedRecord]> {
        let key = bucket_key(instance, record_type);
        if !self.buckets.contains_key(&key) {
            let places = self.source.places_of_type(instance, record_type).await?;
            let unique = self.config.unique_property_names(record_type);
            let records: Vec<ResolvedRecord> =
                places.iter().map(|p| to_resolved(p, &unique)).collect();
            debug!(
                domain = instance.domain(),
                record_type,
                count = records.len(),
                "cached remote places"
            );
            self.buckets.insert(key.clone(), records);
        }
        Ok(self.buckets.get(&key).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Whether a bucket has been fetched.
    pub fn contains(&self, instance: &Instance, record_type: &str) -> bool {
        self.buckets.contains_key(&bucket_key(instance, record_type))
    }

    /// Append a freshly created record to its bucket. A bucket that has not
    /// been fetched stays unfetched.
    pub fn insert_locally_created(&mut self, instance: &Instance, record: ResolvedRecord) -> bool {
        match self.buckets.get_mut(&bucket_key(instance, &record.record_type)) {
            Some(bucket) => {
                bucket.push(ResolvedRecord {
                    origin: Origin::Remote,
                    ..record
                });
                true
            }
            None => false,
        }
    }

    /// Drop one bucket, every bucket of an instance, or everything.
    pub fn invalidate(&mut self, instance: Option<&Instance>, record_type: Option<&str>) {
        match (instance, record_type) {
            (Some(instance), Some(record_type)) => {
                self.buckets.remove(&bucket_key(instance, record_type));
            }
            (Some(instance), None) => {
                let domain = instance.domain();
                self.buckets.retain(|(d, _), _| d != domain);
            }
            (None, _) => self.buckets.clear(),
        }
    }
}

fn bucket_key(instance: &Instance, record_type: &str) -> BucketKey {
    (instance.domain().to_string(), record_type.to_string())
}

fn to_resolved(place: &PlatformPlace, unique_properties: &[String]) -> ResolvedRecord {
    let mut lineage = Vec::new();
    let mut parent = place.parent.as_ref();
    while let Some(p) = parent {
        lineage.push(Some(p.id.clone()));
        parent = p.parent.as_deref();
    }

    let unique_values = unique_properties
        .iter()
        .filter_map(|name| {
            let value = if name == "name" {
                Some(PropertyValue::name(&place.name).formatted)
            } else {
                place.properties.get(name).cloned()
            };
            value
                .filter(|v| !v.is_empty())
                .map(|v| (name.clone(), v))
        })
        .collect();

    ResolvedRecord {
        id: place.id.clone(),
        name: PropertyValue::name(&place.name),
        record_type: place.record_type.clone(),
        lineage,
        unique_values,
        contact_id: place.contact_id.clone(),
        origin: Origin::Remote,
        replaces: None,
    }
}
