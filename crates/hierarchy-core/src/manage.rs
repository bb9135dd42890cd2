//! Move, merge and delete jobs.
//!
//! [`build_job`] turns a [`ManageForm`] (raw hierarchy inputs for a source
//! place and, except for deletes, a destination) into a [`ScheduledJob`].
//! Both sides are resolved as synthetic staged records with fuzzy matching,
//! run through [`validate_hierarchy`], and checked against the rules of the
//! action. Anything illegal is a [`ManageError`] and nothing is enqueued.
//!
//! | Action | Source needs | Destination needs | Rejected when |
//! |--------|--------------|-------------------|---------------|
//! | move | level 0 | level 1 | destination is already the parent |
//! | merge | level 0 | level 0 | source and destination are the same |
//! | delete | level 0 | - | - |

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cache::RemotePlaceCache;
use crate::config::{ContactType, HierarchyConfig};
use crate::credential::CredentialIssuer;
use crate::models::{Resolution, ResolvedRecord, StagedRecord};
use crate::queue::{JobOptions, NamedQueue};
use crate::resolver::{resolve, ResolveOptions};
use crate::session::Session;
use crate::validate::validate_hierarchy;

/// Queue the mutation worker consumes.
pub const MUTATION_QUEUE: &str = "hierarchy-mutations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HierarchyAction {
    Move,
    Merge,
    Delete,
}

impl HierarchyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HierarchyAction::Move => "move",
            HierarchyAction::Merge => "merge",
            HierarchyAction::Delete => "delete",
        }
    }

    /// Action name understood by the configuration tool.
    pub fn cli_name(&self) -> &'static str {
        match self {
            HierarchyAction::Move => "move-contacts",
            HierarchyAction::Merge => "merge-contacts",
            HierarchyAction::Delete => "delete-contacts",
        }
    }
}

/// Raw hierarchy inputs keyed by property name (`replacement`, `SUBCOUNTY`, ...).
#[derive(Debug, Clone)]
pub struct ManageForm {
    pub action: HierarchyAction,
    pub source: BTreeMap<String, String>,
    pub destination: BTreeMap<String, String>,
}

/// Payload persisted with a mutation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub action: HierarchyAction,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    pub instance_url: String,
    /// Signed credential from [`CredentialIssuer::issue`], not the raw token.
    pub session_token: String,
    pub job_name: String,
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub data: JobData,
}

#[derive(Debug, Error)]
pub enum ManageError {
    /// Hierarchy inputs that do not resolve; the joined validation messages.
    #[error("{0}")]
    Invalid(String),
    #[error("Place \"{place}\" already has \"{parent}\" as parent")]
    AlreadyParent { place: String, parent: String },
    #[error("Cannot merge \"{name}\" with self")]
    SelfMerge { name: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Resolve and check a move, merge or delete request.
pub async fn build_job(
    form: &ManageForm,
    contact_type: &ContactType,
    session: &Session,
    cache: &mut RemotePlaceCache,
    config: &HierarchyConfig,
    issuer: &CredentialIssuer,
    now: DateTime<Utc>,
) -> Result<ScheduledJob, ManageError> {
    let options = ResolveOptions { fuzz: true };
    let mut errors = Vec::new();

    let mut source = synthetic_record(contact_type, &form.source, None);
    resolve(&mut source, &[], session, cache, config, options).await?;
    validate_hierarchy(&mut source, contact_type);
    errors.extend(source.validation_errors.values().cloned());
    require_found(&source, contact_type, 0, &mut errors);

    let destination = match form.action {
        HierarchyAction::Delete => None,
        action => {
            // a move destination names the new parent, never a place of the type itself
            let skip = (action == HierarchyAction::Move)
                .then_some(contact_type.replacement_property.as_str());
            let mut destination = synthetic_record(contact_type, &form.destination, skip);
            resolve(&mut destination, &[], session, cache, config, options).await?;
            validate_hierarchy(&mut destination, contact_type);
            errors.extend(destination.validation_errors.values().cloned());
            let needed = if action == HierarchyAction::Move { 1 } else { 0 };
            require_found(&destination, contact_type, needed, &mut errors);
            Some(destination)
        }
    };

    if !errors.is_empty() {
        errors.dedup();
        return Err(ManageError::Invalid(errors.join(", ")));
    }

    let source_place = found(&source, 0)?;
    let (destination_id, destination_name) = match (form.action, &destination) {
        (HierarchyAction::Move, Some(destination)) => {
            let parent = found(destination, 1)?;
            if source_place.parent_id() == Some(parent.id.as_str()) {
                return Err(ManageError::AlreadyParent {
                    place: source_place.name.formatted.clone(),
                    parent: parent.name.formatted.clone(),
                });
            }
            (Some(parent.id.clone()), Some(describe(destination, 1)))
        }
        (HierarchyAction::Merge, Some(destination)) => {
            let target = found(destination, 0)?;
            if target.id == source_place.id {
                return Err(ManageError::SelfMerge {
                    name: source_place.name.formatted.clone(),
                });
            }
            (Some(target.id.clone()), Some(describe(destination, 0)))
        }
        _ => (None, None),
    };

    let source_name = describe(&source, 0);
    let name = match destination_name {
        Some(destination_name) => format!(
            "{}_[{}]_to_[{}]",
            form.action.as_str(),
            source_name,
            destination_name
        ),
        None => format!("{}_[{}]", form.action.as_str(), source_name),
    };

    Ok(ScheduledJob {
        data: JobData {
            action: form.action,
            source_id: source_place.id.clone(),
            destination_id,
            instance_url: session.instance.url.clone(),
            session_token: issuer.issue(&session.token, now),
            job_name: name.clone(),
        },
        name,
    })
}

/// Enqueue a built job; returns the job id.
pub async fn schedule(
    job: &ScheduledJob,
    queue: &NamedQueue,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let data = serde_json::to_value(&job.data).context("Failed to serialize job data")?;
    let id = queue
        .add_job(&job.name, &data, &JobOptions::default(), now)
        .await?;
    info!(job_id = %id, job_name = %job.name, queue = queue.name(), "scheduled mutation job");
    Ok(id)
}

fn synthetic_record(
    contact_type: &ContactType,
    inputs: &BTreeMap<String, String>,
    skip: Option<&str>,
) -> StagedRecord {
    let mut record = StagedRecord::new(contact_type);
    for (property, value) in inputs {
        if Some(property.as_str()) != skip {
            record.set_hierarchy_property(property, value);
        }
    }
    record
}

/// Add a "missing" message when `level` has no input at all; other failures
/// are already covered by the validator.
fn require_found(
    record: &StagedRecord,
    contact_type: &ContactType,
    level: usize,
    errors: &mut Vec<String>,
) {
    let Some(level) = contact_type.level(level) else {
        return;
    };
    if record.hierarchy_input(&level.property_name).is_none() && !level.required {
        errors.push(format!(
            "Required property '{}' is missing",
            level.friendly_name
        ));
    }
}

fn found(record: &StagedRecord, level: usize) -> Result<&ResolvedRecord, ManageError> {
    match record.resolved(level) {
        Some(Resolution::Found(place)) => Ok(place),
        _ => Err(ManageError::Other(anyhow::anyhow!(
            "hierarchy level {} is not resolved",
            level
        ))),
    }
}

/// Formatted names of the resolved levels from `from` upwards, farthest
/// ancestor first, joined by `.`.
fn describe(record: &StagedRecord, from: usize) -> String {
    record
        .resolved_hierarchy
        .iter()
        .skip(from)
        .rev()
        .filter_map(|r| r.as_ref().and_then(Resolution::found))
        .map(|place| place.name.formatted.clone())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fixtures::{place, StaticSource};
    use crate::config::fixtures::chu_type;
    use crate::queue::memory::InMemoryJobStore;
    use crate::queue::{get_queue, JobStatus};
    use crate::session::Instance;
    use chrono::TimeZone;
    use std::sync::Arc;

    struct Fixture {
        config: Arc<HierarchyConfig>,
        cache: RemotePlaceCache,
        session: Session,
        issuer: CredentialIssuer,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(HierarchyConfig::new(vec![chu_type()]).unwrap());
        let source = StaticSource::new(vec![
            place("from-chu-id", "c-h-u", "c_community_health_unit", &["from-sub"]),
            place("other-chu", "Other", "c_community_health_unit", &["to-sub"]),
            place("from-sub", "From Sub", "b_sub_county", &[]),
            place("to-sub", "To Sub", "b_sub_county", &[]),
        ]);
        Fixture {
            cache: RemotePlaceCache::new(source, config.clone()),
            config,
            session: Session {
                instance: Instance::new("https://kenya.example.org/"),
                username: "admin".to_string(),
                token: "AuthSession=secret".to_string(),
                facility_ids: vec![],
                is_admin: true,
            },
            issuer: CredentialIssuer::new("job-secret"),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn form(action: HierarchyAction, source: &[(&str, &str)], destination: &[(&str, &str)]) -> ManageForm {
        let map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        ManageForm {
            action,
            source: map(source),
            destination: map(destination),
        }
    }

    async fn build(f: &mut Fixture, form: &ManageForm) -> Result<ScheduledJob, ManageError> {
        let chu = chu_type();
        build_job(form, &chu, &f.session, &mut f.cache, &f.config, &f.issuer, now()).await
    }

    #[tokio::test]
    async fn test_move_job_payload_and_name() {
        let mut f = fixture();
        let job = build(
            &mut f,
            &form(
                HierarchyAction::Move,
                &[("replacement", "C-H-U"), ("SUBCOUNTY", "from sub")],
                &[("SUBCOUNTY", "to sub")],
            ),
        )
        .await
        .unwrap();

        assert_eq!(job.name, "move_[From Sub.C-h-u]_to_[To Sub]");
        assert_eq!(job.data.action, HierarchyAction::Move);
        assert_eq!(job.data.source_id, "from-chu-id");
        assert_eq!(job.data.destination_id.as_deref(), Some("to-sub"));
        assert_eq!(job.data.instance_url, "https://kenya.example.org");
        assert_eq!(
            f.issuer.decode(&job.data.session_token, now()).unwrap(),
            "AuthSession=secret"
        );

        let json = serde_json::to_value(&job.data).unwrap();
        assert_eq!(json["action"], "move");
        assert_eq!(json["sourceId"], "from-chu-id");
        assert_eq!(json["destinationId"], "to-sub");
        assert_eq!(json["jobName"], "move_[From Sub.C-h-u]_to_[To Sub]");
    }

    #[tokio::test]
    async fn test_move_to_current_parent_rejected() {
        let mut f = fixture();
        let err = build(
            &mut f,
            &form(
                HierarchyAction::Move,
                &[("replacement", "c-h-u"), ("SUBCOUNTY", "From Sub")],
                &[("SUBCOUNTY", "from sub")],
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Place \"C-h-u\" already has \"From Sub\" as parent"
        );
    }

    #[tokio::test]
    async fn test_merge_with_self_rejected() {
        let mut f = fixture();
        let side = [("replacement", "c-h-u"), ("SUBCOUNTY", "from sub")];
        let err = build(&mut f, &form(HierarchyAction::Merge, &side, &side))
            .await
            .unwrap_err();
        assert!(matches!(err, ManageError::SelfMerge { .. }));
        assert_eq!(err.to_string(), "Cannot merge \"C-h-u\" with self");
    }

    #[tokio::test]
    async fn test_merge_names_both_sides() {
        let mut f = fixture();
        let job = build(
            &mut f,
            &form(
                HierarchyAction::Merge,
                &[("replacement", "c-h-u"), ("SUBCOUNTY", "from sub")],
                &[("replacement", "other"), ("SUBCOUNTY", "to sub")],
            ),
        )
        .await
        .unwrap();
        assert_eq!(job.name, "merge_[From Sub.C-h-u]_to_[To Sub.Other]");
        assert_eq!(job.data.destination_id.as_deref(), Some("other-chu"));
    }

    #[tokio::test]
    async fn test_delete_has_no_destination() {
        let mut f = fixture();
        let job = build(
            &mut f,
            &form(
                HierarchyAction::Delete,
                &[("replacement", "c-h-u"), ("SUBCOUNTY", "from sub")],
                &[],
            ),
        )
        .await
        .unwrap();
        assert_eq!(job.name, "delete_[From Sub.C-h-u]");
        assert!(job.data.destination_id.is_none());
        let json = serde_json::to_value(&job.data).unwrap();
        assert!(json.get("destinationId").is_none());
    }

    #[tokio::test]
    async fn test_unresolved_source_rejected_with_validation_text() {
        let mut f = fixture();
        let err = build(
            &mut f,
            &form(
                HierarchyAction::Delete,
                &[("replacement", "nowhere"), ("SUBCOUNTY", "from sub")],
                &[],
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot find 'Community Health Unit' matching 'nowhere'"
        );
    }

    #[tokio::test]
    async fn test_missing_source_place_rejected() {
        let mut f = fixture();
        let err = build(
            &mut f,
            &form(HierarchyAction::Delete, &[("SUBCOUNTY", "from sub")], &[]),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Required property 'Community Health Unit' is missing"
        );
    }

    #[tokio::test]
    async fn test_schedule_enqueues_job_data() {
        let mut f = fixture();
        let job = build(
            &mut f,
            &form(
                HierarchyAction::Delete,
                &[("replacement", "c-h-u"), ("SUBCOUNTY", "from sub")],
                &[],
            ),
        )
        .await
        .unwrap();

        let store = Arc::new(InMemoryJobStore::new());
        let queue = get_queue(store, MUTATION_QUEUE).await.unwrap();
        let id = schedule(&job, &queue, now()).await.unwrap();

        let jobs = queue.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert_eq!(jobs[0].status, JobStatus::Queued);
        assert_eq!(jobs[0].name, "delete_[From Sub.C-h-u]");
        let data: JobData = serde_json::from_value(jobs[0].data.clone()).unwrap();
        assert_eq!(data, job.data);
    }
}
