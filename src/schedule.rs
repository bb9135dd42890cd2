//! `hmgr schedule`: build a move, merge or delete job and enqueue it.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use hierarchy_core::cache::RemotePlaceCache;
use hierarchy_core::credential::CredentialIssuer;
use hierarchy_core::manage::{build_job, schedule, HierarchyAction, ManageForm, MUTATION_QUEUE};
use hierarchy_core::queue::{get_queue, JobStore};

use crate::config::Config;
use crate::platform::{open_session, HttpPlaceSource};
use crate::queue_sqlite::SqliteJobStore;

pub async fn run_schedule(
    config: &Config,
    action: HierarchyAction,
    contact_type_name: &str,
    source: Vec<(String, String)>,
    destination: Vec<(String, String)>,
) -> Result<()> {
    let hierarchy = Arc::new(config.hierarchy()?);
    let contact_type = hierarchy.contact_type(contact_type_name)?.clone();
    let issuer = CredentialIssuer::new(config.job_secret()?);

    let form = ManageForm {
        action,
        source: source.into_iter().collect::<BTreeMap<_, _>>(),
        destination: destination.into_iter().collect::<BTreeMap<_, _>>(),
    };

    let (client, session) = open_session(config).await?;
    let mut cache = RemotePlaceCache::new(
        Arc::new(HttpPlaceSource::new(client, &session)),
        hierarchy.clone(),
    );

    let job = build_job(
        &form,
        &contact_type,
        &session,
        &mut cache,
        &hierarchy,
        &issuer,
        Utc::now(),
    )
    .await?;

    let store = Arc::new(SqliteJobStore::open(config).await?);
    let queue = get_queue(store.clone() as Arc<dyn JobStore>, MUTATION_QUEUE).await?;
    let id = schedule(&job, &queue, Utc::now()).await?;
    store.close().await;

    println!("Scheduled job {}", id);
    println!("  name:   {}", job.name);
    println!("  queue:  {}", MUTATION_QUEUE);
    Ok(())
}
