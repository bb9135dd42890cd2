//! HTTP access to a platform instance.
//!
//! - [`PlatformClient::login`] opens a cookie session and reads the user's
//!   roles and facility.
//! - [`HttpPlaceSource`] implements [`PlaceSource`] over the
//!   `contacts_by_type` view, feeding the remote place cache.
//! - [`HttpHealthProbe`] implements [`HealthProbe`] over the monitoring
//!   endpoint, deciding whether the worker may run a job now.
//!
//! Reads retry on 429 and 5xx with exponential backoff (1s, 2s, 4s, ...);
//! other 4xx responses fail immediately. The health probe never retries:
//! one failed check is enough to postpone.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use hierarchy_core::cache::{ParentRef, PlaceSource, PlatformPlace};
use hierarchy_core::session::{Instance, Session};

use crate::config::{Config, InstanceConfig};
use crate::worker::{HealthProbe, HealthVerdict};

/// Sentinel backlog above which the instance is considered too busy.
pub const BACKLOG_THRESHOLD: u64 = 7000;

/// Roles that see every place regardless of facility.
const ADMIN_ROLES: &[&str] = &["_admin", "national_admin"];

/// Document fields that are structure rather than place properties.
const STRUCTURAL_FIELDS: &[&str] = &[
    "_id",
    "_rev",
    "name",
    "type",
    "contact_type",
    "parent",
    "contact",
];

#[derive(Clone)]
pub struct PlatformClient {
    client: reqwest::Client,
    max_retries: u32,
}

impl PlatformClient {
    pub fn new(timeout_secs: u64, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries,
        })
    }

    pub fn from_config(config: &InstanceConfig) -> Result<Self> {
        Self::new(config.timeout_secs, config.max_retries)
    }

    /// GET `url` with the session cookie, retrying transient failures.
    async fn get_json(&self, url: &str, query: &[(&str, String)], token: &str) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .get(url)
                .query(query)
                .header(COOKIE, session_cookie(token))
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        last_err = Some(anyhow!("Platform error {} from {}: {}", status, url, body_text));
                        continue;
                    }
                    bail!("Platform error {} from {}: {}", status, url, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Request to {} failed after retries", url)))
    }

    /// Log in and build a [`Session`] for `username`.
    pub async fn login(&self, instance: &Instance, username: &str, password: &str) -> Result<Session> {
        let url = format!("{}/_session", instance.url);
        let response = self
            .client
            .post(&url)
            .form(&[("name", username), ("password", password)])
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", instance.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Login as '{}' failed: {}", username, status);
        }

        let token = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(auth_session_value)
            .ok_or_else(|| anyhow!("Login response carried no AuthSession cookie"))?;

        let session_info = self.get_json(&url, &[], &token).await?;
        let roles: Vec<String> = session_info["userCtx"]["roles"]
            .as_array()
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(|r| r.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let is_admin = roles.iter().any(|r| ADMIN_ROLES.contains(&r.as_str()));

        let facility_ids = if is_admin {
            Vec::new()
        } else {
            let settings_url = format!("{}/medic/org.couchdb.user:{}", instance.url, username);
            let settings = self.get_json(&settings_url, &[], &token).await?;
            facility_ids(&settings["facility_id"])
        };

        debug!(username, is_admin, facilities = facility_ids.len(), "logged in");
        Ok(Session {
            instance: instance.clone(),
            username: username.to_string(),
            token,
            facility_ids,
            is_admin,
        })
    }
}

/// Log in with the configured credentials.
pub async fn open_session(config: &Config) -> Result<(PlatformClient, Session)> {
    let client = PlatformClient::from_config(&config.instance)?;
    let instance = Instance::new(&config.instance.url);
    let session = client
        .login(&instance, &config.instance.username, config.password()?)
        .await?;
    Ok((client, session))
}

fn session_cookie(token: &str) -> String {
    format!("AuthSession={}", token)
}

/// The value of an `AuthSession` cookie from one `Set-Cookie` header.
fn auth_session_value(header: &str) -> Option<String> {
    header
        .split(';')
        .next()
        .and_then(|pair| pair.trim().strip_prefix("AuthSession="))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn facility_ids(value: &Value) -> Vec<String> {
    match value {
        Value::String(id) => vec![id.clone()],
        Value::Array(ids) => ids
            .iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// [`PlaceSource`] reading the platform's `contacts_by_type` view.
pub struct HttpPlaceSource {
    client: PlatformClient,
    token: String,
}

impl HttpPlaceSource {
    pub fn new(client: PlatformClient, session: &Session) -> Self {
        Self {
            client,
            token: session.token.clone(),
        }
    }
}

#[async_trait]
impl PlaceSource for HttpPlaceSource {
    async fn places_of_type(
        &self,
        instance: &Instance,
        record_type: &str,
    ) -> Result<Vec<PlatformPlace>> {
        let url = format!(
            "{}/medic/_design/medic-client/_view/contacts_by_type",
            instance.url
        );
        let query = [
            ("key", serde_json::to_string(&[record_type])?),
            ("include_docs", "true".to_string()),
        ];
        let json = self.client.get_json(&url, &query, &self.token).await?;
        parse_view_rows(&json)
    }
}

/// Place documents from a view response; rows without a document are skipped.
pub fn parse_view_rows(json: &Value) -> Result<Vec<PlatformPlace>> {
    let rows = json
        .get("rows")
        .and_then(|r| r.as_array())
        .ok_or_else(|| anyhow!("Invalid view response: missing rows array"))?;
    Ok(rows.iter().filter_map(|row| parse_place(&row["doc"])).collect())
}

fn parse_place(doc: &Value) -> Option<PlatformPlace> {
    let id = doc.get("_id")?.as_str()?.to_string();
    let record_type = match doc.get("type").and_then(Value::as_str) {
        Some("contact") | None => doc.get("contact_type").and_then(Value::as_str)?,
        Some(other) => other,
    }
    .to_string();

    let contact_id = match doc.get("contact") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(contact) => contact.get("_id").and_then(Value::as_str).map(str::to_string),
        None => None,
    };

    let properties: BTreeMap<String, String> = doc
        .as_object()
        .map(|fields| {
            fields
                .iter()
                .filter(|(key, _)| !STRUCTURAL_FIELDS.contains(&key.as_str()))
                .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Some(PlatformPlace {
        id,
        name: doc.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        record_type,
        contact_id,
        parent: parse_parent(doc.get("parent")),
        properties,
    })
}

fn parse_parent(value: Option<&Value>) -> Option<ParentRef> {
    let value = value?;
    let id = value.get("_id")?.as_str()?.to_string();
    Some(ParentRef {
        id,
        parent: parse_parent(value.get("parent")).map(Box::new),
    })
}

/// [`HealthProbe`] reading `sentinel.backlog` from `/api/v2/monitoring`.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    threshold: u64,
}

impl HttpHealthProbe {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            threshold: BACKLOG_THRESHOLD,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, instance_url: &str) -> HealthVerdict {
        let url = format!("{}/api/v2/monitoring", instance_url.trim_end_matches('/'));
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => return HealthVerdict::Postpone(format!("instance unreachable: {}", e)),
        };

        let status = response.status();
        if status.is_server_error() {
            return HealthVerdict::Postpone(format!("monitoring endpoint returned {}", status));
        }
        if !status.is_success() {
            warn!(%url, %status, "monitoring endpoint unavailable, proceeding");
            return HealthVerdict::Unknown(format!("monitoring endpoint returned {}", status));
        }

        let backlog = match response.json::<Value>().await {
            Ok(json) => json["sentinel"]["backlog"].as_u64(),
            Err(e) => {
                warn!(%url, error = %e, "unreadable monitoring response, proceeding");
                return HealthVerdict::Unknown(format!("unreadable monitoring response: {}", e));
            }
        };

        match backlog {
            Some(backlog) if backlog > self.threshold => HealthVerdict::Postpone(format!(
                "sentinel backlog {} is above {}",
                backlog, self.threshold
            )),
            Some(_) => HealthVerdict::Healthy,
            None => {
                warn!(%url, "monitoring response has no sentinel backlog, proceeding");
                HealthVerdict::Unknown("no sentinel backlog in monitoring response".to_string())
            }
        }
    }
}
