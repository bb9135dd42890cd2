//! The caller's view of a platform instance.

use std::fmt;

use crate::models::ResolvedRecord;

/// A platform instance, identified by its base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub url: String,
}

impl Instance {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
        }
    }

    /// Host (and port) without scheme, credentials or path. Cache buckets
    /// are keyed on this.
    pub fn domain(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let host = rest.split('/').next().unwrap_or(rest);
        host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host)
    }
}

/// An authenticated session against one instance.
///
/// `facility_ids` scopes what the user may see: non-admin users only see
/// places at or below one of their facilities.
#[derive(Clone)]
pub struct Session {
    pub instance: Instance,
    pub username: String,
    /// Platform session cookie value.
    pub token: String,
    pub facility_ids: Vec<String>,
    pub is_admin: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("instance", &self.instance)
            .field("username", &self.username)
            .field("token", &"[REDACTED]")
            .field("facility_ids", &self.facility_ids)
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

impl Session {
    pub fn is_authorized(&self, record: &ResolvedRecord) -> bool {
        if self.is_admin {
            return true;
        }
        self.facility_ids.iter().any(|facility| {
            record.id == *facility || record.lineage.iter().flatten().any(|id| id == facility)
        })
    }
}
