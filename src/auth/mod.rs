// src/auth/mod.rs
pub mod refresher;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::persist::write_json_atomic;

/// Authentication bundle for the upstream feed API: an opaque cookie
/// field map plus the long-lived refresh token and an expiry estimate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds of the last successful refresh.
    #[serde(default)]
    pub refreshed_at: Option<i64>,
    /// Estimated unix seconds after which the cookie set stops working.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl Credential {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Cookie header value, `None` when no fields are configured.
    pub fn cookie_header(&self) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }
        Some(
            self.fields
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// The anti-csrf field the refresh endpoints require.
    pub fn csrf(&self) -> Option<&str> {
        self.fields.get("bili_jct").map(String::as_str)
    }

    /// Estimated remaining validity. `None` when no estimate exists.
    pub fn remaining_secs(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|at| at - now)
    }

    /// Merge freshly issued cookie fields over the current set, keeping
    /// fields the exchange did not reissue.
    pub fn merged_with(&self, new_fields: BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut out = self.fields.clone();
        out.extend(new_fields);
        out
    }
}

/// Owns the current credential. Readers take `Arc` snapshots so a
/// concurrent refresh never invalidates an in-flight feed call; the write
/// path swaps atomically and persists the whole document.
pub struct CredentialStore {
    path: PathBuf,
    current: RwLock<Arc<Credential>>,
}

impl CredentialStore {
    /// Load from disk; an absent file bootstraps an empty credential.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cred = match std::fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing credentials at {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Credential::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading credentials at {}", path.display()))
            }
        };
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(cred)),
        })
    }

    /// Start from an in-memory credential (initial configuration); the
    /// file still receives every later refresh.
    pub fn open_with_initial(path: impl Into<PathBuf>, initial: Credential) -> Result<Self> {
        let store = Self::open(path)?;
        // Configured credentials win over a stale persisted bundle only
        // when the file held nothing newer.
        let keep_persisted = {
            let cur = store.current();
            cur.refreshed_at.unwrap_or(0) > initial.refreshed_at.unwrap_or(0) && !cur.is_empty()
        };
        if !keep_persisted && !initial.is_empty() {
            store.replace(initial)?;
        }
        Ok(store)
    }

    /// Non-blocking read of the latest credential snapshot.
    pub fn current(&self) -> Arc<Credential> {
        self.current
            .read()
            .expect("credential lock poisoned")
            .clone()
    }

    /// Atomic swap + durable write. The swap happens only after the
    /// document hit disk, so a failed write leaves the old value served.
    pub fn replace(&self, new: Credential) -> Result<()> {
        write_json_atomic(&self.path, &new)?;
        let mut guard = self.current.write().expect("credential lock poisoned");
        *guard = Arc::new(new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred_with(fields: &[(&str, &str)]) -> Credential {
        Credential {
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn cookie_header_joins_fields() {
        let c = cred_with(&[("SESSDATA", "abc"), ("bili_jct", "tok")]);
        assert_eq!(c.cookie_header().unwrap(), "SESSDATA=abc; bili_jct=tok");
        assert_eq!(c.csrf(), Some("tok"));
        assert!(Credential::default().cookie_header().is_none());
    }

    #[test]
    fn merge_keeps_unreissued_fields() {
        let c = cred_with(&[("SESSDATA", "old"), ("buvid3", "keep")]);
        let merged = c.merged_with(
            [("SESSDATA".to_string(), "new".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(merged.get("SESSDATA").unwrap(), "new");
        assert_eq!(merged.get("buvid3").unwrap(), "keep");
    }

    #[test]
    fn open_bootstraps_empty_and_replace_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::open(&path).unwrap();
        assert!(store.current().is_empty());

        store.replace(cred_with(&[("SESSDATA", "abc")])).unwrap();
        assert_eq!(
            store.current().fields.get("SESSDATA").map(String::as_str),
            Some("abc")
        );

        // A second store picks up the persisted value.
        let reopened = CredentialStore::open(&path).unwrap();
        assert_eq!(
            reopened.current().fields.get("SESSDATA").map(String::as_str),
            Some("abc")
        );
    }

    #[test]
    fn snapshot_survives_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("c.json")).unwrap();
        store.replace(cred_with(&[("SESSDATA", "one")])).unwrap();

        let snapshot = store.current();
        store.replace(cred_with(&[("SESSDATA", "two")])).unwrap();

        // The borrowed snapshot still reads the old value; new readers
        // see the replacement.
        assert_eq!(snapshot.fields.get("SESSDATA").unwrap(), "one");
        assert_eq!(store.current().fields.get("SESSDATA").unwrap(), "two");
    }
}
