// src/config.rs
//! Startup configuration: environment variables (via `.env`) for
//! tunables and secrets, a JSON file for the creator list. Loaded once;
//! everything downstream receives explicit immutable structures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::auth::Credential;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Cookie fields read from the environment on first start; later runs
/// prefer the persisted (refreshed) bundle.
const COOKIE_ENV_KEYS: [&str; 5] = [
    "SESSDATA",
    "bili_jct",
    "buvid3",
    "DedeUserID",
    "DedeUserID__ckMd5",
];

/// A monitored content source. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_interval", alias = "check_interval")]
    pub interval_secs: u64,
    #[serde(default, alias = "enable_comments")]
    pub watch_comments: bool,
    #[serde(default)]
    pub comment_keywords: Vec<String>,
}

fn default_platform() -> String {
    "bilibili".to_string()
}

fn default_interval() -> u64 {
    300
}

/// Creator IDs arrive as JSON numbers in files written by hand and as
/// strings everywhere else; accept both.
fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    Ok(match Raw::deserialize(de)? {
        Raw::Num(n) => n.to_string(),
        Raw::Str(s) => s,
    })
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub service: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl AiConfig {
    pub fn enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub creators_path: PathBuf,
    pub state_path: PathBuf,
    pub credentials_path: PathBuf,
    pub seen_cap: usize,
    pub user_agent: String,
    pub feishu_webhook: Option<String>,
    pub ai: AiConfig,
    pub refresh_tick: Duration,
    pub refresh_min_validity: Duration,
    /// Items older than this are ignored (useful after a reset so the
    /// whole visible history is not re-delivered). Unset = no limit.
    pub max_item_age: Option<Duration>,
    /// Cap on items dispatched for a creator with an empty record.
    /// Unset = no cap.
    pub first_sweep_max: Option<usize>,
    /// Delay between starting consecutive creator loops.
    pub stagger: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            creators_path: env_path("CREATORS_PATH", "data/creators.json"),
            state_path: env_path("STATE_PATH", "data/monitor_state.json"),
            credentials_path: env_path("CREDENTIALS_PATH", "data/credentials.json"),
            seen_cap: env_parse("SEEN_CAP")?.unwrap_or(crate::dedup::DEFAULT_SEEN_CAP),
            user_agent: std::env::var("USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            feishu_webhook: env_nonempty("FEISHU_WEBHOOK"),
            ai: AiConfig {
                service: std::env::var("AI_SERVICE").unwrap_or_else(|_| "deepseek".to_string()),
                api_key: env_nonempty("AI_API_KEY"),
                base_url: env_nonempty("AI_BASE_URL"),
                model: env_nonempty("AI_MODEL"),
            },
            refresh_tick: Duration::from_secs(env_parse("REFRESH_TICK_SECS")?.unwrap_or(3600)),
            refresh_min_validity: Duration::from_secs(
                env_parse("REFRESH_MIN_VALIDITY_SECS")?.unwrap_or(6 * 3600),
            ),
            max_item_age: env_parse::<u64>("MAX_ITEM_AGE_HOURS")?
                .map(|h| Duration::from_secs(h * 3600)),
            first_sweep_max: env_parse("FIRST_SWEEP_MAX")?,
            stagger: Duration::from_secs(env_parse("STAGGER_SECS")?.unwrap_or(30)),
        })
    }

    /// Credential bundle assembled from the environment; empty when no
    /// cookie fields are configured.
    pub fn initial_credential(&self) -> Credential {
        let mut fields = BTreeMap::new();
        for key in COOKIE_ENV_KEYS {
            if let Some(v) = env_nonempty(key) {
                fields.insert(key.to_string(), v);
            }
        }
        Credential {
            fields,
            refresh_token: env_nonempty("refresh_token"),
            refreshed_at: None,
            expires_at: None,
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => match v.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => bail!("invalid {key}={v}: {e}"),
        },
        _ => Ok(None),
    }
}

/// Load the creator list. A missing file is a startup error: a monitor
/// with nothing to monitor is a misconfiguration, not a default.
pub fn load_creators(path: &Path) -> Result<Vec<Creator>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading creators from {}", path.display()))?;
    let creators: Vec<Creator> = serde_json::from_str(&content)
        .with_context(|| format!("parsing creators from {}", path.display()))?;
    if creators.is_empty() {
        bail!("creator list at {} is empty", path.display());
    }
    Ok(creators)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creators_accept_numeric_and_string_ids() {
        let json = r#"[
            {"id": 11473291, "name": "a", "check_interval": 120},
            {"id": "550494308", "name": "b", "enable_comments": true,
             "comment_keywords": ["live"]}
        ]"#;
        let creators: Vec<Creator> = serde_json::from_str(json).unwrap();
        assert_eq!(creators[0].id, "11473291");
        assert_eq!(creators[0].interval_secs, 120);
        assert_eq!(creators[1].id, "550494308");
        assert!(creators[1].watch_comments);
        assert_eq!(creators[1].comment_keywords, vec!["live"]);
        assert_eq!(creators[1].interval_secs, 300);
        assert_eq!(creators[1].platform, "bilibili");
    }

    #[test]
    fn load_creators_rejects_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creators.json");
        assert!(load_creators(&path).is_err());

        std::fs::write(&path, "[]").unwrap();
        assert!(load_creators(&path).is_err());

        std::fs::write(&path, r#"[{"id": "1", "name": "x"}]"#).unwrap();
        let creators = load_creators(&path).unwrap();
        assert_eq!(creators.len(), 1);
    }

    #[serial_test::serial]
    #[test]
    fn env_parse_rejects_garbage() {
        std::env::set_var("SEEN_CAP", "not-a-number");
        assert!(AppConfig::from_env().is_err());
        std::env::set_var("SEEN_CAP", "50");
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.seen_cap, 50);
        std::env::remove_var("SEEN_CAP");
    }

    #[serial_test::serial]
    #[test]
    fn initial_credential_collects_cookie_fields() {
        std::env::set_var("SESSDATA", "sess");
        std::env::set_var("bili_jct", "csrf");
        std::env::set_var("refresh_token", "rt");
        let cfg = AppConfig::from_env().unwrap();
        let cred = cfg.initial_credential();
        assert_eq!(cred.fields.get("SESSDATA").unwrap(), "sess");
        assert_eq!(cred.csrf(), Some("csrf"));
        assert_eq!(cred.refresh_token.as_deref(), Some("rt"));
        for key in ["SESSDATA", "bili_jct", "refresh_token"] {
            std::env::remove_var(key);
        }
    }
}
