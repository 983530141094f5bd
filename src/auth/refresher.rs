// src/auth/refresher.rs
//! Background credential renewal.
//!
//! The refresher ticks on a fixed cadence, independent of the polling
//! cycles. A tick refreshes only when the credential is near expiry; a
//! failed refresh leaves the old credential in service and retries on
//! the next tick. At most one refresh is ever in flight.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};

use super::{Credential, CredentialStore};

const CHECK_URL: &str = "https://passport.bilibili.com/x/passport-login/web/cookie/info";
const REFRESH_URL: &str = "https://passport.bilibili.com/x/passport-login/web/cookie/refresh";
const CONFIRM_URL: &str = "https://passport.bilibili.com/x/passport-login/web/confirm/refresh";

/// Rough lifetime of a freshly issued cookie set; only used as the
/// local expiry estimate, the upstream check endpoint has the last word.
const CREDENTIAL_TTL_SECS: i64 = 30 * 24 * 3600;

#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    pub tick: Duration,
    /// Refresh once estimated remaining validity drops below this.
    pub min_validity: Duration,
    pub call_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(3600),
            min_validity: Duration::from_secs(6 * 3600),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Derived credential state; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialPhase {
    Valid,
    NearExpiry,
}

/// An unknown expiry counts as near-expiry so the exchange (which asks
/// the upstream check endpoint) gets a chance to decide.
pub fn phase(cred: &Credential, now: i64, min_validity: Duration) -> CredentialPhase {
    match cred.remaining_secs(now) {
        Some(r) if r > min_validity.as_secs() as i64 => CredentialPhase::Valid,
        _ => CredentialPhase::NearExpiry,
    }
}

/// Opaque collaborator performing the actual refresh exchange.
/// `Ok(None)` means the upstream considers the credential still valid.
#[async_trait]
pub trait AuthExchange: Send + Sync {
    async fn refresh(&self, current: &Credential) -> Result<Option<Credential>>;
}

pub struct CredentialRefresher {
    store: Arc<CredentialStore>,
    exchange: Arc<dyn AuthExchange>,
    cfg: RefreshConfig,
    in_flight: Mutex<()>,
    hint: Notify,
}

impl CredentialRefresher {
    pub fn new(
        store: Arc<CredentialStore>,
        exchange: Arc<dyn AuthExchange>,
        cfg: RefreshConfig,
    ) -> Self {
        Self {
            store,
            exchange,
            cfg,
            in_flight: Mutex::new(()),
            hint: Notify::new(),
        }
    }

    /// Out-of-band signal (e.g. the feed returned `AuthInvalid`): wake
    /// the loop and refresh regardless of the local expiry estimate.
    pub fn hint_auth_invalid(&self) {
        self.hint.notify_one();
    }

    /// One refresh attempt. Returns `true` when a new credential was
    /// installed. A tick arriving while another is in flight is a no-op.
    pub async fn tick(&self) -> bool {
        self.tick_inner(false).await
    }

    async fn tick_inner(&self, forced: bool) -> bool {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!("credential refresh already in flight, skipping tick");
            return false;
        };

        let current = self.store.current();
        if current.refresh_token.is_none() {
            tracing::debug!("no refresh token configured, skipping credential refresh");
            return false;
        }

        let now = chrono::Utc::now().timestamp();
        if !forced && phase(&current, now, self.cfg.min_validity) == CredentialPhase::Valid {
            tracing::trace!("credential still valid, no refresh needed");
            return false;
        }

        let attempt = tokio::time::timeout(self.cfg.call_timeout, self.exchange.refresh(&current));
        match attempt.await {
            Ok(Ok(Some(fresh))) => match self.store.replace(fresh) {
                Ok(()) => {
                    tracing::info!("credential refreshed and persisted");
                    true
                }
                Err(e) => {
                    // The exchange succeeded but we could not persist;
                    // the old credential stays in service.
                    tracing::error!(error = ?e, "persisting refreshed credential failed");
                    false
                }
            },
            Ok(Ok(None)) => {
                tracing::debug!("upstream reports credential still valid");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(error = ?e, "credential refresh failed, will retry next tick");
                false
            }
            Err(_) => {
                tracing::warn!("credential refresh timed out, will retry next tick");
                false
            }
        }
    }

    /// Long-running loop; exits when the shutdown signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_inner(false).await;
                }
                _ = self.hint.notified() => {
                    tracing::info!("auth-invalid hint received, refreshing out of band");
                    self.tick_inner(true).await;
                }
                _ = shutdown.changed() => {
                    tracing::debug!("credential refresher shutting down");
                    break;
                }
            }
        }
    }
}

/// Canonical exchange against the upstream passport endpoints:
/// check whether a refresh is due, swap the refresh token for fresh
/// cookies, then confirm to retire the old token.
pub struct BilibiliAuthExchange {
    http: reqwest::Client,
    user_agent: String,
}

impl BilibiliAuthExchange {
    pub fn new(user_agent: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .context("building auth http client")?;
        Ok(Self { http, user_agent })
    }

    /// Ask the check endpoint whether the cookie set needs refreshing.
    /// Returns the server timestamp used to derive the correspond path.
    async fn check_need_refresh(&self, cred: &Credential) -> Result<Option<i64>> {
        let cookie = cred
            .cookie_header()
            .ok_or_else(|| anyhow!("no cookie fields to check"))?;
        let mut req = self
            .http
            .get(CHECK_URL)
            .header("User-Agent", &self.user_agent)
            .header("Cookie", cookie);
        if let Some(csrf) = cred.csrf() {
            req = req.query(&[("csrf", csrf)]);
        }
        let body: Value = req
            .send()
            .await
            .context("cookie check request")?
            .error_for_status()
            .context("cookie check status")?
            .json()
            .await
            .context("cookie check body")?;

        if body.get("code").and_then(Value::as_i64) != Some(0) {
            bail!(
                "cookie check API error: {}",
                body.get("message").and_then(Value::as_str).unwrap_or("?")
            );
        }
        let need = body
            .pointer("/data/refresh")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !need {
            return Ok(None);
        }
        Ok(Some(
            body.pointer("/data/timestamp")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        ))
    }

    async fn exchange_cookies(
        &self,
        cred: &Credential,
        correspond_path: &str,
    ) -> Result<(BTreeMap<String, String>, String)> {
        let cookie = cred
            .cookie_header()
            .ok_or_else(|| anyhow!("no cookie fields to refresh"))?;
        let csrf = cred
            .csrf()
            .ok_or_else(|| anyhow!("cookie set has no csrf field"))?;
        let token = cred
            .refresh_token
            .as_deref()
            .ok_or_else(|| anyhow!("no refresh token"))?;

        let resp = self
            .http
            .post(REFRESH_URL)
            .header("User-Agent", &self.user_agent)
            .header("Cookie", cookie)
            .form(&[
                ("csrf", csrf),
                ("refresh_csrf", correspond_path),
                ("refresh_token", token),
                ("source", "main_web"),
            ])
            .send()
            .await
            .context("cookie refresh request")?
            .error_for_status()
            .context("cookie refresh status")?;

        let new_fields = set_cookie_fields(resp.headers());
        let body: Value = resp.json().await.context("cookie refresh body")?;
        if body.get("code").and_then(Value::as_i64) != Some(0) {
            bail!(
                "cookie refresh API error: {}",
                body.get("message").and_then(Value::as_str).unwrap_or("?")
            );
        }
        let new_token = body
            .pointer("/data/refresh_token")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("refresh response carried no refresh_token"))?
            .to_string();
        Ok((new_fields, new_token))
    }

    async fn confirm(&self, fresh: &Credential, old_token: &str) -> Result<()> {
        let cookie = fresh
            .cookie_header()
            .ok_or_else(|| anyhow!("fresh credential has no cookie fields"))?;
        let csrf = fresh
            .csrf()
            .ok_or_else(|| anyhow!("fresh credential has no csrf field"))?;
        let body: Value = self
            .http
            .post(CONFIRM_URL)
            .header("User-Agent", &self.user_agent)
            .header("Cookie", cookie)
            .form(&[("csrf", csrf), ("refresh_token", old_token)])
            .send()
            .await
            .context("confirm refresh request")?
            .error_for_status()
            .context("confirm refresh status")?
            .json()
            .await
            .context("confirm refresh body")?;
        if body.get("code").and_then(Value::as_i64) != Some(0) {
            bail!(
                "confirm refresh API error: {}",
                body.get("message").and_then(Value::as_str).unwrap_or("?")
            );
        }
        Ok(())
    }
}

#[async_trait]
impl AuthExchange for BilibiliAuthExchange {
    async fn refresh(&self, current: &Credential) -> Result<Option<Credential>> {
        let Some(timestamp) = self.check_need_refresh(current).await? else {
            return Ok(None);
        };

        let correspond_path = correspond_path(timestamp);
        let (new_fields, new_token) = self.exchange_cookies(current, &correspond_path).await?;

        let now = chrono::Utc::now().timestamp();
        let fresh = Credential {
            fields: current.merged_with(new_fields),
            refresh_token: Some(new_token),
            refreshed_at: Some(now),
            expires_at: Some(now + CREDENTIAL_TTL_SECS),
        };

        // The confirm call retires the old token; a failure here is not
        // fatal because the new cookie set is already issued.
        if let Some(old_token) = current.refresh_token.as_deref() {
            if let Err(e) = self.confirm(&fresh, old_token).await {
                tracing::warn!(error = ?e, "confirm refresh failed, new cookies kept anyway");
            }
        }
        Ok(Some(fresh))
    }
}

/// Simplified correspond path derivation from the server timestamp.
fn correspond_path(timestamp_ms: i64) -> String {
    format!("{timestamp_ms:x}")
}

fn set_cookie_fields(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for value in headers.get_all(reqwest::header::SET_COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        let pair = raw.split(';').next().unwrap_or_default();
        if let Some((k, v)) = pair.split_once('=') {
            let k = k.trim();
            if !k.is_empty() {
                out.insert(k.to_string(), v.trim().to_string());
            }
        }
    }
    out
}
