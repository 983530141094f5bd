// tests/credential_refresh.rs
// Refresh lifecycle against a fake exchange: single-flight, expiry
// gating, and persistence of the installed credential.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use creator_monitor::auth::refresher::{AuthExchange, CredentialRefresher, RefreshConfig};
use creator_monitor::auth::{Credential, CredentialStore};

fn near_expiry_credential() -> Credential {
    let mut fields = BTreeMap::new();
    fields.insert("SESSDATA".to_string(), "stale".to_string());
    fields.insert("bili_jct".to_string(), "csrf".to_string());
    Credential {
        fields,
        refresh_token: Some("rt-old".to_string()),
        refreshed_at: Some(0),
        // Unknown expiry counts as near-expiry.
        expires_at: None,
    }
}

fn fresh_credential() -> Credential {
    let now = chrono::Utc::now().timestamp();
    let mut fields = BTreeMap::new();
    fields.insert("SESSDATA".to_string(), "fresh".to_string());
    fields.insert("bili_jct".to_string(), "csrf2".to_string());
    Credential {
        fields,
        refresh_token: Some("rt-new".to_string()),
        refreshed_at: Some(now),
        expires_at: Some(now + 30 * 24 * 3600),
    }
}

/// Counts calls and holds each one long enough for overlap to be
/// observable.
struct SlowExchange {
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl AuthExchange for SlowExchange {
    async fn refresh(&self, _current: &Credential) -> anyhow::Result<Option<Credential>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Some(fresh_credential()))
    }
}

struct NoopExchange {
    calls: AtomicUsize,
}

#[async_trait]
impl AuthExchange for NoopExchange {
    async fn refresh(&self, _current: &Credential) -> anyhow::Result<Option<Credential>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

fn config() -> RefreshConfig {
    RefreshConfig {
        tick: Duration::from_secs(3600),
        min_validity: Duration::from_secs(6 * 3600),
        call_timeout: Duration::from_secs(5),
    }
}

fn store_in(dir: &tempfile::TempDir, initial: Credential) -> Arc<CredentialStore> {
    Arc::new(
        CredentialStore::open_with_initial(dir.path().join("credentials.json"), initial).unwrap(),
    )
}

#[tokio::test]
async fn concurrent_ticks_run_one_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, near_expiry_credential());
    let exchange = Arc::new(SlowExchange {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(50),
    });
    let refresher = Arc::new(CredentialRefresher::new(
        Arc::clone(&store),
        Arc::clone(&exchange) as Arc<dyn AuthExchange>,
        config(),
    ));

    let (a, b) = tokio::join!(refresher.tick(), refresher.tick());
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    // Exactly one tick installed the credential; the other was a no-op.
    assert!(a != b);
    assert_eq!(
        store.current().fields.get("SESSDATA").map(String::as_str),
        Some("fresh")
    );
}

#[tokio::test]
async fn valid_credential_skips_the_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, fresh_credential());
    let exchange = Arc::new(NoopExchange {
        calls: AtomicUsize::new(0),
    });
    let refresher = CredentialRefresher::new(
        store,
        Arc::clone(&exchange) as Arc<dyn AuthExchange>,
        config(),
    );

    assert!(!refresher.tick().await);
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upstream_still_valid_installs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, near_expiry_credential());
    let exchange = Arc::new(NoopExchange {
        calls: AtomicUsize::new(0),
    });
    let refresher = CredentialRefresher::new(
        Arc::clone(&store),
        Arc::clone(&exchange) as Arc<dyn AuthExchange>,
        config(),
    );

    assert!(!refresher.tick().await);
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.current().fields.get("SESSDATA").map(String::as_str),
        Some("stale")
    );
}

#[tokio::test]
async fn installed_credential_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");

    {
        let store = Arc::new(
            CredentialStore::open_with_initial(&path, near_expiry_credential()).unwrap(),
        );
        let refresher = CredentialRefresher::new(
            store,
            Arc::new(SlowExchange {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }),
            config(),
        );
        assert!(refresher.tick().await);
    }

    // A fresh process keeps the refreshed bundle, even over a stale
    // configured one.
    let reopened = CredentialStore::open_with_initial(&path, near_expiry_credential()).unwrap();
    let cred = reopened.current();
    assert_eq!(cred.fields.get("SESSDATA").map(String::as_str), Some("fresh"));
    assert_eq!(cred.refresh_token.as_deref(), Some("rt-new"));
}

#[tokio::test]
async fn auth_invalid_hint_bypasses_the_expiry_gate() {
    let dir = tempfile::tempdir().unwrap();
    // Plenty of validity left: scheduled ticks would never refresh this.
    let store = store_in(&dir, fresh_credential());
    let exchange = Arc::new(SlowExchange {
        calls: AtomicUsize::new(0),
        delay: Duration::ZERO,
    });
    let refresher = Arc::new(CredentialRefresher::new(
        Arc::clone(&store),
        Arc::clone(&exchange) as Arc<dyn AuthExchange>,
        config(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let refresh_loop = tokio::spawn(CredentialRefresher::run(
        Arc::clone(&refresher),
        shutdown_rx,
    ));

    refresher.hint_auth_invalid();

    let mut refreshed = false;
    for _ in 0..200 {
        if exchange.calls.load(Ordering::SeqCst) >= 1 {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refreshed, "hint did not force a refresh");

    let _ = shutdown_tx.send(true);
    let _ = refresh_loop.await;
}

#[tokio::test]
async fn missing_refresh_token_disables_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let mut cred = near_expiry_credential();
    cred.refresh_token = None;
    let store = store_in(&dir, cred);
    let exchange = Arc::new(NoopExchange {
        calls: AtomicUsize::new(0),
    });
    let refresher = CredentialRefresher::new(
        store,
        Arc::clone(&exchange) as Arc<dyn AuthExchange>,
        config(),
    );

    assert!(!refresher.tick().await);
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
}
