// src/notify/feishu.rs
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{Notification, Notifier, NotifyError, SystemLevel};

/// Feishu custom-bot webhook notifier. Cards are interactive messages
/// with a plain-text header and one markdown element.
#[derive(Clone)]
pub struct FeishuNotifier {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl FeishuNotifier {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    async fn post_card(&self, header: &str, markdown: &str) -> Result<(), NotifyError> {
        let payload = json!({
            "msg_type": "interactive",
            "card": {
                "header": {
                    "title": { "tag": "plain_text", "content": header },
                    "template": "blue"
                },
                "elements": [
                    { "tag": "markdown", "content": markdown }
                ]
            }
        });

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            match res {
                Ok(rsp) => {
                    let status = rsp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    // A rejected payload cannot succeed on retry; 429 is
                    // throttling and stays retryable.
                    if status.is_client_error() && status.as_u16() != 429 {
                        return Err(NotifyError::Permanent(anyhow!(
                            "webhook rejected card with status {status}"
                        )));
                    }
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                        continue;
                    }
                    return Err(NotifyError::Transient(anyhow!(
                        "webhook HTTP error after {attempt} attempts: {status}"
                    )));
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                        continue;
                    }
                    return Err(NotifyError::Transient(anyhow!(
                        "webhook request failed after {attempt} attempts: {e}"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl Notifier for FeishuNotifier {
    async fn notify(&self, message: &Notification) -> Result<(), NotifyError> {
        let header = format!("[{}] {}", message.platform, message.creator_name);
        self.post_card(&header, &message.markdown).await
    }

    async fn notify_system(
        &self,
        level: SystemLevel,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let emoji = match level {
            SystemLevel::Info => "✅",
            SystemLevel::Warning => "⚠️",
            SystemLevel::Error => "❌",
        };
        let markdown = format!("**{emoji} {title}**\n\n{body}");
        self.post_card("creator-monitor", &markdown).await
    }
}
