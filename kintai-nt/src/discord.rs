//! Chat webhook delivery with bounded retries
//!
//! Notification is best-effort: exhausting the retries is reported to the
//! caller but must never stop tap processing or the log tail.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::json;
use tracing::warn;

const ATTEMPTS: u32 = 3;
const RETRY_SLEEP: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "kintai/0.1";

/// Discord-compatible webhook client
pub struct ChatWebhook {
    client: reqwest::Client,
    url: String,
}

impl ChatWebhook {
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, url })
    }

    /// Post one message, retrying a fixed number of times
    pub async fn notify(&self, text: &str) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=ATTEMPTS {
            match self.post(text).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Chat post attempt {attempt}/{ATTEMPTS} failed: {e:#}");
                    last_err = Some(e);
                    if attempt < ATTEMPTS {
                        tokio::time::sleep(RETRY_SLEEP).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("chat post failed")))
    }

    async fn post(&self, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "content": text }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body = body.chars().take(400).collect::<String>();
            return Err(anyhow!("HTTP {status} {body}"));
        }
        Ok(())
    }
}
