//! Payroll ingestion sink client
//!
//! Posts the full set of a month's records in one request. Unlike chat
//! notification, exhausting the retries here is fatal to the run: partial
//! silent submission is worse than an explicit failure.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tracing::warn;

use kintai_common::events::PayrollRecord;

const USER_AGENT: &str = "kintai/0.1";

/// HTTP client for the payroll ingestion endpoint
pub struct PayrollSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    retries: u32,
    retry_sleep: Duration,
}

impl PayrollSink {
    pub fn new(
        url: String,
        token: Option<String>,
        timeout: Duration,
        retries: u32,
        retry_sleep: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url,
            token,
            retries: retries.max(1),
            retry_sleep,
        })
    }

    /// Submit one month's records, returning the sink's acknowledgment.
    ///
    /// Retries a fixed number of times with a fixed sleep; the last error
    /// propagates when every attempt fails.
    pub async fn submit(&self, records: &[PayrollRecord]) -> Result<Value> {
        let mut last_err = None;
        for attempt in 1..=self.retries {
            match self.post(records).await {
                Ok(mut ack) => {
                    if let Some(obj) = ack.as_object_mut() {
                        obj.insert("sent_records".to_string(), json!(records.len()));
                    }
                    return Ok(ack);
                }
                Err(e) => {
                    warn!(
                        "Payroll submission attempt {attempt}/{} failed: {e:#}",
                        self.retries
                    );
                    last_err = Some(e);
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_sleep).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("payroll submission failed")))
    }

    async fn post(&self, records: &[PayrollRecord]) -> Result<Value> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({ "records": records }));
        if let Some(token) = &self.token {
            request = request.header("X-Auth-Token", token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("HTTP {status} {}", truncate(&body)));
        }

        let ack: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        if ack.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(ack)
        } else {
            Err(anyhow!("sink rejected submission: {}", truncate(&body)))
        }
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(400).collect()
}
