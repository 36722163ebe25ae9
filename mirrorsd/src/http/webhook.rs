//! Webhook execution. Unlike the rest of [`http`](crate::http), executions
//! POST straight to the stored webhook URL (the url embeds its own token), so
//! this runs on a plain client with the response contract the republisher
//! branches on.

use std::time::Duration;

use log::{error, warn};
use reqwest::{Client, multipart};
use serde::{Deserialize, Serialize};

use crate::model::message::Embed;

/// What one webhook execution asks Discord to post.
#[derive(Serialize, Debug, Clone, Default)]
pub struct WebhookPayload {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embeds: Vec<Embed>,
}

/// A downloaded (and possibly recompressed) file to attach.
#[derive(Debug, Clone)]
pub struct WebhookFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// How an execution ended. Retries for 429 and 5xx happen inside
/// [`WebhookExecutor::execute`]; every variant here is final for this message
/// part, and the republisher decides whether to evict, reprovision, truncate,
/// or drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Success,
    /// 404 with "Unknown Webhook": the webhook was deleted out from under us
    UnknownWebhook,
    /// 404 with "Unknown Channel": the channel is gone too
    UnknownChannel,
    /// 413: payload too large even after compression
    PayloadTooLarge,
    /// 400 carrying Discord code 30005 (role ceiling)
    RoleCeiling,
    /// 400 complaining the content must be 2000 or fewer characters
    ContentTooLong,
    /// all retries exhausted
    Failed,
}

#[derive(Deserialize)]
struct WebhookErrorBody {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retry_after: Option<f64>,
}

const ROLE_CEILING_CODE: u32 = 30005;
const MAX_ATTEMPTS: u32 = 3;

pub struct WebhookExecutor {
    client: Client,
}

impl WebhookExecutor {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Unable to build client!");
        Self { client }
    }

    /// Execute `payload` (plus any files) against `url`, interpreting the
    /// response per the contract: 429 sleeps `retry_after` and retries, 5xx
    /// retries up to 3 times with growing delays, everything else maps to an
    /// [`ExecuteOutcome`].
    pub async fn execute(
        &self,
        url: &str,
        payload: &WebhookPayload,
        files: &[WebhookFile],
    ) -> ExecuteOutcome {
        let mut attempt: u32 = 0;
        loop {
            let request = if files.is_empty() {
                self.client.post(url).json(payload)
            } else {
                let mut form = multipart::Form::new()
                    .text("payload_json", serde_json::to_string(payload).expect("payload serializes"));
                for (i, file) in files.iter().enumerate() {
                    form = form.part(
                        format!("files[{i}]"),
                        multipart::Part::bytes(file.bytes.clone()).file_name(file.filename.clone()),
                    );
                }
                self.client.post(url).multipart(form)
            };

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    error!("webhook request error: {e}");
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return ExecuteOutcome::Failed;
                    }
                    tokio::time::sleep(Duration::from_secs(u64::from(2 * attempt))).await;
                    continue;
                }
            };

            let status = response.status();
            match status.as_u16() {
                200 | 204 => return ExecuteOutcome::Success,
                404 => {
                    let body = response.text().await.unwrap_or_default();
                    if body.contains("Unknown Webhook") {
                        return ExecuteOutcome::UnknownWebhook;
                    }
                    if body.contains("Unknown Channel") {
                        return ExecuteOutcome::UnknownChannel;
                    }
                    error!("webhook 404 with unrecognized body: {body}");
                    return ExecuteOutcome::UnknownWebhook;
                }
                413 => return ExecuteOutcome::PayloadTooLarge,
                429 => {
                    let retry_after = response.json::<WebhookErrorBody>().await
                        .ok()
                        .and_then(|body| body.retry_after)
                        .unwrap_or(1.0);
                    warn!("webhook rate limited, sleeping {retry_after}s");
                    tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                }
                400 => {
                    let body = response.text().await.unwrap_or_default();
                    let parsed: Option<WebhookErrorBody> = serde_json::from_str(&body).ok();
                    if parsed.as_ref().and_then(|b| b.code) == Some(ROLE_CEILING_CODE) {
                        return ExecuteOutcome::RoleCeiling;
                    }
                    if body.contains("2000 or fewer") {
                        return ExecuteOutcome::ContentTooLong;
                    }
                    error!(
                        "webhook 400: {}",
                        parsed.and_then(|b| b.message).unwrap_or(body),
                    );
                    return ExecuteOutcome::Failed;
                }
                s if (500..600).contains(&s) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return ExecuteOutcome::Failed;
                    }
                    tokio::time::sleep(Duration::from_secs(u64::from(2 * attempt))).await;
                }
                s => {
                    error!("webhook unexpected status {s}");
                    return ExecuteOutcome::Failed;
                }
            }
        }
    }

    /// HEAD a stored webhook url; `false` means the hook is gone (401/403/404)
    /// and the route should be evicted. Network errors are treated as alive so
    /// a flaky sweep never evicts working routes.
    pub async fn is_alive(&self, url: &str) -> bool {
        let response = self.client.head(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match response {
            Ok(response) => !matches!(response.status().as_u16(), 401 | 403 | 404),
            Err(e) => {
                warn!("webhook liveness check failed to connect: {e}");
                true
            }
        }
    }
}

impl Default for WebhookExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_skips_missing_fields() {
        let payload = WebhookPayload {
            username: "Alice".into(),
            ..WebhookPayload::default()
        };
        assert_eq!(serde_json::to_string(&payload).unwrap(), r#"{"username":"Alice"}"#);
    }

    #[test]
    fn error_body_parses_retry_after() {
        let body: WebhookErrorBody =
            serde_json::from_str(r#"{"message": "You are being rate limited.", "retry_after": 64.57, "global": false}"#)
                .unwrap();
        assert_eq!(body.retry_after, Some(64.57));
        assert_eq!(body.code, None);
        assert!(body.message.unwrap().contains("rate limited"));
    }
}
