use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::error::RemoteError;
use crate::core::remote::*;

const MAX_RETRIES: u32 = 4;
const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 8_000;

const USAGE_LIMIT_CODE: &str = "usage_limit_reached";

/// JSON-over-HTTP client for the negotiation backend.
pub struct HttpNegotiationService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpNegotiationService {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/negotiation/{}", self.base_url, path)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, RemoteError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
        let text = self.send(Method::POST, path, Some(&body)).await?;
        decode(&text)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let text = self.send(Method::GET, path, None).await?;
        decode(&text)
    }

    /// Send with retries on 429/502/503. Returns the raw success body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<String, RemoteError> {
        let url = self.endpoint(path);
        let mut last_err = RemoteError::Http("no attempts made".into());

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = match &last_err {
                    RemoteError::RateLimited { retry_after_ms } if *retry_after_ms > 0 => {
                        compute_backoff(attempt, Some(*retry_after_ms))
                    }
                    _ => compute_backoff(attempt, None),
                };
                tracing::warn!(
                    attempt,
                    max = MAX_RETRIES - 1,
                    backoff_ms = backoff,
                    path,
                    "retrying negotiation request"
                );
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }

            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("Content-Type", "application/json");
            if let Some(key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {key}"));
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = RemoteError::Http(e.to_string());
                    continue;
                }
            };

            let status = resp.status().as_u16();
            if resp.status().is_success() {
                return resp.text().await.map_err(|e| RemoteError::Http(e.to_string()));
            }

            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);

            let text = resp.text().await.unwrap_or_default();
            match classify_error(status, &text, retry_after) {
                err @ RemoteError::RateLimited { .. } => {
                    last_err = err;
                    continue;
                }
                err => {
                    tracing::debug!(status, path, error = %err, "negotiation request failed");
                    return Err(err);
                }
            }
        }

        Err(last_err)
    }
}

#[async_trait]
impl NegotiationService for HttpNegotiationService {
    async fn intro_step(&self, req: IntroRequest) -> Result<IntroReply, RemoteError> {
        self.post("intro", &req).await
    }

    async fn negotiation_step(
        &self,
        req: NegotiationRequest,
    ) -> Result<NegotiationReply, RemoteError> {
        self.post("step", &req).await
    }

    async fn confirm_price(&self, price_cents: u64) -> Result<PriceConfirmation, RemoteError> {
        self.post(
            "confirm",
            &serde_json::json!({ "confirmedPriceCents": price_cents }),
        )
        .await
    }

    async fn start_trial(&self, req: TrialRequest) -> Result<TrialGrant, RemoteError> {
        self.post("trial/start", &req).await
    }

    async fn continue_free(&self) -> Result<FreeContinuation, RemoteError> {
        self.post("trial/continue-free", &serde_json::json!({})).await
    }

    async fn negotiation_status(&self) -> Result<NegotiationStatus, RemoteError> {
        self.get("status").await
    }

    async fn sync_state(&self, snapshot: SyncSnapshot) -> Result<(), RemoteError> {
        let body =
            serde_json::to_value(&snapshot).map_err(|e| RemoteError::Decode(e.to_string()))?;
        self.send(Method::POST, "sync", Some(&body)).await?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, RemoteError> {
    serde_json::from_str(text).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Map a non-success response to an error. Rate limits and gateway errors
/// come back as [`RemoteError::RateLimited`] so the caller retries them; a
/// usage-limit body is never retried.
pub(crate) fn classify_error(status: u16, body: &str, retry_after_ms: Option<u64>) -> RemoteError {
    let json: Option<serde_json::Value> = serde_json::from_str(body).ok();

    if matches!(status, 402 | 403 | 429) && json.as_ref().is_some_and(is_usage_limit_body) {
        return RemoteError::UsageLimit;
    }
    if matches!(status, 429 | 502 | 503) {
        return RemoteError::RateLimited {
            retry_after_ms: retry_after_ms.unwrap_or(0),
        };
    }

    let message = json
        .as_ref()
        .and_then(|v| {
            v["message"]
                .as_str()
                .or_else(|| v["error"].as_str())
                .or_else(|| v["error"]["message"].as_str())
        })
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(200).collect());

    RemoteError::Api { status, message }
}

fn is_usage_limit_body(json: &serde_json::Value) -> bool {
    [&json["error"], &json["code"], &json["error"]["code"]]
        .iter()
        .any(|v| v.as_str() == Some(USAGE_LIMIT_CODE))
}

fn compute_backoff(attempt: u32, server_retry_ms: Option<u64>) -> u64 {
    if let Some(ms) = server_retry_ms {
        return ms.min(MAX_BACKOFF_MS * 4);
    }
    let base = INITIAL_BACKOFF_MS * 2u64.pow(attempt.saturating_sub(1));
    let capped = base.min(MAX_BACKOFF_MS);
    // 0-25% jitter
    let jitter = (capped as f64 * 0.25 * rand_f64()) as u64;
    capped + jitter
}

fn rand_f64() -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (seed as f64 % 1000.0) / 1000.0
}
