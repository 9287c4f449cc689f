use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::Value;

use crate::models::{CredentialRecord, FetchOutcome};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Exchanges one validated credential record for a token.
///
/// Implementations never fail: every path ends in a [`FetchOutcome`].
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self, record: CredentialRecord) -> FetchOutcome;
}

/// Token fetcher backed by the upstream HTTP endpoint.
pub struct HttpTokenFetcher {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpTokenFetcher {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch(&self, record: CredentialRecord) -> FetchOutcome {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("uid", record.uid.as_str()),
                ("password", record.password.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let reason = transport_failure_reason(&err);
                error!("Request failed for UID {}: {}", record.uid, reason);
                return FetchOutcome::failure(record.fields, reason);
            }
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                let reason = transport_failure_reason(&err);
                error!("Reading response failed for UID {}: {}", record.uid, reason);
                return FetchOutcome::failure(record.fields, reason);
            }
        };

        match interpret_response(status, &body) {
            Ok((token, region)) => {
                info!("Token received for UID {} (region: {:?})", record.uid, region);
                FetchOutcome::Success {
                    token,
                    region,
                    record: record.fields,
                }
            }
            Err(reason) => {
                warn!(
                    "{} for UID {}. Response: {}",
                    reason,
                    record.uid,
                    body.chars().take(200).collect::<String>()
                );
                FetchOutcome::failure(record.fields, reason)
            }
        }
    }
}

fn transport_failure_reason(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "Request Timeout".to_string()
    } else if err.is_connect() || err.is_request() {
        format!("Network Error: {}", err)
    } else {
        format!("Unexpected Processing Error: {}", err)
    }
}

/// Maps an upstream status and body to `(token, region)` or a failure reason.
pub fn interpret_response(status: u16, body: &str) -> Result<(String, Option<String>), String> {
    if !(200..300).contains(&status) {
        let mut reason = format!("API Error ({})", status);
        if let Some(message) = error_message(body) {
            reason.push_str(": ");
            reason.extend(message.chars().take(100));
        }
        return Err(reason);
    }

    let parsed: Value = serde_json::from_str(body)
        .map_err(|_| format!("API OK ({}) but Non-JSON response", status))?;

    let token = parsed
        .get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "API OK but invalid/empty token".to_string())?;

    let region = parsed
        .get("region")
        .and_then(Value::as_str)
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    Ok((token.to_string(), region))
}

fn error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    ["message", "error", "detail"]
        .iter()
        .filter_map(|key| parsed.get(*key).and_then(Value::as_str))
        .find(|m| !m.is_empty())
        .map(str::to_string)
}
