//! Outbound REST calls as retryable activities.
//!
//! The invoker has no idempotence of its own; it is only reached through the
//! executor's replay gate, which guarantees a recorded response is never
//! re-fetched.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatcher::RetryPolicy;
use crate::error::ActivityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded outcome of a successful (2xx) call.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// `reqwest`-backed invoker. Transport errors are retried under the policy;
/// a non-2xx status is a permanent activity failure (the server answered,
/// retrying would re-send a possibly non-idempotent request).
pub struct HttpInvoker {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            policy,
        }
    }

    pub async fn invoke(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
    ) -> Result<HttpResponse, ActivityError> {
        let mut attempt = 1u32;
        loop {
            debug!(%method, url, attempt, "sending request");
            match self.send_once(method, url, headers, body).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.policy.max_attempts {
                        return Err(err);
                    }
                    let backoff = self.policy.backoff_ms(attempt);
                    warn!(%method, url, attempt, backoff_ms = backoff, error = %err, "request failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
    ) -> Result<HttpResponse, ActivityError> {
        let mut req = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Delete => self.client.delete(url),
        };
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(b) = body {
            req = req.body(b.to_string());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ActivityError::transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ActivityError::transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ActivityError::permanent(format!(
                "http status {}: {}",
                status.as_u16(),
                text
            )));
        }
        Ok(HttpResponse {
            status: status.as_u16(),
            body: text,
        })
    }
}
