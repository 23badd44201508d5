//! Thin JSON client for the FHIR REST API.
//!
//! Handles base-URL joining, bearer auth, version-conditional updates, and
//! rate limiting: HTTP 429 responses are retried with exponential backoff
//! (honoring `Retry-After` when the server sends one) up to a configured
//! ceiling before surfacing as [`FhirError::RateLimited`].

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FhirError, Result};
use crate::models::Bundle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FhirClientConfig {
    pub base_url: String,
    /// Per-request timeout. Default: 30_000
    pub timeout_ms: u64,
    /// 429 retries before giving up. Default: 5
    pub max_rate_limit_retries: u32,
    /// First 429 backoff; doubles per retry. Default: 250
    pub rate_limit_base_delay_ms: u64,
    /// Backoff ceiling. Default: 10_000
    pub rate_limit_ceiling_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

impl Default for FhirClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/fhir".to_string(),
            timeout_ms: 30_000,
            max_rate_limit_retries: 5,
            rate_limit_base_delay_ms: 250,
            rate_limit_ceiling_ms: 10_000,
            bearer_token: None,
        }
    }
}

pub struct FhirClient {
    http: Client,
    config: FhirClientConfig,
}

impl FhirClient {
    pub fn new(config: FhirClientConfig) -> Result<Self> {
        // Validate the base URL up front so misconfiguration fails fast.
        url::Url::parse(&config.base_url)?;
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn resource_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request, retrying 429s with exponential backoff.
    async fn send<F>(&self, build: F) -> Result<Value>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let response = self.authorize(build()).send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= self.config.max_rate_limit_retries {
                    return Err(FhirError::RateLimited { attempts: attempt });
                }
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|secs| secs * 1000);
                let backoff_ms = retry_after
                    .unwrap_or_else(|| {
                        self.config
                            .rate_limit_base_delay_ms
                            .saturating_mul(1u64 << attempt.min(16))
                    })
                    .min(self.config.rate_limit_ceiling_ms);
                attempt += 1;
                warn!(attempt, backoff_ms, "FHIR server rate limited request; backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(FhirError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let text = response.text().await?;
            if text.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| FhirError::Malformed(format!("invalid JSON body: {}", e)));
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let url = self.resource_url(path);
        self.send(|| self.http.get(&url)).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.resource_url(path);
        self.send(|| self.http.post(&url).json(body)).await
    }

    /// PUT, optionally version-conditional via `If-Match: W/"<version>"`.
    pub async fn put(&self, path: &str, body: &Value, if_match_version: Option<&str>) -> Result<Value> {
        let url = self.resource_url(path);
        self.send(|| {
            let builder = self.http.put(&url).json(body);
            match if_match_version {
                Some(version) => builder.header(header::IF_MATCH, format!("W/\"{}\"", version)),
                None => builder,
            }
        })
        .await
    }

    /// Search a resource type, following Bundle `next` links.
    pub async fn search(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Value>> {
        let url = self.resource_url(resource_type);
        let mut page: Bundle = parse_bundle(
            self.send(|| self.http.get(&url).query(params)).await?,
        )?;

        let mut resources = Vec::new();
        loop {
            let next = page.next_link().map(str::to_string);
            resources.extend(page.resources());
            match next {
                Some(next_url) => {
                    debug!(url = %next_url, "following bundle next link");
                    page = parse_bundle(self.send(|| self.http.get(&next_url)).await?)?;
                }
                None => break,
            }
        }
        Ok(resources)
    }
}

fn parse_bundle(value: Value) -> Result<Bundle> {
    serde_json::from_value(value)
        .map_err(|e| FhirError::Malformed(format!("search did not return a Bundle: {}", e)))
}
