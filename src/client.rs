//! HTTP client for the PNCP consultation API.
//!
//! One shared reqwest client with keepalive pooling, fronted by the adaptive
//! rate limiter and the per-endpoint circuit breakers. Requests carry a
//! canonical query string (sorted keys, 8-digit dates) so identical work
//! always produces identical URLs, which keeps the request log comparable
//! across runs.

use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::breaker::{Admission, BreakerRegistry};
use crate::config::{EndpointConfig, HttpSubConfig};
use crate::data_structures::{
    ArbitraryJson, DateBucket, PageEnvelope, PageRequest, PageResponse, MODALITY_PARAM,
    PAGE_PARAM, PAGE_SIZE_PARAM, WIRE_DATE_FORMAT,
};
use crate::error::{ExtractError, ExtractResult};
use crate::rate_limit::AdaptiveLimiter;

#[derive(Clone, Debug)]
pub struct HttpSettings {
    pub max_connections_per_host: usize,
    pub max_keepalive: usize,
    pub keepalive_expiry: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub http2_enabled: bool,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
}

impl HttpSettings {
    pub fn from_config(http: &HttpSubConfig, timeout_override_seconds: Option<u64>) -> Self {
        HttpSettings {
            max_connections_per_host: http.max_connections_per_host,
            max_keepalive: http.max_keepalive,
            keepalive_expiry: Duration::from_secs(http.keepalive_expiry_seconds),
            connect_timeout: Duration::from_secs(http.connect_timeout_seconds),
            read_timeout: Duration::from_secs(
                timeout_override_seconds.unwrap_or(http.read_timeout_seconds),
            ),
            http2_enabled: http.http2_enabled,
            retry_attempts: 5,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Seam for the discoverer and executor, so tests can script page responses
/// without a network.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch one page. `Err` only for fail-fast conditions (open breaker,
    /// cancellation); every attempted request comes back as a `PageResponse`,
    /// successful or not, so it can be logged.
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> ExtractResult<PageResponse>;
}

/// Build the canonical request for (endpoint, bucket, modality, page).
pub fn build_page_request(
    base_url: &str,
    endpoint: &EndpointConfig,
    bucket: DateBucket,
    modality: Option<i64>,
    page: u32,
) -> PageRequest {
    let mut parameters = ArbitraryJson::new();
    parameters.insert(
        endpoint.date_params[0].clone(),
        Value::String(bucket.start.format(WIRE_DATE_FORMAT).to_string()),
    );
    parameters.insert(
        endpoint.date_params[1].clone(),
        Value::String(bucket.end.format(WIRE_DATE_FORMAT).to_string()),
    );
    parameters.insert(PAGE_PARAM.to_string(), Value::from(page));
    parameters.insert(PAGE_SIZE_PARAM.to_string(), Value::from(endpoint.page_size));
    if let Some(m) = modality {
        parameters.insert(MODALITY_PARAM.to_string(), Value::from(m));
    }
    let url = format!(
        "{}{}?{}",
        base_url.trim_end_matches('/'),
        endpoint.path,
        canonical_query(&parameters)
    );
    PageRequest {
        endpoint_name: endpoint.name.clone(),
        url,
        parameters,
        data_date: bucket.start,
        page,
        page_size: endpoint.page_size,
    }
}

fn canonical_query(parameters: &ArbitraryJson) -> String {
    let mut pairs: Vec<(&String, String)> = parameters
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k, rendered)
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

pub struct PncpClient {
    http: reqwest::Client,
    settings: HttpSettings,
    limiter: Arc<AdaptiveLimiter>,
    breakers: Arc<BreakerRegistry>,
}

impl PncpClient {
    pub fn new(
        settings: HttpSettings,
        limiter: Arc<AdaptiveLimiter>,
        breakers: Arc<BreakerRegistry>,
    ) -> ExtractResult<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(settings.max_keepalive.min(settings.max_connections_per_host))
            .pool_idle_timeout(settings.keepalive_expiry)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.read_timeout)
            .user_agent(concat!("baliza/", env!("CARGO_PKG_VERSION")));
        if !settings.http2_enabled {
            builder = builder.http1_only();
        }
        let http = builder
            .build()
            .map_err(|e| ExtractError::Config(format!("HTTP client could not be built: {}", e)))?;
        Ok(PncpClient { http, settings, limiter, breakers })
    }

    fn backoff_delay(&self, completed_attempts: u32) -> Duration {
        let base = self.settings.retry_base_delay;
        let shift = completed_attempts.min(6);
        let jitter_cap = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        base * (1u32 << shift) + Duration::from_millis(jitter)
    }
}

fn headers_to_json(headers: &reqwest::header::HeaderMap) -> ArbitraryJson {
    let mut map = ArbitraryJson::new();
    for (name, value) in headers {
        map.insert(
            name.to_string(),
            Value::String(value.to_str().unwrap_or_default().to_string()),
        );
    }
    map
}

#[async_trait]
impl PageFetcher for PncpClient {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> ExtractResult<PageResponse> {
        let started = Instant::now();
        let mut last_status: u16 = 0;
        let mut last_headers = ArbitraryJson::new();
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.settings.retry_attempts {
            if attempt > 1 {
                let delay = self.backoff_delay(attempt - 1);
                debug!(
                    "retrying {} page {} in {:?} (attempt {}/{})",
                    request.endpoint_name, request.page, delay, attempt, self.settings.retry_attempts
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
                }
            }

            if self.breakers.admit(&request.endpoint_name) == Admission::Rejected {
                return Err(ExtractError::CircuitOpen {
                    endpoint: request.endpoint_name.clone(),
                });
            }
            self.limiter.acquire(cancel).await?;

            match self.http.get(&request.url).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let headers = headers_to_json(resp.headers());
                    match status {
                        200 => match resp.bytes().await {
                            Ok(bytes) => {
                                self.limiter.on_success().await;
                                self.breakers.record_success(&request.endpoint_name);
                                let body = bytes.to_vec();
                                let envelope = PageEnvelope::decode(&body).unwrap_or_default();
                                return Ok(PageResponse {
                                    request: request.clone(),
                                    status,
                                    headers,
                                    body: Some(body),
                                    total_records: envelope.total_registros,
                                    total_pages: envelope.total_paginas,
                                    elapsed: started.elapsed(),
                                    error: None,
                                });
                            }
                            Err(e) => {
                                self.breakers.record_failure(&request.endpoint_name);
                                last_status = 0;
                                last_headers = headers;
                                last_error = Some(format!("body read failed: {}", e));
                            }
                        },
                        204 => {
                            self.limiter.on_success().await;
                            self.breakers.record_success(&request.endpoint_name);
                            return Ok(PageResponse {
                                request: request.clone(),
                                status,
                                headers,
                                body: None,
                                total_records: Some(0),
                                total_pages: Some(0),
                                elapsed: started.elapsed(),
                                error: None,
                            });
                        }
                        429 => {
                            self.limiter.on_throttle().await;
                            // The endpoint answered; throttling is pacing
                            // feedback, not endpoint ill health.
                            self.breakers.record_success(&request.endpoint_name);
                            last_status = status;
                            last_headers = headers;
                            last_error =
                                Some(ExtractError::TransientHttp("throttled (429)".to_string()).to_string());
                        }
                        500..=599 => {
                            self.limiter.on_server_error().await;
                            self.breakers.record_failure(&request.endpoint_name);
                            last_status = status;
                            last_headers = headers;
                            last_error = Some(
                                ExtractError::TransientHttp(format!("server error {}", status))
                                    .to_string(),
                            );
                        }
                        _ => {
                            self.breakers.record_success(&request.endpoint_name);
                            warn!(
                                "{} page {} rejected with {}",
                                request.endpoint_name, request.page, status
                            );
                            return Ok(PageResponse {
                                request: request.clone(),
                                status,
                                headers,
                                body: None,
                                total_records: None,
                                total_pages: None,
                                elapsed: started.elapsed(),
                                error: Some(ExtractError::PermanentHttp { status }.to_string()),
                            });
                        }
                    }
                }
                Err(e) => {
                    self.breakers.record_failure(&request.endpoint_name);
                    last_status = 0;
                    last_error = Some(ExtractError::TransientHttp(e.to_string()).to_string());
                }
            }
        }

        // Retries exhausted; hand back a loggable error result.
        Ok(PageResponse {
            request: request.clone(),
            status: last_status,
            headers: last_headers,
            body: None,
            total_records: None,
            total_pages: None,
            elapsed: started.elapsed(),
            error: last_error.or_else(|| Some("retries exhausted".to_string())),
        })
    }
}
