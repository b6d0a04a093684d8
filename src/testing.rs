//! Shared test support: scripted page fetchers and scratch infrastructure.
//!
//! Compiled only for tests. The mock fetcher sits behind the same
//! [`PageFetcher`] seam the real client implements, so discovery, executor
//! and coordinator tests exercise the production pipeline end to end against
//! a scripted server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::PageFetcher;
use crate::config::{Config, EndpointConfig, HttpSubConfig};
use crate::data_structures::{
    ArbitraryJson, Granularity, PageRequest, PageResponse, RunStats,
};
use crate::error::{ExtractError, ExtractResult};
use crate::writer::Writer;

pub fn date(s: &str) -> chrono::NaiveDate {
    s.parse().unwrap()
}

pub fn endpoint_config(name: &str, granularity: Granularity, modalities: Vec<i64>) -> EndpointConfig {
    EndpointConfig {
        name: name.to_string(),
        path: format!("/v1/{}", name),
        active: true,
        granularity,
        page_size: 500,
        page_size_min: 10,
        page_size_max: 500,
        date_params: ["dataInicial".to_string(), "dataFinal".to_string()],
        modalities,
        category: None,
    }
}

pub fn catalog(endpoints: Vec<EndpointConfig>) -> Config {
    Config {
        base_url: "https://pncp.gov.br/api/consulta".to_string(),
        http: HttpSubConfig::default(),
        endpoints,
    }
}

pub fn page_body(total_records: i64, total_pages: i64, marker: &str) -> String {
    format!(
        r#"{{"totalRegistros": {}, "totalPaginas": {}, "data": ["{}"]}}"#,
        total_records, total_pages, marker
    )
}

pub async fn spawn_writer(
    dir: &tempfile::TempDir,
    run_id: &str,
) -> (Writer, Arc<RunStats>, CancellationToken) {
    let stats = Arc::new(RunStats::default());
    let cancel = CancellationToken::new();
    let writer = Writer::spawn(
        dir.path().join("test.db"),
        run_id.to_string(),
        stats.clone(),
        cancel.clone(),
        64,
    )
    .await
    .unwrap();
    (writer, stats, cancel)
}

/// One scripted outcome for a (endpoint, page) request.
#[derive(Clone, Debug)]
pub enum Scripted {
    /// 200 with the given pagination envelope.
    Page { total_records: i64, total_pages: i64, body: String },
    /// 200 whose body carries no usable pagination metadata.
    PageNoEnvelope { body: String },
    /// 204 success-with-no-data.
    NoContent,
    /// Completed HTTP response with this error status.
    Status(u16),
    /// No response at all (retries exhausted by the real client).
    Transport,
    /// Fail fast as if the endpoint's breaker were open.
    Open,
}

/// Scripted [`PageFetcher`]. Per-page scripts are consumed front to back
/// (so "fail once, then succeed" is expressible); endpoint defaults and a
/// global default answer everything else.
pub struct MockFetcher {
    per_page: Mutex<HashMap<(String, u32), Vec<Scripted>>>,
    per_endpoint: Mutex<HashMap<String, Scripted>>,
    default: Scripted,
    pub calls: AtomicUsize,
    calls_per_page: Mutex<HashMap<(String, u32), usize>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        MockFetcher {
            per_page: Mutex::new(HashMap::new()),
            per_endpoint: Mutex::new(HashMap::new()),
            default: Scripted::Page { total_records: 1, total_pages: 1, body: page_body(1, 1, "default") },
            calls: AtomicUsize::new(0),
            calls_per_page: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default(default: Scripted) -> Self {
        MockFetcher { default, ..Self::new() }
    }

    pub fn script_page(&self, endpoint: &str, page: u32, outcomes: Vec<Scripted>) {
        self.per_page
            .lock()
            .unwrap()
            .insert((endpoint.to_string(), page), outcomes);
    }

    pub fn script_endpoint(&self, endpoint: &str, outcome: Scripted) {
        self.per_endpoint
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), outcome);
    }

    pub fn calls_for(&self, endpoint: &str, page: u32) -> usize {
        *self
            .calls_per_page
            .lock()
            .unwrap()
            .get(&(endpoint.to_string(), page))
            .unwrap_or(&0)
    }

    fn next_outcome(&self, endpoint: &str, page: u32) -> Scripted {
        let key = (endpoint.to_string(), page);
        if let Some(queue) = self.per_page.lock().unwrap().get_mut(&key) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        if let Some(outcome) = self.per_endpoint.lock().unwrap().get(endpoint) {
            return outcome.clone();
        }
        self.default.clone()
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> ExtractResult<PageResponse> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_per_page
            .lock()
            .unwrap()
            .entry((request.endpoint_name.clone(), request.page))
            .or_insert(0) += 1;

        let outcome = self.next_outcome(&request.endpoint_name, request.page);
        let base = PageResponse {
            request: request.clone(),
            status: 0,
            headers: ArbitraryJson::new(),
            body: None,
            total_records: None,
            total_pages: None,
            elapsed: Duration::from_millis(1),
            error: None,
        };
        match outcome {
            Scripted::Page { total_records, total_pages, body } => Ok(PageResponse {
                status: 200,
                body: Some(body.into_bytes()),
                total_records: Some(total_records),
                total_pages: Some(total_pages),
                ..base
            }),
            Scripted::PageNoEnvelope { body } => Ok(PageResponse {
                status: 200,
                body: Some(body.into_bytes()),
                ..base
            }),
            Scripted::NoContent => Ok(PageResponse {
                status: 204,
                total_records: Some(0),
                total_pages: Some(0),
                ..base
            }),
            Scripted::Status(code) => Ok(PageResponse {
                status: code,
                error: Some(format!("scripted HTTP {}", code)),
                ..base
            }),
            Scripted::Transport => Ok(PageResponse {
                error: Some("scripted transport failure".to_string()),
                ..base
            }),
            Scripted::Open => Err(ExtractError::CircuitOpen {
                endpoint: request.endpoint_name.clone(),
            }),
        }
    }
}
