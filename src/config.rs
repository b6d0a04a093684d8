use std::collections::HashSet;
use std::fs;
use std::path::Path;
use serde_derive::Deserialize;
use crate::data_structures::Granularity;
use crate::error::{ExtractError, ExtractResult};

fn d_true() -> bool {
    true
}
fn d_base_url() -> String {
    "https://pncp.gov.br/api/consulta".to_string()
}
fn d_max_conn_total() -> usize {
    64
}
fn d_max_conn_host() -> usize {
    16
}
fn d_max_keepalive() -> usize {
    32
}
fn d_keepalive_expiry() -> u64 {
    90
}
fn d_connect_timeout() -> u64 {
    10
}
fn d_read_timeout() -> u64 {
    30
}
fn d_initial_rps() -> u32 {
    5
}
fn d_max_rps() -> u32 {
    20
}
fn d_min_rps() -> u32 {
    1
}
fn d_page_min() -> u32 {
    10
}
fn d_page_max() -> u32 {
    500
}

/// Declarative endpoint catalog plus HTTP tuning. Loaded once at startup and
/// treated as immutable for the rest of the run.
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "d_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub http: HttpSubConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct HttpSubConfig {
    #[serde(default = "d_max_conn_total")]
    pub max_connections_total: usize,
    #[serde(default = "d_max_conn_host")]
    pub max_connections_per_host: usize,
    #[serde(default = "d_max_keepalive")]
    pub max_keepalive: usize,
    #[serde(default = "d_keepalive_expiry")]
    pub keepalive_expiry_seconds: u64,
    #[serde(default = "d_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "d_read_timeout")]
    pub read_timeout_seconds: u64,
    #[serde(default = "d_true")]
    pub http2_enabled: bool,
    #[serde(default = "d_initial_rps")]
    pub initial_rps: u32,
    #[serde(default = "d_max_rps")]
    pub max_rps: u32,
    #[serde(default = "d_min_rps")]
    pub min_rps: u32,
}

impl Default for HttpSubConfig {
    fn default() -> Self {
        HttpSubConfig {
            max_connections_total: d_max_conn_total(),
            max_connections_per_host: d_max_conn_host(),
            max_keepalive: d_max_keepalive(),
            keepalive_expiry_seconds: d_keepalive_expiry(),
            connect_timeout_seconds: d_connect_timeout(),
            read_timeout_seconds: d_read_timeout(),
            http2_enabled: true,
            initial_rps: d_initial_rps(),
            max_rps: d_max_rps(),
            min_rps: d_min_rps(),
        }
    }
}

/// One entry of the endpoint catalog.
#[derive(Deserialize, Clone, Debug)]
pub struct EndpointConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "d_true")]
    pub active: bool,
    pub granularity: Granularity,
    pub page_size: u32,
    #[serde(default = "d_page_min")]
    pub page_size_min: u32,
    #[serde(default = "d_page_max")]
    pub page_size_max: u32,
    /// Inclusive start/end query parameter names, in that order.
    pub date_params: [String; 2],
    /// Non-empty: extraction expands one task per modality per time bucket.
    #[serde(default)]
    pub modalities: Vec<i64>,
    #[serde(default)]
    pub category: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> ExtractResult<Config> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ExtractError::Config(format!("config path '{}' could not be read: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> ExtractResult<Config> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|e| ExtractError::Config(format!("config could not be parsed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on catalog entries that would only blow up mid-run.
    fn validate(&self) -> ExtractResult<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for ep in &self.endpoints {
            if ep.name.trim().is_empty() {
                return Err(ExtractError::Config("endpoint with empty name".to_string()));
            }
            if !seen.insert(ep.name.as_str()) {
                return Err(ExtractError::Config(format!("duplicate endpoint name '{}'", ep.name)));
            }
            if ep.path.trim().is_empty() {
                return Err(ExtractError::Config(format!("endpoint '{}' has an empty path", ep.name)));
            }
            if !(ep.page_size_min <= ep.page_size && ep.page_size <= ep.page_size_max) {
                return Err(ExtractError::Config(format!(
                    "endpoint '{}' page size {} outside [{}, {}]",
                    ep.name, ep.page_size, ep.page_size_min, ep.page_size_max
                )));
            }
            if ep.modalities.iter().any(|m| *m <= 0) {
                return Err(ExtractError::Config(format!(
                    "endpoint '{}' modality codes must be positive integers",
                    ep.name
                )));
            }
            let [start, end] = &ep.date_params;
            if start.trim().is_empty() || end.trim().is_empty() || start == end {
                return Err(ExtractError::Config(format!(
                    "endpoint '{}' needs two distinct date parameter names",
                    ep.name
                )));
            }
        }
        if self.http.min_rps == 0 || self.http.min_rps > self.http.max_rps {
            return Err(ExtractError::Config(format!(
                "rps bounds invalid: min {} max {}",
                self.http.min_rps, self.http.max_rps
            )));
        }
        Ok(())
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn active_endpoints(&self) -> Vec<&EndpointConfig> {
        self.endpoints.iter().filter(|e| e.active).collect()
    }

    /// Active endpoints restricted to an optional name filter. Naming an
    /// unknown endpoint is a configuration error, not a silent no-op.
    pub fn select_endpoints(&self, filter: &[String]) -> ExtractResult<Vec<EndpointConfig>> {
        if filter.is_empty() {
            return Ok(self.active_endpoints().into_iter().cloned().collect());
        }
        let mut selected = Vec::new();
        for name in filter {
            match self.endpoint(name) {
                Some(ep) if ep.active => selected.push(ep.clone()),
                Some(_) => {
                    return Err(ExtractError::Config(format!(
                        "endpoint '{}' is disabled in the catalog",
                        name
                    )))
                }
                None => {
                    return Err(ExtractError::Config(format!("unknown endpoint '{}'", name)))
                }
            }
        }
        Ok(selected)
    }
}
