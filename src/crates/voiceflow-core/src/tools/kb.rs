use super::{build_client, is_retryable, read_json};
use crate::config::EndpointConfig;
use crate::dynamic_vars::DynamicVariables;
use crate::error::{Result, WorkflowError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Service names to resolve, scoped to one center
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KbQuery {
    pub service_names: Vec<String>,
    pub org_id: String,
    pub center_id: String,
}

impl KbQuery {
    pub fn new(service_names: Vec<String>) -> Self {
        Self {
            service_names,
            ..Self::default()
        }
    }

    /// Scope the query to the call's org and center
    pub fn scoped(mut self, vars: Option<&DynamicVariables>) -> Self {
        if let Some(vars) = vars {
            self.org_id = vars.org_id.clone();
            self.center_id = vars.center_id.clone();
        }
        self
    }
}

/// Resolves service names to catalogue codes
///
/// The result maps each resolved name to its code. Names the knowledge base
/// does not know are left out rather than failing the whole lookup.
#[async_trait]
pub trait KbSearch: Send + Sync {
    async fn search(&self, query: &KbQuery) -> Result<Map<String, Value>>;
}

/// Deterministic offline catalogue
///
/// Unknown names get a stable `ZENIDnnnn` code derived from the name.
#[derive(Debug, Clone, Default)]
pub struct StaticKbSearch {
    codes: HashMap<String, String>,
}

impl StaticKbSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, name: impl Into<String>, code: impl Into<String>) -> Self {
        self.codes.insert(name.into().to_lowercase(), code.into());
        self
    }

    fn code_for(&self, name: &str) -> String {
        let key = name.to_lowercase();
        self.codes.get(&key).cloned().unwrap_or_else(|| {
            // FNV-1a keeps codes stable across runs
            let hash = key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
            });
            format!("ZENID{:04}", hash % 10_000)
        })
    }
}

#[async_trait]
impl KbSearch for StaticKbSearch {
    async fn search(&self, query: &KbQuery) -> Result<Map<String, Value>> {
        Ok(query
            .service_names
            .iter()
            .map(|name| (name.clone(), Value::String(self.code_for(name))))
            .collect())
    }
}

/// Knowledge-base search endpoint, one request per service name
#[derive(Debug, Clone)]
pub struct HttpKbSearch {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpKbSearch {
    pub fn new(url: impl Into<String>, endpoints: &EndpointConfig, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: build_client(endpoints.http_timeout())?,
            url: url.into(),
            retry,
        })
    }

    pub fn from_endpoints(endpoints: &EndpointConfig, retry: RetryPolicy) -> Result<Self> {
        let url = endpoints
            .kb_search_url
            .clone()
            .ok_or_else(|| WorkflowError::Config("endpoints.kb_search_url is not set".into()))?;
        Self::new(url, endpoints, retry)
    }

    async fn lookup_once(&self, name: &str, query: &KbQuery) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .header("x-org-id", &query.org_id)
            .header("center_id", &query.center_id)
            .json(&json!({
                "query": name,
                "search_type": "service",
                "limit": 1,
            }))
            .send()
            .await?;
        read_json(response, "KB search").await
    }
}

/// First hit's `service_id`, accepting `service_code` as an alias
fn first_code(body: &Value) -> Option<String> {
    let hit = body.get("results")?.as_array()?.first()?;
    hit.get("service_id")
        .or_else(|| hit.get("service_code"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl KbSearch for HttpKbSearch {
    async fn search(&self, query: &KbQuery) -> Result<Map<String, Value>> {
        let mut codes = Map::new();
        for name in &query.service_names {
            let body = self
                .retry
                .run(|| self.lookup_once(name, query), is_retryable)
                .await?;
            match first_code(&body) {
                Some(code) => {
                    debug!(service = %name, code = %code, "Resolved service");
                    codes.insert(name.clone(), Value::String(code));
                }
                None => warn!(service = %name, "No KB match for service"),
            }
        }
        Ok(codes)
    }
}
