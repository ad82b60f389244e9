use super::{build_client, is_retryable, read_json};
use crate::config::EndpointConfig;
use crate::error::{Result, WorkflowError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// Identity of an incoming call as handed over by the telephony bridge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub caller_id: String,
    pub center_id: String,
    pub org_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub called_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
}

impl CallContext {
    pub fn new(
        caller_id: impl Into<String>,
        center_id: impl Into<String>,
        org_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            caller_id: caller_id.into(),
            center_id: center_id.into(),
            org_id: org_id.into(),
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    pub fn with_called_number(mut self, number: impl Into<String>) -> Self {
        self.called_number = number.into();
        self
    }

    pub fn with_call_sid(mut self, sid: impl Into<String>) -> Self {
        self.call_sid = Some(sid.into());
        self
    }
}

/// Fetches the per-call configuration payload
#[async_trait]
pub trait InitClient: Send + Sync {
    async fn fetch(&self, call: &CallContext) -> Result<Value>;

    /// Release pooled connections
    async fn close(&self) {}
}

/// `POST {init_url}?center_id=...` with the org id in `x-org-id`
#[derive(Debug, Clone)]
pub struct HttpInitClient {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpInitClient {
    pub fn new(url: impl Into<String>, endpoints: &EndpointConfig, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: build_client(endpoints.http_timeout())?,
            url: url.into(),
            retry,
        })
    }

    /// Client for the configured `init_url`
    pub fn from_endpoints(endpoints: &EndpointConfig, retry: RetryPolicy) -> Result<Self> {
        let url = endpoints
            .init_url
            .clone()
            .ok_or_else(|| WorkflowError::Config("endpoints.init_url is not set".into()))?;
        Self::new(url, endpoints, retry)
    }

    async fn post_once(&self, call: &CallContext) -> Result<Value> {
        let mut body = json!({
            "caller_id": call.caller_id,
            "agent_id": call.agent_id,
            "called_number": call.called_number,
        });
        if let Some(sid) = &call.call_sid {
            body["call_sid"] = Value::String(sid.clone());
        }

        let response = self
            .client
            .post(&self.url)
            .query(&[("center_id", call.center_id.as_str())])
            .header("x-org-id", &call.org_id)
            .json(&body)
            .send()
            .await?;
        read_json(response, "init API").await
    }
}

#[async_trait]
impl InitClient for HttpInitClient {
    async fn fetch(&self, call: &CallContext) -> Result<Value> {
        debug!(center_id = %call.center_id, caller_id = %call.caller_id, "Fetching call configuration");
        self.retry.run(|| self.post_once(call), is_retryable).await
    }
}

/// Returns the same payload for every call
#[derive(Debug, Clone, Default)]
pub struct StaticInitClient {
    payload: Value,
}

impl StaticInitClient {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

#[async_trait]
impl InitClient for StaticInitClient {
    async fn fetch(&self, _call: &CallContext) -> Result<Value> {
        Ok(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn call() -> CallContext {
        CallContext::new("+15550100", "center-1", "org-9", "agent-3")
            .with_called_number("+15550199")
            .with_call_sid("CA123")
    }

    fn endpoints() -> EndpointConfig {
        EndpointConfig::default()
    }

    #[test]
    fn test_call_context_deserializes_with_defaults() {
        let call: CallContext = serde_json::from_value(json!({
            "caller_id": "+1",
            "center_id": "c",
            "org_id": "o",
            "agent_id": "a"
        }))
        .unwrap();
        assert_eq!(call.called_number, "");
        assert!(call.call_sid.is_none());
    }

    #[tokio::test]
    async fn test_http_init_posts_call_identity() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/init")
            .match_query(Matcher::UrlEncoded("center_id".into(), "center-1".into()))
            .match_header("x-org-id", "org-9")
            .match_body(Matcher::PartialJson(json!({
                "caller_id": "+15550100",
                "agent_id": "agent-3",
                "call_sid": "CA123"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"dynamic_variables": {"guest_name": "Ana"}}"#)
            .create_async()
            .await;

        let client = HttpInitClient::new(
            format!("{}/init", server.url()),
            &endpoints(),
            RetryPolicy::none(),
        )
        .unwrap();
        let payload = client.fetch(&call()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(payload["dynamic_variables"]["guest_name"], "Ana");
    }

    #[tokio::test]
    async fn test_http_init_retries_server_errors() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/init")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let retry = RetryPolicy::new(2)
            .with_initial_interval_ms(1)
            .with_jitter(false);
        let client =
            HttpInitClient::new(format!("{}/init", server.url()), &endpoints(), retry).unwrap();
        let err = client.fetch(&call()).await.unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, WorkflowError::Http(_)));
    }

    #[tokio::test]
    async fn test_http_init_client_errors_are_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/init")
            .match_query(Matcher::Any)
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let retry = RetryPolicy::new(3).with_initial_interval_ms(1);
        let client =
            HttpInitClient::new(format!("{}/init", server.url()), &endpoints(), retry).unwrap();
        let err = client.fetch(&call()).await.unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, WorkflowError::External(_)));
    }

    #[test]
    fn test_from_endpoints_requires_url() {
        let err = HttpInitClient::from_endpoints(&endpoints(), RetryPolicy::none()).unwrap_err();
        assert!(matches!(err, WorkflowError::Config(_)));
    }
}
