use super::{timed, ExecutionContext, Node, NodeConfig, NodeKind, NodeOutput};
use crate::config::Defaults;
use crate::dynamic_vars::DynamicVariables;
use crate::error::{Result, WorkflowError};
use crate::session::Session;
use crate::tools::{CallContext, InitClient};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

const REQUIRED_PARAMS: [&str; 4] = ["caller_id", "center_id", "org_id", "agent_id"];

/// Loads the call's dynamic variables and conversation overrides
///
/// Input: a serialized [`CallContext`]. Output: `dynamic_variables`,
/// `conversation_config` and `raw_response`. The session gets the dynamic
/// variables plus the `conversation_config` and `first_message_template`
/// workflow variables.
pub struct WorkflowInitNode {
    id: String,
    config: NodeConfig,
    client: Arc<dyn InitClient>,
}

impl WorkflowInitNode {
    pub fn new(client: Arc<dyn InitClient>) -> Self {
        Self {
            id: Defaults::WORKFLOW_INIT.to_string(),
            config: NodeConfig::default(),
            client,
        }
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    async fn run(&self, input: Map<String, Value>, session: &mut Session) -> Result<Map<String, Value>> {
        let missing: Vec<&str> = REQUIRED_PARAMS
            .into_iter()
            .filter(|key| super::input_str(&input, key).is_empty())
            .collect();
        if !missing.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "missing required parameters: {}",
                missing.join(", ")
            )));
        }
        let call: CallContext = serde_json::from_value(Value::Object(input))
            .map_err(|e| WorkflowError::Validation(format!("malformed call context: {}", e)))?;

        let raw = self.client.fetch(&call).await?;
        let vars = fill_call_identity(DynamicVariables::from_api_response(&raw), &call);

        let conversation_config = raw
            .get("conversation_config_override")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let template = conversation_config
            .pointer("/agent/first_message")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string);

        let dynamic_variables = serde_json::to_value(&vars)?;
        session.set_dynamic_variables(vars);
        session.set_workflow_variable("conversation_config", conversation_config.clone());
        if let Some(template) = template {
            session.set_workflow_variable("first_message_template", Value::String(template));
        }
        info!(
            session_id = %session.session_id(),
            center_id = %call.center_id,
            "Call initialized"
        );

        let mut output = Map::new();
        output.insert("dynamic_variables".into(), dynamic_variables);
        output.insert("conversation_config".into(), conversation_config);
        output.insert("raw_response".into(), raw);
        Ok(output)
    }
}

/// The init API may omit identifiers the bridge already knows
fn fill_call_identity(mut vars: DynamicVariables, call: &CallContext) -> DynamicVariables {
    for (field, value) in [
        (&mut vars.caller_id, &call.caller_id),
        (&mut vars.center_id, &call.center_id),
        (&mut vars.org_id, &call.org_id),
        (&mut vars.agent_id, &call.agent_id),
        (&mut vars.called_number, &call.called_number),
    ] {
        if field.is_empty() {
            field.clone_from(value);
        }
    }
    if vars.call_sid.is_none() {
        vars.call_sid = call.call_sid.clone();
    }
    vars
}

#[async_trait]
impl Node for WorkflowInitNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Tool
    }

    fn config(&self) -> &NodeConfig {
        &self.config
    }

    async fn execute(
        &self,
        input: Map<String, Value>,
        session: &mut Session,
        _ctx: &ExecutionContext,
    ) -> NodeOutput {
        timed(&self.id, self.run(input, session)).await
    }

    async fn close(&self) {
        self.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::nodes::ErrorKind;
    use crate::tools::StaticInitClient;
    use serde_json::json;

    fn call_input() -> Map<String, Value> {
        match serde_json::to_value(CallContext::new("+15550100", "center-1", "org-9", "agent-3")) {
            Ok(Value::Object(map)) => map,
            _ => unreachable!(),
        }
    }

    fn node(payload: Value) -> WorkflowInitNode {
        WorkflowInitNode::new(Arc::new(StaticInitClient::new(payload)))
    }

    #[tokio::test]
    async fn test_init_sets_dynamic_variables_and_template() {
        let mut session = Session::with_id("init-test", &Settings::in_memory()).unwrap();
        let node = node(json!({
            "dynamic_variables": {
                "guest_first_name": "Ana",
                "is_new_user": false,
                "center_name": "Spa One"
            },
            "conversation_config_override": {
                "agent": {"first_message": "Welcome to {{center_name}}!"}
            }
        }));

        let output = node
            .execute(call_input(), &mut session, &ExecutionContext::new("wf", 0))
            .await;
        assert!(output.success, "{:?}", output.error);

        let vars = session.dynamic_vars().unwrap();
        assert_eq!(vars.guest_first_name, "Ana");
        assert_eq!(vars.center_id, "center-1");
        assert_eq!(vars.caller_id, "+15550100");
        assert_eq!(
            session.get_workflow_variable("first_message_template"),
            Some(&json!("Welcome to {{center_name}}!"))
        );
        assert_eq!(output.get("dynamic_variables").unwrap()["center_name"], "Spa One");
    }

    #[tokio::test]
    async fn test_missing_params_are_validation_failures() {
        let mut session = Session::with_id("init-test", &Settings::in_memory()).unwrap();
        let mut input = call_input();
        input.remove("org_id");
        input.insert("agent_id".into(), json!(""));

        let output = node(json!({}))
            .execute(input, &mut session, &ExecutionContext::new("wf", 0))
            .await;
        assert!(!output.success);
        assert_eq!(output.error_kind, Some(ErrorKind::Validation));
        let error = output.error.unwrap();
        assert!(error.contains("org_id"));
        assert!(error.contains("agent_id"));
        assert!(session.dynamic_vars().is_none());
    }
}
