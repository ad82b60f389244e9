use super::{timed, ExecutionContext, Node, NodeConfig, NodeKind, NodeOutput};
use crate::config::Defaults;
use crate::dynamic_vars::DynamicVariables;
use crate::error::{Result, WorkflowError};
use crate::session::Session;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Greeting copy keyed by business hours and caller familiarity
///
/// `{guest_name}` is replaced with the caller's display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstMessageTemplates {
    #[serde(default = "default_outside_hours_new")]
    pub outside_hours_new: String,
    #[serde(default = "default_inside_hours_new")]
    pub inside_hours_new: String,
    #[serde(default = "default_outside_hours_existing")]
    pub outside_hours_existing: String,
    #[serde(default = "default_inside_hours_existing")]
    pub inside_hours_existing: String,
}

fn default_outside_hours_new() -> String {
    Defaults::FIRST_MESSAGE_OUTSIDE_HOURS_NEW.to_string()
}

fn default_inside_hours_new() -> String {
    Defaults::FIRST_MESSAGE_INSIDE_HOURS_NEW.to_string()
}

fn default_outside_hours_existing() -> String {
    Defaults::FIRST_MESSAGE_OUTSIDE_HOURS_EXISTING.to_string()
}

fn default_inside_hours_existing() -> String {
    Defaults::FIRST_MESSAGE_INSIDE_HOURS_EXISTING.to_string()
}

impl Default for FirstMessageTemplates {
    fn default() -> Self {
        Self {
            outside_hours_new: default_outside_hours_new(),
            inside_hours_new: default_inside_hours_new(),
            outside_hours_existing: default_outside_hours_existing(),
            inside_hours_existing: default_inside_hours_existing(),
        }
    }
}

impl FirstMessageTemplates {
    pub fn select(&self, outside_hours: bool, new_user: bool) -> &str {
        match (outside_hours, new_user) {
            (true, true) => &self.outside_hours_new,
            (true, false) => &self.outside_hours_existing,
            (false, true) => &self.inside_hours_new,
            (false, false) => &self.inside_hours_existing,
        }
    }

    /// The matching template with `{guest_name}` filled in
    pub fn render(&self, vars: &DynamicVariables) -> String {
        self.select(vars.is_outside_business_hours, vars.is_new_user)
            .replace("{guest_name}", &vars.get_guest_display_name())
    }
}

/// Fill `{{agent_name}}`-style placeholders of an operator-supplied greeting
pub fn render_configured(template: &str, vars: &DynamicVariables) -> String {
    let agent_name = if vars.agent_name.trim().is_empty() {
        Defaults::DEFAULT_AGENT_NAME
    } else {
        vars.agent_name.as_str()
    };
    template
        .replace("{{agent_name}}", agent_name)
        .replace("{{guest_name}}", &vars.get_guest_display_name())
        .replace("{{org_name}}", &vars.org_name)
        .replace("{{center_name}}", &vars.center_name)
}

/// Speaks the opening line of the call
///
/// A `first_message_template` workflow variable set during initialization
/// takes precedence over the built-in templates.
pub struct FirstMessageNode {
    id: String,
    config: NodeConfig,
    templates: FirstMessageTemplates,
}

impl Default for FirstMessageNode {
    fn default() -> Self {
        Self::new(FirstMessageTemplates::default())
    }
}

impl FirstMessageNode {
    pub fn new(templates: FirstMessageTemplates) -> Self {
        Self {
            id: Defaults::FIRST_MESSAGE_MAKER.to_string(),
            config: NodeConfig::default(),
            templates,
        }
    }

    fn run(&self, session: &mut Session) -> Result<Map<String, Value>> {
        let vars = session.dynamic_vars().cloned().ok_or_else(|| {
            WorkflowError::Validation("dynamic variables not set; run workflow_init first".into())
        })?;

        let configured = session
            .get_workflow_variable("first_message_template")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string);
        let message = match configured {
            Some(template) => render_configured(&template, &vars),
            None => self.templates.render(&vars),
        };

        session.add_assistant_message(message.clone());
        session.set_workflow_variable("customer_preferences", serde_json::to_value(&self.templates)?);
        debug!(
            outside_hours = vars.is_outside_business_hours,
            new_user = vars.is_new_user,
            "First message chosen"
        );

        let mut output = Map::new();
        output.insert("first_message".into(), Value::String(message.clone()));
        output.insert("response".into(), Value::String(message));
        output.insert(
            "is_outside_business_hours".into(),
            Value::Bool(vars.is_outside_business_hours),
        );
        output.insert("is_new_user".into(), Value::Bool(vars.is_new_user));
        Ok(output)
    }
}

#[async_trait]
impl Node for FirstMessageNode {
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
        _input: Map<String, Value>,
        session: &mut Session,
        _ctx: &ExecutionContext,
    ) -> NodeOutput {
        timed(&self.id, async { self.run(session) }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::memory::Role;
    use crate::nodes::ErrorKind;
    use serde_json::json;

    fn vars(outside_hours: bool, new_user: bool) -> DynamicVariables {
        DynamicVariables {
            guest_first_name: "Maya".into(),
            is_outside_business_hours: outside_hours,
            is_new_user: new_user,
            org_name: "Zen Group".into(),
            center_name: "Downtown".into(),
            ..DynamicVariables::default()
        }
    }

    #[test]
    fn test_template_matrix() {
        let templates = FirstMessageTemplates::default();
        assert_eq!(templates.render(&vars(false, true)), "Hey, how can I help you today?");
        assert_eq!(
            templates.render(&vars(false, false)),
            "Hey Maya, how can I help you today?"
        );
        assert!(templates.render(&vars(true, false)).starts_with("Hey Maya, you have reached outside"));
        assert!(templates.render(&vars(true, true)).starts_with("Hey, you have reached outside"));
    }

    #[test]
    fn test_configured_template_placeholders() {
        let rendered = render_configured(
            "Hi {{guest_name}}, {{agent_name}} from {{org_name}} {{center_name}} here.",
            &vars(false, false),
        );
        assert_eq!(rendered, "Hi Maya, Atlas from Zen Group Downtown here.");
    }

    #[tokio::test]
    async fn test_records_assistant_message() {
        let mut session = Session::with_id("first-message", &Settings::in_memory()).unwrap();
        session.set_dynamic_variables(vars(false, false));

        let output = FirstMessageNode::default()
            .execute(Map::new(), &mut session, &ExecutionContext::new("wf", 0))
            .await;
        assert!(output.success);
        assert_eq!(output.get_str("first_message"), Some("Hey Maya, how can I help you today?"));

        let history = session.get_llm_messages(None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Assistant);
        assert!(session.get_workflow_variable("customer_preferences").is_some());
    }

    #[tokio::test]
    async fn test_configured_template_wins() {
        let mut session = Session::with_id("first-message", &Settings::in_memory()).unwrap();
        session.set_dynamic_variables(vars(true, true));
        session.set_workflow_variable("first_message_template", json!("Welcome to {{center_name}}"));

        let output = FirstMessageNode::default()
            .execute(Map::new(), &mut session, &ExecutionContext::new("wf", 0))
            .await;
        assert_eq!(output.response(), Some("Welcome to Downtown"));
    }

    #[tokio::test]
    async fn test_requires_dynamic_variables() {
        let mut session = Session::with_id("first-message", &Settings::in_memory()).unwrap();
        let output = FirstMessageNode::default()
            .execute(Map::new(), &mut session, &ExecutionContext::new("wf", 0))
            .await;
        assert!(!output.success);
        assert_eq!(output.error_kind, Some(ErrorKind::Validation));
    }
}
