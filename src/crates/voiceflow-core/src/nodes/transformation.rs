use super::{timed, ExecutionContext, Node, NodeConfig, NodeKind, NodeOutput};
use crate::config::Defaults;
use crate::error::{Result, WorkflowError};
use crate::intent::Intent;
use crate::session::Session;
use crate::task::TaskPriority;
use crate::tools::{KbQuery, KbSearch};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Name of the background lookup spawned on the session
pub const KB_SEARCH_TASK: &str = "kb_search";

/// Turns the requested services into a booking plan
///
/// Requires a non-empty `service_names` input. Reuses the in-progress
/// booking task if there is one, otherwise creates and starts a new one.
/// The plan shape follows the center's booking rules from the dynamic
/// variables. Service codes are resolved in the background and land in the
/// `kb_service_codes` workflow variable once collected.
pub struct TransformationNode {
    id: String,
    config: NodeConfig,
    kb: Arc<dyn KbSearch>,
    kb_search_enabled: bool,
}

impl TransformationNode {
    pub fn new(kb: Arc<dyn KbSearch>) -> Self {
        Self {
            id: Defaults::TRANSFORMATION_TOOL.to_string(),
            config: NodeConfig::default().with_fallback(Defaults::FALLBACK_AGENT),
            kb,
            kb_search_enabled: true,
        }
    }

    pub fn with_kb_search(mut self, enabled: bool) -> Self {
        self.kb_search_enabled = enabled;
        self
    }

    async fn run(&self, input: &Map<String, Value>, session: &mut Session) -> Result<Map<String, Value>> {
        let service_names: Vec<String> = input
            .get("service_names")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if service_names.is_empty() {
            return Err(WorkflowError::Validation(
                "no service names provided for booking".into(),
            ));
        }

        let (multiple_services, multiple_therapists) = session
            .dynamic_vars()
            .map(|v| {
                (
                    v.center_allows_multiple_service_booking,
                    v.center_allows_multiple_therapist_booking,
                )
            })
            .unwrap_or((false, false));

        let mut task = match session.get_current_task().await {
            Some(task) if task.intent == Intent::Book => task,
            _ => {
                let created = session
                    .create_task(
                        Intent::Book,
                        format!("Book services: {}", service_names.join(", ")),
                        TaskPriority::Normal,
                    )
                    .await;
                session.start_task(&created.task_id).await?.unwrap_or(created)
            }
        };
        for name in &service_names {
            task.add_service("", name.as_str(), Map::new());
        }
        let plan = task.create_plan(multiple_services, multiple_therapists).clone();
        session.update_task(task.clone()).await;
        debug!(task_id = %task.task_id, steps = plan.len(), "Booking plan built");

        let kb_search_initiated = self.kb_search_enabled;
        if kb_search_initiated {
            let kb = Arc::clone(&self.kb);
            let query = KbQuery::new(service_names.clone()).scoped(session.dynamic_vars());
            session.spawn_background(KB_SEARCH_TASK, async move {
                let codes = kb.search(&query).await?;
                let mut vars = Map::new();
                vars.insert("kb_service_codes".into(), Value::Object(codes));
                Ok(vars)
            });
        }

        let mut output = Map::new();
        output.insert("task_id".into(), Value::String(task.task_id.clone()));
        output.insert("task_state".into(), json!(task.state));
        output.insert("plan".into(), serde_json::to_value(&plan)?);
        output.insert("service_names".into(), json!(service_names));
        output.insert("allows_multiple_services".into(), Value::Bool(multiple_services));
        output.insert("allows_multiple_therapists".into(), Value::Bool(multiple_therapists));
        output.insert("kb_search_initiated".into(), Value::Bool(kb_search_initiated));
        Ok(output)
    }
}

#[async_trait]
impl Node for TransformationNode {
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
        timed(&self.id, self.run(&input, session)).await
    }
}
