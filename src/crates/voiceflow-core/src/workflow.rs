//! Node and edge registry for one call flow
//!
//! A [`Workflow`] is immutable once built and shared between calls behind an
//! `Arc`; per-call state lives in the [`Session`](crate::session::Session).

use crate::config::Defaults;
use crate::edge::{BookingEdge, ConditionEdge, Edge, EdgeCondition, Operator, PassThrough, UnconditionalEdge};
use crate::error::{Result, WorkflowError};
use crate::llm::Llm;
use crate::nodes::{
    FallbackAgent, FirstMessageNode, GreetingRoutingAgent, Node, TransformationNode, WorkflowInitNode,
};
use crate::tools::{InitClient, KbSearch};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct Workflow {
    id: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Vec<Arc<dyn Edge>>>,
    start_node: String,
    fallback_node: String,
}

impl Workflow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            start_node: Defaults::GREETING_ROUTING_AGENT.to_string(),
            fallback_node: Defaults::FALLBACK_AGENT.to_string(),
        }
    }

    /// Node the cursor moves to once initialization is done
    pub fn with_start_node(mut self, node_id: impl Into<String>) -> Self {
        self.start_node = node_id.into();
        self
    }

    /// Node run when a failing node names no fallback of its own
    pub fn with_fallback_node(mut self, node_id: impl Into<String>) -> Self {
        self.fallback_node = node_id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_node(&self) -> &str {
        &self.start_node
    }

    pub fn fallback_node(&self) -> &str {
        &self.fallback_node
    }

    /// Register a node, replacing any node with the same id
    pub fn add_node(&mut self, node: impl Node + 'static) -> &mut Self {
        let id = node.id().to_string();
        if self.nodes.insert(id.clone(), Arc::new(node)).is_some() {
            debug!(node = %id, "Replaced node");
        }
        self
    }

    /// Append an edge after any already leaving the same source
    pub fn add_edge(&mut self, edge: impl Edge + 'static) -> &mut Self {
        self.edges
            .entry(edge.source().to_string())
            .or_default()
            .push(Arc::new(edge));
        self
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<dyn Node>> {
        self.nodes.get(node_id).cloned()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Edges leaving `node_id`, in declaration order
    pub fn edges_from(&self, node_id: &str) -> &[Arc<dyn Edge>] {
        self.edges.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Check the start and fallback nodes and every edge source exist
    ///
    /// Edge targets may be unregistered: reaching one is handled by the
    /// fallback path at run time.
    pub fn validate(&self) -> Result<()> {
        for id in [&self.start_node, &self.fallback_node] {
            if !self.has_node(id) {
                return Err(WorkflowError::NodeNotFound(id.clone()));
            }
        }
        if let Some(source) = self.edges.keys().find(|s| !self.has_node(s)) {
            return Err(WorkflowError::NodeNotFound(source.clone()));
        }
        Ok(())
    }

    pub async fn close(&self) {
        for node in self.nodes.values() {
            node.close().await;
        }
    }

    /// The salon booking flow
    ///
    /// ```text
    /// greeting_routing_agent ──booking_edge──► transformation_tool ──► fallback_agent
    ///          │                                        ▲                   │
    ///          └──HANDOVER──► handover_tool             └──next_node────────┘
    /// ```
    pub fn salon_booking(llm: Arc<dyn Llm>, init_client: Arc<dyn InitClient>, kb: Arc<dyn KbSearch>) -> Self {
        let mut workflow = Workflow::new("salon_booking");
        workflow
            .add_node(WorkflowInitNode::new(init_client))
            .add_node(FirstMessageNode::default())
            .add_node(GreetingRoutingAgent::new(Arc::clone(&llm)))
            .add_node(TransformationNode::new(kb))
            .add_node(FallbackAgent::new(llm));

        workflow
            .add_edge(BookingEdge::default())
            .add_edge(ConditionEdge::new(
                "handover_edge",
                Defaults::GREETING_ROUTING_AGENT,
                Defaults::HANDOVER_TOOL,
                EdgeCondition::output("detected_intent", Operator::Eq, json!("HANDOVER")),
            ))
            .add_edge(UnconditionalEdge::new(
                Defaults::TRANSFORMATION_TOOL,
                Defaults::FALLBACK_AGENT,
            ))
            .add_edge(
                ConditionEdge::new(
                    "fallback_to_booking",
                    Defaults::FALLBACK_AGENT,
                    Defaults::TRANSFORMATION_TOOL,
                    EdgeCondition::output("next_node", Operator::Eq, json!(Defaults::TRANSFORMATION_TOOL)),
                )
                .with_pass_through(PassThrough::new("service_names").required()),
            );
        workflow
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<_> = self.node_ids().collect();
        nodes.sort_unstable();
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("nodes", &nodes)
            .field("start_node", &self.start_node)
            .field("fallback_node", &self.fallback_node)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::tools::{StaticInitClient, StaticKbSearch};

    fn salon() -> Workflow {
        Workflow::salon_booking(
            Arc::new(ScriptedLlm::new()),
            Arc::new(StaticInitClient::new(json!({}))),
            Arc::new(StaticKbSearch::new()),
        )
    }

    #[test]
    fn test_salon_booking_graph() {
        let workflow = salon();
        assert!(workflow.validate().is_ok());
        for id in [
            Defaults::WORKFLOW_INIT,
            Defaults::FIRST_MESSAGE_MAKER,
            Defaults::GREETING_ROUTING_AGENT,
            Defaults::TRANSFORMATION_TOOL,
            Defaults::FALLBACK_AGENT,
        ] {
            assert!(workflow.has_node(id), "missing {}", id);
        }
        assert!(!workflow.has_node(Defaults::HANDOVER_TOOL));

        let targets: Vec<&str> = workflow
            .edges_from(Defaults::GREETING_ROUTING_AGENT)
            .iter()
            .map(|e| e.target())
            .collect();
        assert_eq!(targets, vec![Defaults::TRANSFORMATION_TOOL, Defaults::HANDOVER_TOOL]);
        assert_eq!(workflow.edges_from(Defaults::FALLBACK_AGENT).len(), 1);
        assert!(workflow.edges_from("nowhere").is_empty());
    }

    #[test]
    fn test_validate_requires_fallback() {
        let mut workflow = Workflow::new("bare");
        workflow.add_node(GreetingRoutingAgent::new(Arc::new(ScriptedLlm::new())));
        assert!(matches!(
            workflow.validate(),
            Err(WorkflowError::NodeNotFound(id)) if id == Defaults::FALLBACK_AGENT
        ));
    }

    #[test]
    fn test_edge_from_unknown_source_fails_validation() {
        let mut workflow = salon();
        workflow.add_edge(UnconditionalEdge::new("ghost", Defaults::FALLBACK_AGENT));
        assert!(workflow.validate().is_err());
    }
}
