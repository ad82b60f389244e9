//! Routing between nodes
//!
//! After a node succeeds the executor walks the edges leaving it in
//! declaration order and takes the first one whose predicate matches the
//! node's output. Edges may also reshape the data handed to the target
//! through pass-through fields.

use crate::config::Defaults;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Comparison applied between an actual value and the expected one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    /// Substring, array element or object key
    Contains,
    /// Inverse of `Contains`: actual is found inside expected
    In,
    Truthy,
    Falsy,
}

impl Operator {
    pub fn apply(self, actual: Option<&Value>, expected: &Value) -> bool {
        let actual = actual.unwrap_or(&Value::Null);
        match self {
            Operator::Eq => actual == expected,
            Operator::Ne => actual != expected,
            Operator::Gt => compare(actual, expected).map_or(false, |o| o.is_gt()),
            Operator::Lt => compare(actual, expected).map_or(false, |o| o.is_lt()),
            Operator::Contains => contains(actual, expected),
            Operator::In => contains(expected, actual),
            Operator::Truthy => is_truthy(actual),
            Operator::Falsy => !is_truthy(actual),
        }
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => actual.as_f64()?.partial_cmp(&expected.as_f64()?),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
        (Value::Array(items), n) => items.contains(n),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Declarative traversal predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    Static {
        value: bool,
    },
    /// Tests a workflow variable, falling back to the call's dynamic variables
    Variable {
        name: String,
        operator: Operator,
        #[serde(default)]
        expected: Value,
    },
    /// Tests a field of the source node's output (dot paths allowed)
    Output {
        field: String,
        operator: Operator,
        #[serde(default)]
        expected: Value,
    },
}

impl EdgeCondition {
    pub fn output(field: impl Into<String>, operator: Operator, expected: Value) -> Self {
        EdgeCondition::Output {
            field: field.into(),
            operator,
            expected,
        }
    }

    pub fn variable(name: impl Into<String>, operator: Operator, expected: Value) -> Self {
        EdgeCondition::Variable {
            name: name.into(),
            operator,
            expected,
        }
    }

    pub fn evaluate(&self, ctx: &EdgeContext<'_>) -> bool {
        match self {
            EdgeCondition::Static { value } => *value,
            EdgeCondition::Variable {
                name,
                operator,
                expected,
            } => operator.apply(ctx.variable(name).as_ref(), expected),
            EdgeCondition::Output {
                field,
                operator,
                expected,
            } => operator.apply(extract_field(ctx.output, field), expected),
        }
    }
}

/// What an edge predicate can look at
#[derive(Clone, Copy)]
pub struct EdgeContext<'a> {
    pub output: &'a Map<String, Value>,
    pub session: &'a Session,
}

impl<'a> EdgeContext<'a> {
    pub fn new(output: &'a Map<String, Value>, session: &'a Session) -> Self {
        Self { output, session }
    }

    pub fn output_str(&self, field: &str) -> Option<&'a str> {
        extract_field(self.output, field).and_then(Value::as_str)
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.session
            .get_workflow_variable(name)
            .cloned()
            .or_else(|| self.session.get_dynamic_variable(name))
    }
}

/// Copies one output field into the target's input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassThrough {
    /// Dot path into the source output
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub required: bool,
}

impl PassThrough {
    pub fn new(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            target_field: field.clone(),
            source_field: field,
            required: false,
        }
    }

    pub fn renamed(source_field: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_field: source_field.into(),
            target_field: target_field.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// The field's value, or `None` when absent, null or empty
    fn resolve<'a>(&self, output: &'a Map<String, Value>) -> Option<&'a Value> {
        extract_field(output, &self.source_field).filter(|v| !is_blank(v))
    }
}

/// Walk a dot path such as `booking.services.0`
pub fn extract_field<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Map a source output through pass-through fields
///
/// With no pass-through fields the output is forwarded unchanged. Missing
/// required fields come through as null with a `_missing_{target}` marker.
pub fn apply_pass_through(fields: &[PassThrough], output: &Map<String, Value>) -> Map<String, Value> {
    if fields.is_empty() {
        return output.clone();
    }
    let mut data = Map::new();
    for field in fields {
        match field.resolve(output) {
            Some(value) => {
                data.insert(field.target_field.clone(), value.clone());
            }
            None => {
                data.insert(field.target_field.clone(), Value::Null);
                if field.required {
                    data.insert(format!("_missing_{}", field.target_field), Value::Bool(true));
                }
            }
        }
    }
    data
}

pub trait Edge: Send + Sync {
    fn id(&self) -> &str;

    fn source(&self) -> &str;

    fn target(&self) -> &str;

    fn should_traverse(&self, ctx: &EdgeContext<'_>) -> bool;

    fn pass_through(&self) -> &[PassThrough] {
        &[]
    }

    /// Input for the target node
    fn transform_data(&self, output: &Map<String, Value>) -> Map<String, Value> {
        apply_pass_through(self.pass_through(), output)
    }

    /// Target names of required fields the output does not provide
    fn missing_required_fields(&self, output: &Map<String, Value>) -> Vec<String> {
        self.pass_through()
            .iter()
            .filter(|f| f.required && f.resolve(output).is_none())
            .map(|f| f.target_field.clone())
            .collect()
    }
}

impl fmt::Debug for dyn Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Edge({}: {} -> {})", self.id(), self.source(), self.target())
    }
}

/// Edge traversed when its [`EdgeCondition`] holds
#[derive(Debug, Clone)]
pub struct ConditionEdge {
    id: String,
    source: String,
    target: String,
    condition: EdgeCondition,
    pass_through: Vec<PassThrough>,
}

impl ConditionEdge {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition,
            pass_through: Vec::new(),
        }
    }

    pub fn with_pass_through(mut self, field: PassThrough) -> Self {
        self.pass_through.push(field);
        self
    }
}

impl Edge for ConditionEdge {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn should_traverse(&self, ctx: &EdgeContext<'_>) -> bool {
        self.condition.evaluate(ctx)
    }

    fn pass_through(&self) -> &[PassThrough] {
        &self.pass_through
    }
}

/// Always traversed
#[derive(Debug, Clone)]
pub struct UnconditionalEdge {
    id: String,
    source: String,
    target: String,
    pass_through: Vec<PassThrough>,
}

impl UnconditionalEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let (source, target) = (source.into(), target.into());
        Self {
            id: format!("{}_to_{}", source, target),
            source,
            target,
            pass_through: Vec::new(),
        }
    }

    pub fn with_pass_through(mut self, field: PassThrough) -> Self {
        self.pass_through.push(field);
        self
    }
}

impl Edge for UnconditionalEdge {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn should_traverse(&self, _ctx: &EdgeContext<'_>) -> bool {
        true
    }

    fn pass_through(&self) -> &[PassThrough] {
        &self.pass_through
    }
}

pub type EdgePredicate = Arc<dyn Fn(&EdgeContext<'_>) -> bool + Send + Sync>;

/// Edge with an arbitrary predicate
#[derive(Clone)]
pub struct ConditionalEdge {
    id: String,
    source: String,
    target: String,
    predicate: EdgePredicate,
    pass_through: Vec<PassThrough>,
}

impl ConditionalEdge {
    pub fn new<F>(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&EdgeContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            predicate: Arc::new(predicate),
            pass_through: Vec::new(),
        }
    }

    pub fn with_pass_through(mut self, field: PassThrough) -> Self {
        self.pass_through.push(field);
        self
    }
}

impl Edge for ConditionalEdge {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn should_traverse(&self, ctx: &EdgeContext<'_>) -> bool {
        (self.predicate)(ctx)
    }

    fn pass_through(&self) -> &[PassThrough] {
        &self.pass_through
    }
}

/// Greeting to transformation, once the caller wants to book
///
/// Traversed when the agent called its routing tool (`next_edge` is
/// `"booking_edge"`) or keyword detection found a BOOK intent. The target
/// receives `service_names` plus the center's booking rules.
#[derive(Debug, Clone)]
pub struct BookingEdge {
    source: String,
    target: String,
    pass_through: Vec<PassThrough>,
    center_allows_multiple: bool,
    ask_for_more_services: String,
}

impl Default for BookingEdge {
    fn default() -> Self {
        Self::new(Defaults::GREETING_ROUTING_AGENT, Defaults::TRANSFORMATION_TOOL)
    }
}

impl BookingEdge {
    pub const ID: &'static str = "booking_edge";

    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            pass_through: vec![PassThrough::new("service_names").required()],
            center_allows_multiple: true,
            ask_for_more_services: "ask_initially".to_string(),
        }
    }

    pub fn with_booking_rules(mut self, center_allows_multiple: bool, ask_for_more_services: impl Into<String>) -> Self {
        self.center_allows_multiple = center_allows_multiple;
        self.ask_for_more_services = ask_for_more_services.into();
        self
    }
}

impl Edge for BookingEdge {
    fn id(&self) -> &str {
        Self::ID
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn should_traverse(&self, ctx: &EdgeContext<'_>) -> bool {
        ctx.output_str("next_edge") == Some(Self::ID) || ctx.output_str("detected_intent") == Some("BOOK")
    }

    fn pass_through(&self) -> &[PassThrough] {
        &self.pass_through
    }

    fn transform_data(&self, output: &Map<String, Value>) -> Map<String, Value> {
        let mut data = apply_pass_through(&self.pass_through, output);
        data.insert("center_allows_multiple".into(), Value::Bool(self.center_allows_multiple));
        data.insert(
            "ask_for_more_services".into(),
            Value::String(self.ask_for_more_services.clone()),
        );
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::dynamic_vars::DynamicVariables;
    use serde_json::json;

    fn session() -> Session {
        Session::with_id("edge-test", &Settings::in_memory()).unwrap()
    }

    fn output(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_operators() {
        assert!(Operator::Eq.apply(Some(&json!("BOOK")), &json!("BOOK")));
        assert!(Operator::Ne.apply(None, &json!("BOOK")));
        assert!(Operator::Gt.apply(Some(&json!(3)), &json!(2.5)));
        assert!(!Operator::Lt.apply(Some(&json!("x")), &json!(2)));
        assert!(Operator::Contains.apply(Some(&json!("hot stone massage")), &json!("stone")));
        assert!(Operator::Contains.apply(Some(&json!(["a", "b"])), &json!("b")));
        assert!(Operator::In.apply(Some(&json!("FAQ")), &json!(["FAQ", "UNKNOWN"])));
        assert!(Operator::Truthy.apply(Some(&json!([1])), &Value::Null));
        assert!(Operator::Falsy.apply(Some(&json!("")), &Value::Null));
        assert!(Operator::Falsy.apply(None, &Value::Null));
    }

    #[test]
    fn test_extract_dot_path() {
        let data = output(json!({"booking": {"services": [{"name": "Facial"}]}}));
        assert_eq!(extract_field(&data, "booking.services.0.name"), Some(&json!("Facial")));
        assert_eq!(extract_field(&data, "booking.services.3.name"), None);
        assert_eq!(extract_field(&data, "booking.missing"), None);
    }

    #[test]
    fn test_condition_reads_variables_then_dynamic_vars() {
        let mut session = session();
        session.set_workflow_variable("retries", json!(2));
        session.set_dynamic_variables(DynamicVariables {
            agent_name: "Nova".into(),
            ..DynamicVariables::default()
        });
        let out = Map::new();
        let ctx = EdgeContext::new(&out, &session);

        assert!(EdgeCondition::variable("agent_name", Operator::Eq, json!("Nova")).evaluate(&ctx));

        assert!(EdgeCondition::variable("retries", Operator::Lt, json!(3)).evaluate(&ctx));
        assert!(EdgeCondition::Static { value: true }.evaluate(&ctx));
        assert!(!EdgeCondition::variable("unset", Operator::Truthy, Value::Null).evaluate(&ctx));
    }

    #[test]
    fn test_condition_deserializes() {
        let condition: EdgeCondition = serde_json::from_value(json!({
            "type": "output",
            "field": "detected_intent",
            "operator": "eq",
            "expected": "HANDOVER"
        }))
        .unwrap();
        assert_eq!(
            condition,
            EdgeCondition::output("detected_intent", Operator::Eq, json!("HANDOVER"))
        );
    }

    #[test]
    fn test_booking_edge_matches_tool_route_or_intent() {
        let session = session();
        let edge = BookingEdge::default();

        let routed = output(json!({"next_edge": "booking_edge", "detected_intent": "FAQ"}));
        assert!(edge.should_traverse(&EdgeContext::new(&routed, &session)));

        let keyword = output(json!({"next_edge": null, "detected_intent": "BOOK"}));
        assert!(edge.should_traverse(&EdgeContext::new(&keyword, &session)));

        let other = output(json!({"next_edge": null, "detected_intent": "CANCEL"}));
        assert!(!edge.should_traverse(&EdgeContext::new(&other, &session)));
    }

    #[test]
    fn test_booking_edge_transform_and_missing_fields() {
        let edge = BookingEdge::default().with_booking_rules(false, "never");

        let full = output(json!({"service_names": ["Facial"], "response": "ok"}));
        let data = edge.transform_data(&full);
        assert_eq!(data.get("service_names"), Some(&json!(["Facial"])));
        assert_eq!(data.get("center_allows_multiple"), Some(&json!(false)));
        assert_eq!(data.get("ask_for_more_services"), Some(&json!("never")));
        assert!(data.get("response").is_none());
        assert!(edge.missing_required_fields(&full).is_empty());

        let empty = output(json!({"service_names": []}));
        assert_eq!(edge.missing_required_fields(&empty), vec!["service_names"]);
        assert_eq!(edge.transform_data(&empty).get("_missing_service_names"), Some(&json!(true)));
    }

    #[test]
    fn test_unconditional_edge_forwards_output() {
        let session = session();
        let edge = UnconditionalEdge::new("a", "b");
        let out = output(json!({"x": 1}));
        assert_eq!(edge.id(), "a_to_b");
        assert!(edge.should_traverse(&EdgeContext::new(&out, &session)));
        assert_eq!(edge.transform_data(&out), out);
    }

    #[test]
    fn test_conditional_edge_closure() {
        let session = session();
        let edge = ConditionalEdge::new("switched", "fallback_agent", "x", |ctx| {
            ctx.output.get("task_switched") == Some(&Value::Bool(true))
        })
        .with_pass_through(PassThrough::renamed("detected_intent", "intent"));

        let out = output(json!({"task_switched": true, "detected_intent": "CANCEL"}));
        assert!(edge.should_traverse(&EdgeContext::new(&out, &session)));
        assert_eq!(edge.transform_data(&out).get("intent"), Some(&json!("CANCEL")));
    }
}
