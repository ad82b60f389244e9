//! System prompts for the agent nodes

use crate::dynamic_vars::DynamicVariables;
use crate::llm::{LlmMessage, ToolCall};
use serde_json::Value;

/// Tool the routing agents call once the caller has named what to book
pub const ROUTE_TO_BOOKING: &str = "route_to_booking";

/// Tool the agents call to transfer the caller to a person
pub const HANDOVER_CALL: &str = "HandoverCallToHuman";

pub fn greeting_prompt(vars: Option<&DynamicVariables>) -> String {
    let defaults = DynamicVariables::default();
    let vars = vars.unwrap_or(&defaults);
    let location = [vars.org_name.as_str(), vars.center_name.as_str()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    let multiple_services = if vars.should_ask_for_more_services() {
        "Once the caller names a service, ask whether they would like to add any more services."
    } else if vars.center_allows_multiple_service_booking {
        "The caller may book more than one service."
    } else {
        "Only one service can be booked at a time."
    };

    format!(
        "You are {agent}, a warm and professional voice receptionist at {location}.\n\
         \n\
         You can help callers book, reschedule or cancel appointments and answer \
         questions about services and policies. Only use information from this prompt \
         and the knowledge base. If you cannot help, say \"Let me connect you to a \
         member of our team\" and call {handover}.\n\
         \n\
         Caller: {guest}. Returning guest: {returning}.\n\
         \n\
         {multiple_services}\n\
         When the caller has named the services they want to book, call {route} with \
         their names in `service_names`.\n\
         \n\
         Ask one question at a time and keep every reply to one sentence. Never mention \
         internal ids or codes.",
        agent = vars.agent_name,
        location = if location.is_empty() { "the spa" } else { &location },
        handover = HANDOVER_CALL,
        guest = vars.get_guest_display_name(),
        returning = !vars.is_new_user,
        multiple_services = multiple_services,
        route = ROUTE_TO_BOOKING,
    )
}

/// What the fallback agent knows about the task in flight
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub current_task: Option<String>,
    pub task_state: String,
    pub current_step: Option<String>,
    pub pending_steps: Vec<String>,
    pub queue_count: usize,
    pub paused_count: usize,
    pub detected_intent: String,
    pub error_context: Option<String>,
}

pub fn fallback_prompt(ctx: &TaskContext) -> String {
    let mut prompt = format!(
        "You manage conversations that drift from the main flow. Acknowledge the \
         caller's new request naturally, decide whether it belongs to the current task, \
         and never lose track of unfinished tasks. When a switched-to request is done, \
         remind the caller about any paused task.\n\
         \n\
         Active task: {task}\n\
         Task state: {state}\n\
         Current step: {step}\n\
         Pending steps: [{pending}]\n\
         Tasks in queue: {queued}\n\
         Paused tasks: {paused}\n\
         Detected intent: {intent}\n\
         \n\
         Intents: BOOK, CANCEL, RESCHEDULE, FAQ, HANDOVER. Call {route} with \
         `service_names` when the caller wants to book; call {handover} when they ask \
         for a person.",
        task = ctx.current_task.as_deref().unwrap_or("None"),
        state = if ctx.task_state.is_empty() { "idle" } else { &ctx.task_state },
        step = ctx.current_step.as_deref().unwrap_or("None"),
        pending = ctx.pending_steps.join(", "),
        queued = ctx.queue_count,
        paused = ctx.paused_count,
        intent = ctx.detected_intent,
        route = ROUTE_TO_BOOKING,
        handover = HANDOVER_CALL,
    );
    if let Some(error) = &ctx.error_context {
        prompt.push_str(&format!(
            "\n\nThe previous step failed ({}). Apologize briefly only if the caller \
             noticed, then ask for whatever is still missing.",
            error
        ));
    }
    prompt
}

/// System prompt, then history, then the new utterance
pub fn conversation(system: String, history: Vec<LlmMessage>, user_input: &str) -> Vec<LlmMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(LlmMessage::system(system));
    messages.extend(history);
    if !user_input.is_empty() {
        messages.push(LlmMessage::user(user_input));
    }
    messages
}

/// `service_names` from a routing call, accepting a single `service_name`
pub fn service_names(call: &ToolCall) -> Vec<String> {
    let args = &call.arguments;
    match args.get("service_names") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(name)) if !name.trim().is_empty() => vec![name.trim().to_string()],
        _ => args
            .get("service_name")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(|s| vec![s.trim().to_string()])
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_greeting_prompt_uses_call_context() {
        let vars = DynamicVariables {
            agent_name: "Nova".into(),
            org_name: "Zen Group".into(),
            center_name: "Downtown".into(),
            center_allows_multiple_service_booking: false,
            ..DynamicVariables::default()
        };
        let prompt = greeting_prompt(Some(&vars));
        assert!(prompt.starts_with("You are Nova"));
        assert!(prompt.contains("Zen Group, Downtown"));
        assert!(prompt.contains("Only one service"));
        assert!(prompt.contains(ROUTE_TO_BOOKING));
    }

    #[test]
    fn test_fallback_prompt_mentions_failure() {
        let ctx = TaskContext {
            detected_intent: "BOOK".into(),
            error_context: Some("no service names".into()),
            ..TaskContext::default()
        };
        let prompt = fallback_prompt(&ctx);
        assert!(prompt.contains("Task state: idle"));
        assert!(prompt.contains("no service names"));
    }

    #[test]
    fn test_service_names_argument_shapes() {
        let list = ToolCall::new("1", ROUTE_TO_BOOKING, json!({"service_names": ["Facial", " "]}));
        assert_eq!(service_names(&list), vec!["Facial"]);

        let single = ToolCall::new("2", ROUTE_TO_BOOKING, json!({"service_name": "Massage"}));
        assert_eq!(service_names(&single), vec!["Massage"]);

        let none = ToolCall::new("3", ROUTE_TO_BOOKING, json!({}));
        assert!(service_names(&none).is_empty());
    }
}
