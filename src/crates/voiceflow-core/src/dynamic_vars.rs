//! Call-context variables from the initialization API
//!
//! Set once when the call starts and read-only for nodes afterwards.
//! Parsing is tolerant: the API sends booleans as strings in some
//! deployments and numbers where strings are expected in others.

use crate::config::Defaults;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicVariables {
    pub caller_id: String,
    pub called_number: String,
    pub call_sid: Option<String>,
    pub center_id: String,
    pub center_name: String,
    pub org_id: String,
    pub org_name: String,
    pub agent_id: String,
    pub agent_name: String,

    pub is_outside_business_hours: bool,
    pub guest_name: String,
    pub guest_first_name: String,
    pub guest_last_name: String,
    pub is_new_user: bool,

    pub center_allows_multiple_service_booking: bool,
    pub center_allows_multiple_therapist_booking: bool,
    pub ask_for_more_services: String,

    pub hand_over_number: String,

    /// Everything the API sent that has no dedicated field
    pub extra: Map<String, Value>,
}

impl Default for DynamicVariables {
    fn default() -> Self {
        Self {
            caller_id: String::new(),
            called_number: String::new(),
            call_sid: None,
            center_id: String::new(),
            center_name: String::new(),
            org_id: String::new(),
            org_name: String::new(),
            agent_id: String::new(),
            agent_name: Defaults::DEFAULT_AGENT_NAME.to_string(),
            is_outside_business_hours: false,
            guest_name: String::new(),
            guest_first_name: String::new(),
            guest_last_name: String::new(),
            is_new_user: true,
            center_allows_multiple_service_booking: true,
            center_allows_multiple_therapist_booking: false,
            ask_for_more_services: "ask_initially".to_string(),
            hand_over_number: String::new(),
            extra: Map::new(),
        }
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

impl DynamicVariables {
    /// Parse the initialization payload
    ///
    /// Reads `dynamic_variables` when present, otherwise the top level.
    /// Unknown keys land in [`extra`](Self::extra); malformed known keys
    /// keep their defaults.
    pub fn from_api_response(response: &Value) -> Self {
        let source = response
            .get("dynamic_variables")
            .and_then(Value::as_object)
            .or_else(|| response.as_object());

        let mut vars = Self::default();
        let Some(source) = source else {
            return vars;
        };

        for (key, value) in source {
            let handled = match key.as_str() {
                "caller_id" => set_string(&mut vars.caller_id, value),
                "called_number" => set_string(&mut vars.called_number, value),
                "call_sid" => {
                    vars.call_sid = as_string(value).filter(|s| !s.is_empty());
                    true
                }
                "center_id" => set_string(&mut vars.center_id, value),
                "center_name" => set_string(&mut vars.center_name, value),
                "org_id" => set_string(&mut vars.org_id, value),
                "org_name" => set_string(&mut vars.org_name, value),
                "agent_id" => set_string(&mut vars.agent_id, value),
                "agent_name" => set_string(&mut vars.agent_name, value),
                "guest_name" => set_string(&mut vars.guest_name, value),
                "guest_first_name" | "first_name" => set_string(&mut vars.guest_first_name, value),
                "guest_last_name" | "last_name" => set_string(&mut vars.guest_last_name, value),
                "hand_over_number" => set_string(&mut vars.hand_over_number, value),
                "ask_for_more_services" => set_string(&mut vars.ask_for_more_services, value),
                "is_outside_business_hours" => set_bool(&mut vars.is_outside_business_hours, value),
                "is_new_user" => set_bool(&mut vars.is_new_user, value),
                "center_allows_multiple_service_booking" => {
                    set_bool(&mut vars.center_allows_multiple_service_booking, value)
                }
                "center_allows_multiple_therapist_booking" => {
                    set_bool(&mut vars.center_allows_multiple_therapist_booking, value)
                }
                _ => false,
            };
            if !handled {
                vars.extra.insert(key.clone(), value.clone());
            }
        }
        vars
    }

    /// First name, else full name, else "there"
    pub fn get_guest_display_name(&self) -> String {
        [&self.guest_first_name, &self.guest_name]
            .into_iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or("there")
            .to_string()
    }

    pub fn should_ask_for_more_services(&self) -> bool {
        self.center_allows_multiple_service_booking && self.ask_for_more_services == "ask_initially"
    }

    /// Any variable by name, falling back to `extra`
    pub fn get(&self, key: &str) -> Option<Value> {
        let map = self.to_context_map();
        map.get(key).cloned()
    }

    /// Flat map of every variable, `extra` merged in
    pub fn to_context_map(&self) -> Map<String, Value> {
        let mut map = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.remove("extra");
        for (key, value) in &self.extra {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
        map
    }
}

fn set_string(target: &mut String, value: &Value) -> bool {
    match as_string(value) {
        Some(s) => {
            *target = s;
            true
        }
        None => value.is_null(),
    }
}

fn set_bool(target: &mut bool, value: &Value) -> bool {
    match as_bool(value) {
        Some(b) => {
            *target = b;
            true
        }
        None => value.is_null(),
    }
}
