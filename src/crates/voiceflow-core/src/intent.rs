//! Caller intents and the shared keyword classifier

use serde::{Deserialize, Deserializer, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// What the caller is trying to get done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intent {
    Book,
    Cancel,
    Reschedule,
    Faq,
    Handover,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Book => "BOOK",
            Intent::Cancel => "CANCEL",
            Intent::Reschedule => "RESCHEDULE",
            Intent::Faq => "FAQ",
            Intent::Handover => "HANDOVER",
            Intent::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive, accepting the long forms the routing prompts emit.
/// Anything unrecognised parses as [`Intent::Unknown`].
impl FromStr for Intent {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let intent = match s.trim().to_ascii_uppercase().as_str() {
            "BOOK" | "BOOKING" => Intent::Book,
            "CANCEL" | "CANCELLATION" => Intent::Cancel,
            "RESCHEDULE" | "RESCHEDULING" => Intent::Reschedule,
            "FAQ" => Intent::Faq,
            "HANDOVER" => Intent::Handover,
            _ => Intent::Unknown,
        };
        Ok(intent)
    }
}

impl<'de> Deserialize<'de> for Intent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or(Intent::Unknown))
    }
}

/// Keyword intent classifier used by the routing and fallback agents
///
/// First match wins, in this order: booking, cancellation, reschedule,
/// handover, question.
pub fn detect_intent(text: &str) -> Intent {
    let lower = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has(&["book", "appointment", "schedule"]) && !has(&["reschedule"]) {
        Intent::Book
    } else if has(&["cancel"]) {
        Intent::Cancel
    } else if has(&["reschedule", "change time"]) {
        Intent::Reschedule
    } else if has(&["human", "operator", "agent", "person"]) {
        Intent::Handover
    } else if lower.contains('?') {
        Intent::Faq
    } else {
        Intent::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("booking".parse::<Intent>().unwrap(), Intent::Book);
        assert_eq!("Cancellation".parse::<Intent>().unwrap(), Intent::Cancel);
        assert_eq!("RESCHEDULING".parse::<Intent>().unwrap(), Intent::Reschedule);
        assert_eq!("whatever".parse::<Intent>().unwrap(), Intent::Unknown);
    }

    #[test]
    fn test_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Intent::Handover).unwrap(), "\"HANDOVER\"");
        let parsed: Intent = serde_json::from_str("\"book\"").unwrap();
        assert_eq!(parsed, Intent::Book);
    }

    #[test]
    fn test_detect_intent() {
        assert_eq!(detect_intent("I'd like to book a massage"), Intent::Book);
        assert_eq!(detect_intent("Can I make an appointment"), Intent::Book);
        assert_eq!(detect_intent("cancel my facial"), Intent::Cancel);
        assert_eq!(detect_intent("I need to reschedule"), Intent::Reschedule);
        assert_eq!(detect_intent("can I change time please"), Intent::Reschedule);
        assert_eq!(detect_intent("let me talk to a person"), Intent::Handover);
        assert_eq!(detect_intent("do you have parking?"), Intent::Faq);
        assert_eq!(detect_intent("hmm"), Intent::Unknown);
    }
}
