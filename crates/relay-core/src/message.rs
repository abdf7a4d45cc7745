//! Parsing, classification and callback-body construction for bot messages.

use serde_json::{Map, Value};

use crate::errors::RelayError;
use crate::ids::BotId;

/// Descriptive facts about a message, used for logging only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageSummary {
    /// `type`, falling back to `event`.
    pub kind: Option<String>,
    pub has_words: bool,
    pub words_count: usize,
}

/// Parse an inbound frame. Anything other than a JSON object is malformed.
pub fn parse_message(raw: &str) -> Result<Map<String, Value>, RelayError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(RelayError::malformed(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
        Err(e) => Err(RelayError::malformed(e.to_string())),
    }
}

pub fn summarize(message: &Map<String, Value>) -> MessageSummary {
    let kind = ["type", "event"]
        .into_iter()
        .filter_map(|field| message.get(field))
        .find_map(Value::as_str)
        .map(String::from);

    let words = message
        .get("words")
        .or_else(|| message.get("data").and_then(|data| data.get("words")))
        .filter(|words| !words.is_null());

    MessageSummary {
        kind,
        has_words: words.is_some(),
        words_count: words.and_then(Value::as_array).map_or(0, Vec::len),
    }
}

/// Callback body: `{"botId": id}` extended with every field of the message.
///
/// Fields of the message are applied last, so a message-supplied `botId` wins.
pub fn augment(bot_id: &BotId, message: Map<String, Value>) -> Value {
    let mut body = Map::with_capacity(message.len() + 1);
    let _ = body.insert("botId".to_string(), Value::String(bot_id.to_string()));
    body.extend(message);
    Value::Object(body)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
