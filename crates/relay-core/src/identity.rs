//! Bot identity resolution, from connection parameters or message content.
//!
//! These functions only propose a candidate. Whether a connection is already
//! identified is decided by the connection registry.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::ids::BotId;

/// Query parameters presented on the websocket upgrade request.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub bot_id: Option<String>,
    pub token: Option<String>,
}

/// Identifier carried on the connection URL, if any.
pub fn resolve_provisional(params: &ConnectParams) -> Option<BotId> {
    params.bot_id.clone().and_then(BotId::parse)
}

/// First non-empty identifier found in a message: `bot_id`, then `data.bot.id`.
pub fn resolve_from_message(message: &Map<String, Value>) -> Option<BotId> {
    let top_level = message.get("bot_id");
    let nested = message
        .get("data")
        .and_then(|data| data.get("bot"))
        .and_then(|bot| bot.get("id"));

    [top_level, nested]
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find_map(BotId::parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn provisional_from_url() {
        let params = ConnectParams {
            bot_id: Some("bot-1".into()),
            token: Some("t".into()),
        };
        assert_eq!(resolve_provisional(&params).unwrap().as_str(), "bot-1");
    }

    #[test]
    fn provisional_absent_or_empty() {
        assert!(resolve_provisional(&ConnectParams::default()).is_none());
        let params = ConnectParams {
            bot_id: Some(String::new()),
            token: None,
        };
        assert!(resolve_provisional(&params).is_none());
    }

    #[test]
    fn connect_params_from_query_names() {
        let params: ConnectParams =
            serde_json::from_value(json!({"botId": "b", "token": "secret"})).unwrap();
        assert_eq!(params.bot_id.as_deref(), Some("b"));
        assert_eq!(params.token.as_deref(), Some("secret"));
    }

    #[test]
    fn top_level_bot_id() {
        let msg = object(json!({"bot_id": "bot-42", "type": "transcript"}));
        assert_eq!(resolve_from_message(&msg).unwrap().as_str(), "bot-42");
    }

    #[test]
    fn nested_bot_id() {
        let msg = object(json!({"event": "transcript.data", "data": {"bot": {"id": "bot-9"}}}));
        assert_eq!(resolve_from_message(&msg).unwrap().as_str(), "bot-9");
    }

    #[test]
    fn top_level_takes_precedence() {
        let msg = object(json!({"bot_id": "top", "data": {"bot": {"id": "nested"}}}));
        assert_eq!(resolve_from_message(&msg).unwrap().as_str(), "top");
    }

    #[test]
    fn empty_top_level_falls_through_to_nested() {
        let msg = object(json!({"bot_id": "", "data": {"bot": {"id": "nested"}}}));
        assert_eq!(resolve_from_message(&msg).unwrap().as_str(), "nested");
    }

    #[test]
    fn non_string_identifiers_ignored() {
        let msg = object(json!({"bot_id": 42, "data": {"bot": {"id": null}}}));
        assert!(resolve_from_message(&msg).is_none());
    }

    #[test]
    fn no_identifier() {
        let msg = object(json!({"type": "transcript", "words": ["hi"]}));
        assert!(resolve_from_message(&msg).is_none());
    }
}
