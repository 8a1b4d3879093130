// Claude SSE event payloads. Clients tolerate any key order but the
// reference protocol leads every object with `type`, so each event is a
// fixed-field struct whose first declared field is `type` — serde_json
// serializes struct fields in declaration order.

use serde::Serialize;
use serde_json::Value;

pub fn format_sse<T: Serialize>(event: &str, data: &T) -> String {
    format!(
        "event: {event}\ndata: {}\n\n",
        serde_json::to_string(data).unwrap_or_default()
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageStartEvent {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub message: MessageInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub role: &'static str,
    pub content: Vec<Value>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: UsageInfo,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<usize>,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentBlockStartEvent {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub index: usize,
    pub content_block: ContentBlockShape,
}

/// Block shapes carried by content_block_start. Text always serializes its
/// (possibly empty) text, tool_use always serializes its input.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ContentBlockShape {
    Text {
        #[serde(rename = "type")]
        type_: &'static str,
        text: String,
    },
    Thinking {
        #[serde(rename = "type")]
        type_: &'static str,
        thinking: String,
    },
    ToolUse {
        #[serde(rename = "type")]
        type_: &'static str,
        id: String,
        name: String,
        input: Value,
    },
}

impl ContentBlockShape {
    pub fn text() -> Self {
        Self::Text {
            type_: "text",
            text: String::new(),
        }
    }

    pub fn thinking() -> Self {
        Self::Thinking {
            type_: "thinking",
            thinking: String::new(),
        }
    }

    pub fn tool_use(id: &str, name: &str) -> Self {
        Self::ToolUse {
            type_: "tool_use",
            id: id.to_string(),
            name: name.to_string(),
            input: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentBlockDeltaEvent {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub index: usize,
    pub delta: Delta,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Delta {
    Text {
        #[serde(rename = "type")]
        type_: &'static str,
        text: String,
    },
    InputJson {
        #[serde(rename = "type")]
        type_: &'static str,
        partial_json: String,
    },
    Thinking {
        #[serde(rename = "type")]
        type_: &'static str,
        thinking: String,
    },
    Signature {
        #[serde(rename = "type")]
        type_: &'static str,
        signature: String,
    },
}

impl Delta {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            type_: "text_delta",
            text: text.into(),
        }
    }

    pub fn input_json(partial_json: impl Into<String>) -> Self {
        Self::InputJson {
            type_: "input_json_delta",
            partial_json: partial_json.into(),
        }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking {
            type_: "thinking_delta",
            thinking: thinking.into(),
        }
    }

    pub fn signature(signature: impl Into<String>) -> Self {
        Self::Signature {
            type_: "signature_delta",
            signature: signature.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentBlockStopEvent {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingEvent {
    #[serde(rename = "type")]
    pub type_: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDeltaEvent {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub delta: MessageDeltaInfo,
    pub usage: UsageInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDeltaInfo {
    pub stop_reason: String,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageStopEvent {
    #[serde(rename = "type")]
    pub type_: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
}

pub fn message_start(id: &str, model: &str, usage: UsageInfo) -> String {
    format_sse(
        "message_start",
        &MessageStartEvent {
            type_: "message_start",
            message: MessageInfo {
                id: id.to_string(),
                type_: "message",
                role: "assistant",
                content: Vec::new(),
                model: model.to_string(),
                stop_reason: None,
                stop_sequence: None,
                usage,
            },
        },
    )
}

pub fn content_block_start(index: usize, block: ContentBlockShape) -> String {
    format_sse(
        "content_block_start",
        &ContentBlockStartEvent {
            type_: "content_block_start",
            index,
            content_block: block,
        },
    )
}

pub fn content_block_delta(index: usize, delta: Delta) -> String {
    format_sse(
        "content_block_delta",
        &ContentBlockDeltaEvent {
            type_: "content_block_delta",
            index,
            delta,
        },
    )
}

pub fn content_block_stop(index: usize) -> String {
    format_sse(
        "content_block_stop",
        &ContentBlockStopEvent {
            type_: "content_block_stop",
            index,
        },
    )
}

pub fn ping() -> String {
    format_sse("ping", &PingEvent { type_: "ping" })
}

pub fn message_delta(stop_reason: &str, usage: UsageInfo) -> String {
    format_sse(
        "message_delta",
        &MessageDeltaEvent {
            type_: "message_delta",
            delta: MessageDeltaInfo {
                stop_reason: stop_reason.to_string(),
                stop_sequence: None,
            },
            usage,
        },
    )
}

pub fn message_stop() -> String {
    format_sse("message_stop", &MessageStopEvent { type_: "message_stop" })
}

pub fn error(error_type: &str, message: &str) -> String {
    format_sse(
        "error",
        &ErrorEvent {
            type_: "error",
            error: ErrorInfo {
                type_: error_type.to_string(),
                message: message.to_string(),
            },
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_json(sse: &str) -> serde_json::Value {
        let data_line = sse
            .lines()
            .find(|l| l.starts_with("data: "))
            .expect("no data line");
        serde_json::from_str(data_line.trim_start_matches("data: ")).unwrap()
    }

    #[test]
    fn test_type_is_first_key() {
        for sse in [
            message_start("msg_1", "claude-sonnet-4-5", UsageInfo::default()),
            content_block_start(0, ContentBlockShape::text()),
            content_block_delta(0, Delta::text("hi")),
            content_block_stop(0),
            ping(),
            message_delta("end_turn", UsageInfo::default()),
            message_stop(),
            error("api_error", "boom"),
        ] {
            let data_line = sse.lines().find(|l| l.starts_with("data: ")).unwrap();
            let json = data_line.trim_start_matches("data: ");
            assert!(
                json.starts_with(r#"{"type":"#),
                "type not first in {json}"
            );
        }
    }

    #[test]
    fn test_sse_framing() {
        let sse = ping();
        assert_eq!(sse, "event: ping\ndata: {\"type\":\"ping\"}\n\n");
    }

    #[test]
    fn test_message_start_shape() {
        let sse = message_start(
            "msg_20250101120000",
            "claude-sonnet-4-5",
            UsageInfo {
                input_tokens: 12,
                output_tokens: 0,
                cache_creation_input_tokens: Some(5),
                cache_read_input_tokens: None,
            },
        );
        let json = data_json(&sse);
        assert_eq!(json["message"]["id"], "msg_20250101120000");
        assert_eq!(json["message"]["role"], "assistant");
        assert_eq!(json["message"]["usage"]["input_tokens"], 12);
        assert_eq!(json["message"]["usage"]["cache_creation_input_tokens"], 5);
        assert!(json["message"]["usage"]
            .get("cache_read_input_tokens")
            .is_none());
        assert!(json["message"]["stop_reason"].is_null());
    }

    #[test]
    fn test_tool_use_block_always_has_input() {
        let sse = content_block_start(2, ContentBlockShape::tool_use("tooluse_1", "get_weather"));
        let json = data_json(&sse);
        assert_eq!(json["content_block"]["input"], serde_json::json!({}));
        assert_eq!(json["index"], 2);
    }

    #[test]
    fn test_delta_variants() {
        assert_eq!(
            data_json(&content_block_delta(0, Delta::input_json("{\"a\"")))["delta"]
                ["partial_json"],
            "{\"a\""
        );
        assert_eq!(
            data_json(&content_block_delta(1, Delta::thinking("hm")))["delta"]["thinking"],
            "hm"
        );
        assert_eq!(
            data_json(&content_block_delta(1, Delta::signature("s1g")))["delta"]["signature"],
            "s1g"
        );
    }

    #[test]
    fn test_message_delta_has_null_stop_sequence() {
        let json = data_json(&message_delta(
            "tool_use",
            UsageInfo {
                input_tokens: 1,
                output_tokens: 9,
                ..Default::default()
            },
        ));
        assert_eq!(json["delta"]["stop_reason"], "tool_use");
        assert!(json["delta"]["stop_sequence"].is_null());
        assert_eq!(json["usage"]["output_tokens"], 9);
    }

    #[test]
    fn test_error_event_shape() {
        let json = data_json(&error("rate_limit_error", "too fast"));
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(json["error"]["message"], "too fast");
    }
}
