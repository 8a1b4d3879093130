// Content walker: one pass over any of the three content representations
// yielding the pieces the upstream request builder needs.

use serde_json::{json, Value};

use super::models::{ContentBlock, MessageContent, Tool};

#[derive(Debug, Clone, Default)]
pub struct ContentParts {
    /// Text blocks joined with newlines (thinking text included).
    pub text: String,
    pub images: Vec<ImagePart>,
    pub tool_results: Vec<ToolResultPart>,
    pub tool_uses: Vec<ToolUsePart>,
}

#[derive(Debug, Clone)]
pub struct ImagePart {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct ToolResultPart {
    pub tool_use_id: String,
    /// Normalized to [{"text": ...}] entries, never empty.
    pub content: Vec<Value>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct ToolUsePart {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Walk a message content value and split it into text, images, tool
/// results and tool uses. Unsupported tool names are elided here so they
/// never reach the upstream request in any position.
pub fn walk_content(content: &MessageContent) -> ContentParts {
    let mut parts = ContentParts::default();

    match content {
        MessageContent::String(s) => {
            parts.text = s.clone();
        }
        MessageContent::Blocks(blocks) => {
            let mut texts: Vec<&str> = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text, .. } => texts.push(text),
                    ContentBlock::Thinking { thinking, .. } => {
                        if !thinking.is_empty() {
                            texts.push(thinking);
                        }
                    }
                    ContentBlock::RedactedThinking { .. } => {}
                    ContentBlock::Image { source, .. } => {
                        parts.images.push(normalize_image(&source.media_type, &source.data));
                    }
                    ContentBlock::Document { .. } => {}
                    ContentBlock::ToolUse {
                        id, name, input, ..
                    } => {
                        if Tool::is_unsupported_name(name) {
                            continue;
                        }
                        parts.tool_uses.push(ToolUsePart {
                            id: id.clone(),
                            name: name.clone(),
                            input: coerce_tool_input(input),
                        });
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                        ..
                    } => {
                        parts.tool_results.push(ToolResultPart {
                            tool_use_id: tool_use_id.clone(),
                            content: normalize_tool_result_content(content),
                            status: if is_error.unwrap_or(false) {
                                "error".to_string()
                            } else {
                                "success".to_string()
                            },
                        });
                    }
                }
            }
            parts.text = texts.join("\n");
        }
        MessageContent::Loose(values) => {
            let mut texts: Vec<String> = Vec::new();
            for value in values {
                let block_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
                match block_type {
                    "text" => {
                        if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
                            texts.push(text.to_string());
                        }
                    }
                    "thinking" => {
                        if let Some(text) = value.get("thinking").and_then(|t| t.as_str()) {
                            if !text.is_empty() {
                                texts.push(text.to_string());
                            }
                        }
                    }
                    "image" => {
                        if let Some(source) = value.get("source") {
                            let media_type = source
                                .get("media_type")
                                .and_then(|m| m.as_str())
                                .unwrap_or("image/png");
                            let data =
                                source.get("data").and_then(|d| d.as_str()).unwrap_or("");
                            parts.images.push(normalize_image(media_type, data));
                        }
                    }
                    "tool_use" => {
                        let name = value
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("")
                            .to_string();
                        if Tool::is_unsupported_name(&name) {
                            continue;
                        }
                        parts.tool_uses.push(ToolUsePart {
                            id: value
                                .get("id")
                                .and_then(|i| i.as_str())
                                .unwrap_or("")
                                .to_string(),
                            name,
                            input: coerce_tool_input(
                                value.get("input").unwrap_or(&Value::Null),
                            ),
                        });
                    }
                    "tool_result" => {
                        parts.tool_results.push(ToolResultPart {
                            tool_use_id: value
                                .get("tool_use_id")
                                .and_then(|i| i.as_str())
                                .unwrap_or("")
                                .to_string(),
                            content: normalize_tool_result_content(
                                value.get("content").unwrap_or(&Value::Null),
                            ),
                            status: if value
                                .get("is_error")
                                .and_then(|e| e.as_bool())
                                .unwrap_or(false)
                            {
                                "error".to_string()
                            } else {
                                "success".to_string()
                            },
                        });
                    }
                    _ => {}
                }
            }
            parts.text = texts.join("\n");
        }
    }

    parts
}

/// Tool input must be a JSON object; anything else is wrapped.
fn coerce_tool_input(input: &Value) -> Value {
    match input {
        Value::Object(_) => input.clone(),
        Value::Null => json!({}),
        other => json!({ "value": other }),
    }
}

/// The upstream accepts tool-result content only as [{"text": ...}].
/// Strings are wrapped, arrays keep just their text fields, anything else
/// is stringified. An empty list is padded with one empty text entry.
fn normalize_tool_result_content(content: &Value) -> Vec<Value> {
    let mut entries: Vec<Value> = Vec::new();

    match content {
        Value::String(s) => entries.push(json!({ "text": s })),
        Value::Array(items) => {
            for item in items {
                if let Some(text) = item.get("text") {
                    entries.push(json!({ "text": text }));
                }
            }
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text") {
                entries.push(json!({ "text": text }));
            }
        }
        Value::Null => {}
        other => entries.push(json!({ "text": other.to_string() })),
    }

    if entries.is_empty() {
        entries.push(json!({ "text": "" }));
    }
    entries
}

/// Strip a data-URL prefix and derive the upstream image format.
fn normalize_image(media_type: &str, data: &str) -> ImagePart {
    let mut media_type = media_type.to_string();
    let mut data = data.to_string();

    if data.starts_with("data:") {
        if let Some(comma) = data.find(',') {
            let header = &data[..comma];
            let media_part = header.split(';').next().unwrap_or("");
            if let Some(extracted) = media_part.strip_prefix("data:") {
                if !extracted.is_empty() {
                    media_type = extracted.to_string();
                }
            }
            data = data[comma + 1..].to_string();
        }
    }

    ImagePart { media_type, data }
}

impl ImagePart {
    /// "image/jpeg" -> "jpeg"
    pub fn format(&self) -> String {
        self.media_type
            .split('/')
            .next_back()
            .unwrap_or(&self.media_type)
            .to_string()
    }
}
