// Tool normalization: unsupported-name filtering, description caps, JSON
// Schema cleanup, and tool_choice coercion.

use serde_json::{json, Map, Value};

use crate::mappers::claude::models::{ClaudeRequest, Tool};

use super::models::{CwTool, InputSchema, ToolChoice, ToolSpecification};

/// Schema keys the upstream does not understand.
const STRIPPED_SCHEMA_KEYS: &[&str] = &[
    "additionalProperties",
    "strict",
    "$schema",
    "$id",
    "$ref",
    "definitions",
    "$defs",
];

/// Build upstream tool specifications, dropping unsupported and nameless
/// tools, capping descriptions, and cleaning each schema.
pub fn build_tool_specifications(tools: &[Tool], max_desc_len: usize) -> Vec<CwTool> {
    tools
        .iter()
        .filter_map(|tool| {
            let name = tool.name.as_deref()?;
            if name.is_empty() || Tool::is_unsupported_name(name) {
                return None;
            }

            let description =
                truncate_description(tool.description.as_deref().unwrap_or(""), max_desc_len);
            let schema = clean_tool_schema(tool.input_schema.as_ref().unwrap_or(&json!({})));

            Some(CwTool {
                tool_specification: ToolSpecification {
                    name: name.to_string(),
                    description,
                    input_schema: InputSchema { json: schema },
                },
            })
        })
        .collect()
}

/// Cap a description at `max_len` bytes. The cap is exact for ASCII; a cut
/// landing inside a multi-byte character backs off to the previous
/// boundary so the result stays valid UTF-8.
pub fn truncate_description(description: &str, max_len: usize) -> String {
    if max_len == 0 || description.len() <= max_len {
        return description.to_string();
    }
    let mut end = max_len;
    while end > 0 && !description.is_char_boundary(end) {
        end -= 1;
    }
    description[..end].to_string()
}

/// Normalize a tool input schema for the upstream:
/// - strip non-portable top-level keys
/// - guarantee top-level `type: object` and a `properties` object
/// - coerce `required` to a string array
/// - rename over-long property keys, mirroring renames into `required`
pub fn clean_tool_schema(schema: &Value) -> Value {
    let mut cleaned: Map<String, Value> = match schema {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    for key in STRIPPED_SCHEMA_KEYS {
        cleaned.remove(*key);
    }

    // Rename over-long property keys, remembering old -> new.
    let mut renames: Vec<(String, String)> = Vec::new();
    if let Some(Value::Object(properties)) = cleaned.get("properties") {
        let mut new_properties = Map::new();
        for (name, def) in properties {
            let new_name = rename_property_key(name);
            if new_name != *name {
                renames.push((name.clone(), new_name.clone()));
            }
            new_properties.insert(new_name, def.clone());
        }
        cleaned.insert("properties".to_string(), Value::Object(new_properties));
    }

    // required must be an array of non-empty strings, with renames applied.
    match cleaned.get("required") {
        Some(Value::Array(entries)) => {
            let coerced: Vec<Value> = entries
                .iter()
                .filter_map(|entry| entry.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(rename_property_key(s)))
                .collect();
            cleaned.insert("required".to_string(), Value::Array(coerced));
        }
        Some(_) => {
            cleaned.remove("required");
        }
        None => {}
    }

    if !cleaned.contains_key("type") {
        cleaned.insert("type".to_string(), json!("object"));
    }
    match cleaned.get("properties") {
        Some(Value::Object(_)) => {}
        _ => {
            cleaned.insert("properties".to_string(), json!({}));
        }
    }

    Value::Object(cleaned)
}

/// The upstream rejects property names over 64 characters. Renaming is
/// deterministic so repeated requests agree:
/// len > 80  -> first 20 chars + "_" + last 20 chars
/// len in (64, 80] -> first 30 chars + "_param"
pub fn rename_property_key(name: &str) -> String {
    let char_count = name.chars().count();
    if char_count <= 64 {
        return name.to_string();
    }
    if char_count > 80 {
        let head: String = name.chars().take(20).collect();
        let tail: String = name
            .chars()
            .skip(char_count - 20)
            .collect();
        format!("{head}_{tail}")
    } else {
        let head: String = name.chars().take(30).collect();
        format!("{head}_param")
    }
}

/// Coerce the polymorphic tool_choice field. `"none"` (and the `{type:
/// "none"}` form) yields `None`, meaning the field is omitted upstream.
pub fn convert_tool_choice(tool_choice: &Value) -> Option<ToolChoice> {
    match tool_choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(ToolChoice {
                type_: "auto".into(),
                name: None,
            }),
            "any" => Some(ToolChoice {
                type_: "any".into(),
                name: None,
            }),
            "none" => None,
            _ => Some(ToolChoice {
                type_: "auto".into(),
                name: None,
            }),
        },
        Value::Object(map) => match map.get("type").and_then(|t| t.as_str()) {
            Some("tool") => map.get("name").and_then(|n| n.as_str()).map(|name| ToolChoice {
                type_: "tool".into(),
                name: Some(name.to_string()),
            }),
            Some(kind @ ("auto" | "any")) => Some(ToolChoice {
                type_: kind.to_string(),
                name: None,
            }),
            Some("none") => None,
            _ => Some(ToolChoice {
                type_: "auto".into(),
                name: None,
            }),
        },
        _ => None,
    }
}

/// Tools declared and tool_choice forcing their use means the upstream is
/// driving the turn: AUTO. Everything else is MANUAL.
pub fn determine_chat_trigger(request: &ClaudeRequest) -> &'static str {
    let has_tools = request
        .tools
        .as_ref()
        .map(|t| !t.is_empty())
        .unwrap_or(false);

    if has_tools {
        if let Some(raw) = &request.tool_choice {
            if let Some(choice) = convert_tool_choice(raw) {
                if choice.type_ == "any" || choice.type_ == "tool" {
                    return "AUTO";
                }
            }
        }
    }

    "MANUAL"
}
