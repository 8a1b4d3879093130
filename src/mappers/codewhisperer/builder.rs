// Claude -> CodeWhisperer request assembly.
//
// The upstream accepts exactly one in-flight user message plus a history of
// strictly alternating user/assistant turns. Claude conversations are free
// to repeat roles, so consecutive user messages are merged and orphan
// assistant turns are folded into their predecessor; a trailing run of
// users is paired with a synthetic "OK" assistant turn.

use serde_json::Value;
use uuid::Uuid;

use crate::config;
use crate::mappers::claude::content::{walk_content, ContentParts};
use crate::mappers::claude::models::{ClaudeRequest, SystemPrompt};

use super::models::{
    AssistantResponseMessage, CodeWhispererRequest, ConversationState, CurrentMessage, CwImage,
    CwImageSource, CwToolResult, CwToolUse, HistoryEntry, InferenceConfig, UserInputMessage,
    UserInputMessageContext,
};
use super::tools::{build_tool_specifications, determine_chat_trigger};

/// Injected when the latest user turn opts into agent mode with the
/// `-agent` sentinel. Large uninterrupted writes time out upstream.
const AGENTIC_SYSTEM_PROMPT: &str = r#"
# CRITICAL: CHUNKED WRITE PROTOCOL (MANDATORY)

- **MAXIMUM 350 LINES** per single write/edit operation
- AWS Kiro API has a 2-3 minute timeout for large file write operations
- If you need to write more than 350 lines, split into multiple operations
- For new files: Create with first chunk, then append remaining chunks
- For edits: Make multiple targeted edits instead of one large replacement
"#;

const DEFAULT_THINKING_BUDGET: u32 = 16000;

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("messages array is empty")]
    EmptyMessages,
    #[error("user message has no content, images, or tool results")]
    EmptyContent,
    #[error("model '{0}' could not be resolved")]
    ModelNotFound(String),
}

/// Stable attributes of the calling context used to keep successive turns
/// of one client on one upstream conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub credential_hash: String,
    pub client_request_id: Option<String>,
}

/// Same client context -> same conversation id. Without a client request
/// id there is nothing stable to hash, so each request gets a fresh id.
pub fn stable_conversation_id(credential_hash: &str, client_request_id: Option<&str>) -> String {
    match client_request_id {
        Some(request_id) if !request_id.is_empty() => {
            let seed = format!("{credential_hash}:{request_id}");
            Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
        }
        _ => Uuid::new_v4().to_string(),
    }
}

pub fn build_codewhisperer_request(
    request: &ClaudeRequest,
    ctx: &ConversationContext,
    profile_arn: Option<&str>,
) -> Result<CodeWhispererRequest, TranslateError> {
    if request.messages.is_empty() {
        return Err(TranslateError::EmptyMessages);
    }

    let model_id = config::resolve_model_id(&request.model);
    if model_id.is_empty() {
        return Err(TranslateError::ModelNotFound(request.model.clone()));
    }

    let last = request.messages.last().unwrap();
    let last_parts = walk_content(&last.content);
    let system_prompt = build_enhanced_system_prompt(request);

    let mut content = String::new();
    if !system_prompt.is_empty() {
        content.push_str("<system_mode>");
        content.push_str(&system_prompt);
        content.push_str("</system_mode>\n\n");
    }
    content.push_str(&last_parts.text);

    let images = to_cw_images(&last_parts);

    let mut context = UserInputMessageContext::default();
    if let Some(tools) = &request.tools {
        context.tools = build_tool_specifications(tools, config::max_tool_description_length());
    }

    let mut has_tool_results = false;
    if last.role == "user" && !last_parts.tool_results.is_empty() {
        has_tool_results = true;
        context.tool_results = to_cw_tool_results(&last_parts);
        // Tool feedback turns carry no user text; only the system wrapper
        // survives.
        content = if system_prompt.is_empty() {
            String::new()
        } else {
            format!("<system_mode>{system_prompt}</system_mode>")
        };
    }

    if !has_tool_results {
        let empty = content.trim().is_empty();
        if empty && images.is_empty() && !context.tools.is_empty() {
            content = "执行工具任务".to_string();
        } else if empty && images.is_empty() {
            return Err(TranslateError::EmptyContent);
        }
    }

    let history = build_history(request, &model_id);

    let current_message = CurrentMessage {
        user_input_message: UserInputMessage {
            content,
            model_id: model_id.clone(),
            origin: "AI_EDITOR".to_string(),
            images,
            user_input_message_context: if context.is_empty() {
                None
            } else {
                Some(context)
            },
        },
    };

    let inference_config = request
        .max_tokens
        .filter(|max| *max > 0)
        .map(|max_tokens| InferenceConfig {
            max_tokens,
            temperature: request.temperature,
        });

    Ok(CodeWhispererRequest {
        conversation_state: ConversationState {
            chat_trigger_type: determine_chat_trigger(request).to_string(),
            conversation_id: stable_conversation_id(
                &ctx.credential_hash,
                ctx.client_request_id.as_deref(),
            ),
            current_message,
            history,
        },
        profile_arn: profile_arn.map(str::to_string),
        inference_config,
    })
}

/// System text fragments, the agentic directive, and the thinking-mode tag
/// composed into one prompt.
fn build_enhanced_system_prompt(request: &ClaudeRequest) -> String {
    let mut prompt = String::new();

    match &request.system {
        Some(SystemPrompt::String(s)) => {
            if !s.is_empty() {
                prompt.push_str(s);
                prompt.push('\n');
            }
        }
        Some(SystemPrompt::Array(blocks)) => {
            for block in blocks {
                if !block.text.is_empty() {
                    prompt.push_str(&block.text);
                    prompt.push('\n');
                }
            }
        }
        None => {}
    }

    if is_agentic_mode(request) {
        prompt.push('\n');
        prompt.push_str(AGENTIC_SYSTEM_PROMPT);
    }

    if let Some(thinking) = &request.thinking {
        if thinking.is_enabled() {
            let budget = thinking
                .budget_tokens
                .filter(|b| *b > 0)
                .unwrap_or(DEFAULT_THINKING_BUDGET);
            prompt.push('\n');
            prompt.push_str(&format!(
                "<thinking_mode>interleaved</thinking_mode><max_thinking_length>{budget}</max_thinking_length>"
            ));
        }
    }

    prompt.trim().to_string()
}

/// Agent mode is opted into when the latest user message starts with the
/// `-agent` sentinel.
fn is_agentic_mode(request: &ClaudeRequest) -> bool {
    request
        .messages
        .iter()
        .rev()
        .find(|msg| msg.role == "user")
        .map(|msg| walk_content(&msg.content).text.trim().starts_with("-agent"))
        .unwrap_or(false)
}

/// Fold the message list (excluding the trailing user turn, which becomes
/// the current message) into alternating user/assistant history pairs.
fn build_history(request: &ClaudeRequest, model_id: &str) -> Vec<HistoryEntry> {
    let has_tools = request
        .tools
        .as_ref()
        .map(|t| !t.is_empty())
        .unwrap_or(false);
    if request.messages.len() <= 1 && !has_tools {
        return Vec::new();
    }

    let last_is_assistant = request
        .messages
        .last()
        .map(|m| m.role == "assistant")
        .unwrap_or(false);
    let history_end = if last_is_assistant {
        request.messages.len()
    } else {
        request.messages.len() - 1
    };

    let mut history: Vec<HistoryEntry> = Vec::new();
    let mut user_buffer: Vec<ContentParts> = Vec::new();

    for msg in &request.messages[..history_end] {
        match msg.role.as_str() {
            "user" => user_buffer.push(walk_content(&msg.content)),
            "assistant" => {
                let parts = walk_content(&msg.content);
                if !user_buffer.is_empty() {
                    history.push(merge_user_entries(&user_buffer, model_id));
                    user_buffer.clear();
                    history.push(assistant_entry(parts));
                } else if let Some(HistoryEntry::Assistant {
                    assistant_response_message: previous,
                }) = history.last_mut()
                {
                    // Orphan assistant turn: merge into its predecessor to
                    // preserve alternation.
                    if !parts.text.is_empty() {
                        if !previous.content.is_empty() {
                            previous.content.push('\n');
                        }
                        previous.content.push_str(&parts.text);
                    }
                    if !parts.tool_uses.is_empty() {
                        previous
                            .tool_uses
                            .get_or_insert_with(Vec::new)
                            .extend(to_cw_tool_uses(&parts));
                    }
                }
                // A leading assistant with no user before it is dropped.
            }
            _ => {}
        }
    }

    if !user_buffer.is_empty() {
        history.push(merge_user_entries(&user_buffer, model_id));
        history.push(HistoryEntry::Assistant {
            assistant_response_message: AssistantResponseMessage {
                content: "OK".to_string(),
                tool_uses: None,
            },
        });
    }

    history
}

/// Merge a run of consecutive user messages into a single history entry.
fn merge_user_entries(buffer: &[ContentParts], model_id: &str) -> HistoryEntry {
    let mut texts: Vec<&str> = Vec::new();
    let mut images: Vec<CwImage> = Vec::new();
    let mut tool_results: Vec<CwToolResult> = Vec::new();

    for parts in buffer {
        if !parts.text.is_empty() {
            texts.push(&parts.text);
        }
        images.extend(to_cw_images(parts));
        tool_results.extend(to_cw_tool_results(parts));
    }

    let mut content = texts.join("\n");
    let mut context = UserInputMessageContext::default();
    if !tool_results.is_empty() {
        context.tool_results = tool_results;
        content = String::new();
    }

    HistoryEntry::User {
        user_input_message: UserInputMessage {
            content,
            model_id: model_id.to_string(),
            origin: "AI_EDITOR".to_string(),
            images,
            user_input_message_context: if context.is_empty() {
                None
            } else {
                Some(context)
            },
        },
    }
}

fn assistant_entry(parts: ContentParts) -> HistoryEntry {
    let tool_uses = to_cw_tool_uses(&parts);
    HistoryEntry::Assistant {
        assistant_response_message: AssistantResponseMessage {
            content: parts.text,
            tool_uses: if tool_uses.is_empty() {
                None
            } else {
                Some(tool_uses)
            },
        },
    }
}

fn to_cw_images(parts: &ContentParts) -> Vec<CwImage> {
    parts
        .images
        .iter()
        .map(|img| CwImage {
            format: img.format(),
            source: CwImageSource {
                bytes: img.data.clone(),
            },
        })
        .collect()
}

fn to_cw_tool_results(parts: &ContentParts) -> Vec<CwToolResult> {
    parts
        .tool_results
        .iter()
        .map(|result| CwToolResult {
            tool_use_id: result.tool_use_id.clone(),
            content: result.content.clone(),
            status: result.status.clone(),
        })
        .collect()
}

fn to_cw_tool_uses(parts: &ContentParts) -> Vec<CwToolUse> {
    parts
        .tool_uses
        .iter()
        .map(|tool_use| CwToolUse {
            tool_use_id: tool_use.id.clone(),
            name: tool_use.name.clone(),
            input: tool_use.input.clone(),
        })
        .collect()
}

#[allow(dead_code)]
fn history_alternates(history: &[HistoryEntry]) -> bool {
    history.len() % 2 == 0
        && history
            .iter()
            .enumerate()
            .all(|(i, entry)| entry.is_user() == (i % 2 == 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(v: Value) -> ClaudeRequest {
        serde_json::from_value(v).unwrap()
    }

    fn ctx() -> ConversationContext {
        ConversationContext {
            credential_hash: "deadbeef".into(),
            client_request_id: None,
        }
    }

    fn user_content(entry: &HistoryEntry) -> &str {
        match entry {
            HistoryEntry::User { user_input_message } => &user_input_message.content,
            _ => panic!("expected user entry"),
        }
    }

    fn assistant_content(entry: &HistoryEntry) -> &str {
        match entry {
            HistoryEntry::Assistant {
                assistant_response_message,
            } => &assistant_response_message.content,
            _ => panic!("expected assistant entry"),
        }
    }

    #[test]
    fn test_simple_request() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        let state = &cw.conversation_state;
        assert_eq!(state.chat_trigger_type, "MANUAL");
        assert_eq!(state.current_message.user_input_message.content, "Hi");
        assert_eq!(state.current_message.user_input_message.model_id, "claude-sonnet-4.5");
        assert_eq!(state.current_message.user_input_message.origin, "AI_EDITOR");
        assert!(state.history.is_empty());
        assert_eq!(cw.inference_config.as_ref().unwrap().max_tokens, 16);
    }

    #[test]
    fn test_system_prompt_wrapped_in_system_mode() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "system": "be terse",
            "messages": [{"role": "user", "content": "C"}]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        assert_eq!(
            cw.conversation_state.current_message.user_input_message.content,
            "<system_mode>be terse</system_mode>\n\nC"
        );
    }

    #[test]
    fn test_history_folding_merges_consecutive_users() {
        // [u:"A", u:"B", a:"X", u:"C"] -> history [user:"A\nB", assistant:"X"], current "C"
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "A"},
                {"role": "user", "content": "B"},
                {"role": "assistant", "content": "X"},
                {"role": "user", "content": "C"}
            ]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        let history = &cw.conversation_state.history;
        assert_eq!(history.len(), 2);
        assert_eq!(user_content(&history[0]), "A\nB");
        assert_eq!(assistant_content(&history[1]), "X");
        assert_eq!(cw.conversation_state.current_message.user_input_message.content, "C");
    }

    #[test]
    fn test_no_auto_ok_for_trailing_user() {
        // [u:"A", a:"X", u:"B"] -> history [user:"A", assistant:"X"], current "B"
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "A"},
                {"role": "assistant", "content": "X"},
                {"role": "user", "content": "B"}
            ]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        let history = &cw.conversation_state.history;
        assert_eq!(history.len(), 2);
        assert_eq!(user_content(&history[0]), "A");
        assert_eq!(assistant_content(&history[1]), "X");
        assert_eq!(cw.conversation_state.current_message.user_input_message.content, "B");
    }

    #[test]
    fn test_orphan_users_paired_with_ok() {
        // [u:"A", a:"X", u:"B", u:"C", u:"D"] -> the buffer before the
        // current message pairs with a synthetic OK.
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "A"},
                {"role": "assistant", "content": "X"},
                {"role": "user", "content": "B"},
                {"role": "user", "content": "C"},
                {"role": "user", "content": "D"}
            ]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        let history = &cw.conversation_state.history;
        assert_eq!(history.len(), 4);
        assert_eq!(user_content(&history[2]), "B\nC");
        assert_eq!(assistant_content(&history[3]), "OK");
        assert!(history_alternates(history));
    }

    #[test]
    fn test_orphan_assistant_merges_into_previous() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "A"},
                {"role": "assistant", "content": "X"},
                {"role": "assistant", "content": "Y"},
                {"role": "user", "content": "B"}
            ]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        let history = &cw.conversation_state.history;
        assert_eq!(history.len(), 2);
        assert_eq!(assistant_content(&history[1]), "X\nY");
        assert!(history_alternates(history));
    }

    #[test]
    fn test_trailing_assistant_included_in_history() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "A"},
                {"role": "assistant", "content": "X"}
            ]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        let history = &cw.conversation_state.history;
        assert_eq!(history.len(), 2);
        assert_eq!(assistant_content(&history[1]), "X");
        assert!(history_alternates(history));
    }

    #[test]
    fn test_tool_results_collapse_content() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "system": "sys",
            "messages": [
                {"role": "user", "content": "use the tool"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tooluse_1", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tooluse_1", "content": "rainy"}
                ]}
            ]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        let current = &cw.conversation_state.current_message.user_input_message;
        assert_eq!(current.content, "<system_mode>sys</system_mode>");
        let context = current.user_input_message_context.as_ref().unwrap();
        assert_eq!(context.tool_results.len(), 1);
        assert_eq!(context.tool_results[0].tool_use_id, "tooluse_1");
    }

    #[test]
    fn test_placeholder_injected_for_tools_without_text() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": ""}],
            "tools": [{"name": "grep", "description": "", "input_schema": {}}]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        assert_eq!(
            cw.conversation_state.current_message.user_input_message.content,
            "执行工具任务"
        );
    }

    #[test]
    fn test_empty_content_rejected() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": ""}]
        }));
        assert!(matches!(
            build_codewhisperer_request(&req, &ctx(), None),
            Err(TranslateError::EmptyContent)
        ));
    }

    #[test]
    fn test_empty_messages_rejected() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": []
        }));
        assert!(matches!(
            build_codewhisperer_request(&req, &ctx(), None),
            Err(TranslateError::EmptyMessages)
        ));
    }

    #[test]
    fn test_empty_model_rejected() {
        let req = request(json!({
            "model": "",
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        assert!(matches!(
            build_codewhisperer_request(&req, &ctx(), None),
            Err(TranslateError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_thinking_tag_appended() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "system": "sys",
            "thinking": {"type": "enabled", "budget_tokens": 4096},
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        let content = &cw.conversation_state.current_message.user_input_message.content;
        assert!(content.contains("<thinking_mode>interleaved</thinking_mode>"));
        assert!(content.contains("<max_thinking_length>4096</max_thinking_length>"));
    }

    #[test]
    fn test_thinking_default_budget() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "thinking": {"type": "enabled"},
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        assert!(cw
            .conversation_state
            .current_message
            .user_input_message
            .content
            .contains("<max_thinking_length>16000</max_thinking_length>"));
    }

    #[test]
    fn test_agentic_prompt_injected() {
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "-agent do the thing"}]
        }));
        let cw = build_codewhisperer_request(&req, &ctx(), None).unwrap();
        assert!(cw
            .conversation_state
            .current_message
            .user_input_message
            .content
            .contains("CHUNKED WRITE PROTOCOL"));
    }

    #[test]
    fn test_stable_conversation_id_deterministic() {
        let a = stable_conversation_id("hash", Some("req-1"));
        let b = stable_conversation_id("hash", Some("req-1"));
        let c = stable_conversation_id("hash", Some("req-2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fresh_id_without_request_id() {
        let a = stable_conversation_id("hash", None);
        let b = stable_conversation_id("hash", None);
        assert_ne!(a, b);
    }

    use proptest::prelude::*;

    proptest! {
        /// History is always even-length and strictly alternating no
        /// matter how roles repeat in the input.
        #[test]
        fn prop_history_alternates(roles in proptest::collection::vec(0..2usize, 1..12)) {
            let messages: Vec<Value> = roles
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    json!({
                        "role": if *r == 0 { "user" } else { "assistant" },
                        "content": format!("m{i}")
                    })
                })
                .collect();
            let req = request(json!({
                "model": "claude-sonnet-4-5",
                "messages": messages
            }));

            if let Ok(cw) = build_codewhisperer_request(&req, &ctx(), None) {
                let history = &cw.conversation_state.history;
                prop_assert!(history.len() % 2 == 0, "history length {} odd", history.len());
                for (i, entry) in history.iter().enumerate() {
                    prop_assert_eq!(entry.is_user(), i % 2 == 0, "entry {} breaks alternation", i);
                }
            }
        }
    }
}
