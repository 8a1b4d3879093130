// EventStream -> Claude SSE re-emission.
//
// One instance per request tracks every opened content block so the
// outgoing stream is always well formed: message_start first, every
// opened block closed before message_delta, message_stop last. Output
// tokens are charged from the bytes actually emitted downstream, not from
// anything the upstream claims.

use std::collections::{BTreeMap, HashMap};

use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::MESSAGE_ID_TIME_FORMAT;
use crate::errors::map_upstream_error;
use crate::parser::EventStreamMessage;
use crate::prompt_cache::CacheResult;
use crate::stream::events::{self, ContentBlockShape, Delta, UsageInfo};
use crate::stream::thinking::{SplitEvent, ThinkingSplitter};
use crate::tokenizer::TokenEstimator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

#[derive(Debug)]
struct BlockState {
    kind: BlockKind,
    closed: bool,
}

#[derive(Debug)]
struct ActiveTool {
    index: usize,
    id: String,
    name: String,
    input_buffer: String,
}

/// Block contents kept for the non-streaming JSON body.
#[derive(Debug, Clone)]
enum CollectedBlock {
    Text(String),
    Thinking {
        text: String,
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug)]
enum UpstreamEvent {
    Text(String),
    ToolUseStart { id: String, name: String },
    ToolInput(String),
    ToolStop,
    Unknown,
}

pub struct StreamStateMachine {
    message_id: String,
    model: String,
    estimator: TokenEstimator,

    input_tokens: usize,
    cache_creation_tokens: usize,
    cache_read_tokens: usize,
    output_tokens: usize,

    blocks: HashMap<usize, BlockState>,
    next_index: usize,
    current_text: Option<usize>,
    current_thinking: Option<usize>,
    tool_indices: HashMap<String, usize>,
    current_tool: Option<ActiveTool>,

    message_start_sent: bool,
    ping_sent: bool,
    saw_tool_use: bool,
    saw_max_tokens: bool,

    splitter: ThinkingSplitter,
    collected: BTreeMap<usize, CollectedBlock>,
}

impl StreamStateMachine {
    pub fn new(model: &str, input_tokens: usize, cache: &CacheResult) -> Self {
        let message_id = format!(
            "msg_{}",
            chrono::Local::now().format(MESSAGE_ID_TIME_FORMAT)
        );
        Self {
            message_id,
            model: model.to_string(),
            estimator: TokenEstimator::new(),
            input_tokens,
            cache_creation_tokens: cache.cache_creation_tokens,
            cache_read_tokens: cache.cache_read_tokens,
            output_tokens: 0,
            blocks: HashMap::new(),
            next_index: 0,
            current_text: None,
            current_thinking: None,
            tool_indices: HashMap::new(),
            current_tool: None,
            message_start_sent: false,
            ping_sent: false,
            saw_tool_use: false,
            saw_max_tokens: false,
            splitter: ThinkingSplitter::new(),
            collected: BTreeMap::new(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Process one decoded frame. Returns the SSE text to emit and whether
    /// the stream must terminate now (fatal upstream error).
    pub fn process_message(&mut self, message: &EventStreamMessage) -> (String, bool) {
        if message.message_type == "exception" || message.message_type == "error" {
            let payload = String::from_utf8_lossy(&message.payload).to_string();
            return self.process_exception(&payload);
        }

        let mut out = String::new();
        self.ensure_message_start(&mut out);

        match classify_event(message) {
            UpstreamEvent::Text(text) => {
                let split_events = self.splitter.feed(&text);
                for event in split_events {
                    self.apply_split_event(event, &mut out);
                }
            }
            UpstreamEvent::ToolUseStart { id, name } => {
                self.close_text_block(&mut out);
                self.finalize_tool(&mut out);

                let index = self.next_index;
                self.next_index += 1;
                self.blocks.insert(
                    index,
                    BlockState {
                        kind: BlockKind::ToolUse,
                        closed: false,
                    },
                );
                self.tool_indices.insert(id.clone(), index);
                out.push_str(&events::content_block_start(
                    index,
                    ContentBlockShape::tool_use(&id, &name),
                ));
                self.send_ping_once(&mut out);
                self.current_tool = Some(ActiveTool {
                    index,
                    id,
                    name,
                    input_buffer: String::new(),
                });
            }
            UpstreamEvent::ToolInput(fragment) => {
                if let Some(tool) = &mut self.current_tool {
                    tool.input_buffer.push_str(&fragment);
                    out.push_str(&events::content_block_delta(
                        tool.index,
                        Delta::input_json(fragment),
                    ));
                }
            }
            UpstreamEvent::ToolStop => {
                self.finalize_tool(&mut out);
            }
            UpstreamEvent::Unknown => {}
        }

        (out, false)
    }

    /// Route an exception frame through the error mapper. A length-cap
    /// exception is not an error: it becomes the max_tokens stop reason.
    fn process_exception(&mut self, payload: &str) -> (String, bool) {
        let mapped = map_upstream_error(500, payload);
        if mapped.max_tokens {
            self.saw_max_tokens = true;
            return (String::new(), false);
        }

        tracing::warn!(code = mapped.code.as_str(), "upstream exception mid-stream");
        let mut out = String::new();
        self.ensure_message_start(&mut out);
        out.push_str(&events::error(mapped.code.sse_type(), &mapped.message));
        out.push_str(&events::message_stop());
        (out, true)
    }

    /// Stream end: flush the splitter, close whatever is still open, and
    /// emit message_delta + message_stop.
    pub fn finalize(&mut self) -> String {
        let mut out = String::new();
        self.ensure_message_start(&mut out);

        let split_events = self.splitter.finish();
        for event in split_events {
            self.apply_split_event(event, &mut out);
        }
        self.finalize_tool(&mut out);

        let mut open: Vec<usize> = self
            .blocks
            .iter()
            .filter(|(_, block)| !block.closed)
            .map(|(index, _)| *index)
            .collect();
        open.sort_unstable();
        for index in open {
            if let Some(block) = self.blocks.get_mut(&index) {
                tracing::debug!(index, kind = ?block.kind, "closing dangling block");
                block.closed = true;
            }
            out.push_str(&events::content_block_stop(index));
        }
        self.current_text = None;
        self.current_thinking = None;

        if self.output_tokens == 0 && !self.collected.is_empty() {
            self.output_tokens = 1;
        }

        out.push_str(&events::message_delta(self.stop_reason(), self.usage()));
        out.push_str(&events::message_stop());
        out
    }

    pub fn stop_reason(&self) -> &'static str {
        if self.saw_tool_use {
            "tool_use"
        } else if self.saw_max_tokens {
            "max_tokens"
        } else {
            "end_turn"
        }
    }

    pub fn output_tokens(&self) -> usize {
        self.output_tokens
    }

    /// Assemble the non-streaming JSON body from the same bookkeeping.
    pub fn non_stream_message(&self) -> Value {
        let content: Vec<Value> = self
            .collected
            .values()
            .map(|block| match block {
                CollectedBlock::Text(text) => json!({"type": "text", "text": text}),
                CollectedBlock::Thinking { text, signature } => json!({
                    "type": "thinking",
                    "thinking": text,
                    "signature": signature.clone().unwrap_or_default(),
                }),
                CollectedBlock::ToolUse { id, name, input } => json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                }),
            })
            .collect();

        json!({
            "id": self.message_id,
            "type": "message",
            "role": "assistant",
            "model": self.model,
            "content": content,
            "stop_reason": self.stop_reason(),
            "stop_sequence": null,
            "usage": self.usage(),
        })
    }

    fn usage(&self) -> UsageInfo {
        UsageInfo {
            cache_creation_input_tokens: (self.cache_creation_tokens > 0)
                .then_some(self.cache_creation_tokens),
            cache_read_input_tokens: (self.cache_read_tokens > 0).then_some(self.cache_read_tokens),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }

    fn ensure_message_start(&mut self, out: &mut String) {
        if self.message_start_sent {
            return;
        }
        self.message_start_sent = true;
        let usage = UsageInfo {
            output_tokens: 0,
            ..self.usage()
        };
        out.push_str(&events::message_start(&self.message_id, &self.model, usage));
    }

    fn send_ping_once(&mut self, out: &mut String) {
        if !self.ping_sent {
            self.ping_sent = true;
            out.push_str(&events::ping());
        }
    }

    fn apply_split_event(&mut self, event: SplitEvent, out: &mut String) {
        match event {
            SplitEvent::Text(text) => {
                let index = match self.current_text {
                    Some(index) => index,
                    None => {
                        let index = self.next_index;
                        self.next_index += 1;
                        self.blocks.insert(
                            index,
                            BlockState {
                                kind: BlockKind::Text,
                                closed: false,
                            },
                        );
                        self.current_text = Some(index);
                        out.push_str(&events::content_block_start(
                            index,
                            ContentBlockShape::text(),
                        ));
                        self.send_ping_once(out);
                        self.collected
                            .insert(index, CollectedBlock::Text(String::new()));
                        index
                    }
                };
                self.output_tokens += self.estimator.estimate_text_tokens(&text);
                if let Some(CollectedBlock::Text(collected)) = self.collected.get_mut(&index) {
                    collected.push_str(&text);
                }
                out.push_str(&events::content_block_delta(index, Delta::text(text)));
            }
            SplitEvent::ThinkingStart => {
                self.close_text_block(out);
                let index = self.next_index;
                self.next_index += 1;
                self.blocks.insert(
                    index,
                    BlockState {
                        kind: BlockKind::Thinking,
                        closed: false,
                    },
                );
                self.current_thinking = Some(index);
                out.push_str(&events::content_block_start(
                    index,
                    ContentBlockShape::thinking(),
                ));
                self.send_ping_once(out);
                self.collected.insert(
                    index,
                    CollectedBlock::Thinking {
                        text: String::new(),
                        signature: None,
                    },
                );
            }
            SplitEvent::ThinkingDelta(text) => {
                if let Some(index) = self.current_thinking {
                    self.output_tokens += self.estimator.estimate_text_tokens(&text);
                    if let Some(CollectedBlock::Thinking { text: collected, .. }) =
                        self.collected.get_mut(&index)
                    {
                        collected.push_str(&text);
                    }
                    out.push_str(&events::content_block_delta(index, Delta::thinking(text)));
                }
            }
            SplitEvent::ThinkingEnd => {
                if let Some(index) = self.current_thinking.take() {
                    let signature = self.synthesize_signature(index);
                    if let Some(CollectedBlock::Thinking {
                        signature: stored, ..
                    }) = self.collected.get_mut(&index)
                    {
                        *stored = Some(signature.clone());
                    }
                    out.push_str(&events::content_block_delta(
                        index,
                        Delta::signature(signature),
                    ));
                    out.push_str(&events::content_block_stop(index));
                    if let Some(block) = self.blocks.get_mut(&index) {
                        block.closed = true;
                    }
                }
            }
        }
    }

    fn close_text_block(&mut self, out: &mut String) {
        if let Some(index) = self.current_text.take() {
            out.push_str(&events::content_block_stop(index));
            if let Some(block) = self.blocks.get_mut(&index) {
                block.closed = true;
            }
        }
    }

    /// Close the in-flight tool block, parsing its accumulated input.
    fn finalize_tool(&mut self, out: &mut String) {
        if let Some(tool) = self.current_tool.take() {
            let input: Value = if tool.input_buffer.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&tool.input_buffer).unwrap_or_else(|_| json!({}))
            };

            self.output_tokens += self.estimator.estimate_tool_use_tokens(&tool.name, &input);
            self.saw_tool_use = true;
            self.collected.insert(
                tool.index,
                CollectedBlock::ToolUse {
                    id: tool.id,
                    name: tool.name,
                    input,
                },
            );

            out.push_str(&events::content_block_stop(tool.index));
            if let Some(block) = self.blocks.get_mut(&tool.index) {
                block.closed = true;
            }
        }
    }

    /// The upstream carries no thinking signatures; a deterministic stand-in
    /// keeps clients that verify presence happy.
    fn synthesize_signature(&self, index: usize) -> String {
        let length = match self.collected.get(&index) {
            Some(CollectedBlock::Thinking { text, .. }) => text.len(),
            _ => 0,
        };
        let mut hasher = Sha256::new();
        hasher.update(self.message_id.as_bytes());
        hasher.update(length.to_be_bytes());
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    }
}

/// Map a frame payload onto the upstream event vocabulary. Order matters:
/// input fragments may also carry name/toolUseId, so `input` is checked
/// before the start shape.
fn classify_event(message: &EventStreamMessage) -> UpstreamEvent {
    let Some(payload) = message.payload_json() else {
        return UpstreamEvent::Unknown;
    };

    if payload.get("stop").and_then(Value::as_bool).unwrap_or(false) {
        return UpstreamEvent::ToolStop;
    }

    if let Some(fragment) = payload.get("input").and_then(Value::as_str) {
        return UpstreamEvent::ToolInput(fragment.to_string());
    }

    if let (Some(name), Some(id)) = (
        payload.get("name").and_then(Value::as_str),
        payload.get("toolUseId").and_then(Value::as_str),
    ) {
        return UpstreamEvent::ToolUseStart {
            id: id.to_string(),
            name: name.to_string(),
        };
    }

    if let Some(content) = payload.get("content").and_then(Value::as_str) {
        return UpstreamEvent::Text(content.to_string());
    }

    UpstreamEvent::Unknown
}
