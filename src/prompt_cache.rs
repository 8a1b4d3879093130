// Content-addressed prompt cache with Anthropic-style cache_control
// accounting. Entries are keyed by SHA-256 of the block content and live
// for their declared TTL; every hit pushes the expiry forward. Only blocks
// explicitly marked {"cache_control": {"type": "ephemeral"}} create
// entries, but any block can hit one.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::mappers::claude::models::{
    CacheControl, ClaudeRequest, ContentBlock, MessageContent, SystemPrompt,
};
use crate::tokenizer::TokenEstimator;

const TOOL_RESULT_BYTES_PER_TOKEN: usize = 4;
const IMAGE_TOKENS: usize = 1500;

#[derive(Debug, Clone)]
struct CacheEntry {
    tokens: usize,
    expires_at: Instant,
    /// "5m" or "1h"; used to refresh the expiry on hit.
    ttl: String,
}

/// Per-request accounting folded into the response usage object.
#[derive(Debug, Clone, Default)]
pub struct CacheResult {
    pub total_tokens: usize,
    pub cache_creation_tokens: usize,
    pub cache_read_tokens: usize,
}

pub struct PromptCache {
    entries: DashMap<String, CacheEntry>,
}

static GLOBAL_CACHE: OnceCell<PromptCache> = OnceCell::new();

/// Install the process-wide cache and start its sweeper. Returns a handle
/// that stops the sweeper.
pub fn init_global_cache(clean_interval: Duration) -> CancellationToken {
    let cache = GLOBAL_CACHE.get_or_init(PromptCache::new);
    let cancel = CancellationToken::new();
    let child = cancel.child_token();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(clean_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = child.cancelled() => break,
                _ = interval.tick() => {
                    let cleaned = cache.clean_expired();
                    if cleaned > 0 {
                        tracing::info!(cleaned, remaining = cache.len(), "prompt cache sweep");
                    }
                }
            }
        }
    });

    tracing::info!(interval_secs = clean_interval.as_secs(), "prompt cache initialized");
    cancel
}

pub fn global_cache() -> Option<&'static PromptCache> {
    GLOBAL_CACHE.get()
}

impl PromptCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a hash. A live hit refreshes the expiry from the stored
    /// TTL; an expired entry is removed lazily.
    pub fn get(&self, hash: &str) -> Option<usize> {
        let now = Instant::now();
        match self.entries.get_mut(hash) {
            Some(mut entry) => {
                if now > entry.expires_at {
                    drop(entry);
                    self.entries.remove(hash);
                    return None;
                }
                entry.expires_at = now + ttl_duration(&entry.ttl);
                Some(entry.tokens)
            }
            None => None,
        }
    }

    pub fn set(&self, hash: String, tokens: usize, ttl: &str) {
        self.entries.insert(
            hash,
            CacheEntry {
                tokens,
                expires_at: Instant::now() + ttl_duration(ttl),
                ttl: ttl.to_string(),
            },
        );
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn clean_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.expires_at);
        before - self.entries.len()
    }

    /// Walk a request's system prompts and messages, scoring each
    /// hashable unit against the cache.
    pub fn process_request(&self, request: &ClaudeRequest, input_tokens: usize) -> CacheResult {
        let estimator = TokenEstimator::new();
        let mut result = CacheResult {
            total_tokens: input_tokens,
            ..Default::default()
        };

        match &request.system {
            Some(SystemPrompt::String(text)) => {
                if !text.is_empty() {
                    let tokens = estimator.estimate_text_tokens(text) + 2;
                    self.score_unit(hash_text(text), tokens, None, &mut result);
                }
            }
            Some(SystemPrompt::Array(blocks)) => {
                for block in blocks {
                    if block.text.is_empty() {
                        continue;
                    }
                    let tokens = estimator.estimate_text_tokens(&block.text) + 2;
                    self.score_unit(
                        hash_text(&block.text),
                        tokens,
                        block.cache_control.as_ref(),
                        &mut result,
                    );
                }
            }
            None => {}
        }

        for message in &request.messages {
            match &message.content {
                MessageContent::String(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    let tokens = estimator.estimate_text_tokens(text);
                    // Bare string messages carry no marker: hit-only.
                    self.score_unit(hash_text(text), tokens, None, &mut result);
                }
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        self.score_typed_block(&estimator, block, &mut result);
                    }
                }
                MessageContent::Loose(values) => {
                    for value in values {
                        self.score_loose_block(&estimator, value, &mut result);
                    }
                }
            }
        }

        result
    }

    fn score_typed_block(
        &self,
        estimator: &TokenEstimator,
        block: &ContentBlock,
        result: &mut CacheResult,
    ) {
        let (hash, tokens, cache_control) = match block {
            ContentBlock::Text {
                text,
                cache_control,
            } => {
                if text.is_empty() {
                    return;
                }
                (
                    hash_text(text),
                    estimator.estimate_text_tokens(text),
                    cache_control.as_ref(),
                )
            }
            ContentBlock::ToolUse {
                name,
                input,
                cache_control,
                ..
            } => {
                let Ok(serialized) = serde_json::to_vec(block) else {
                    return;
                };
                (
                    hash_bytes(&serialized),
                    estimator.estimate_tool_use_tokens(name, input),
                    cache_control.as_ref(),
                )
            }
            ContentBlock::ToolResult { cache_control, .. } => {
                let Ok(serialized) = serde_json::to_vec(block) else {
                    return;
                };
                let tokens = (serialized.len() / TOOL_RESULT_BYTES_PER_TOKEN).max(1);
                (hash_bytes(&serialized), tokens, cache_control.as_ref())
            }
            ContentBlock::Image { cache_control, .. } => {
                let Ok(serialized) = serde_json::to_vec(block) else {
                    return;
                };
                (hash_bytes(&serialized), IMAGE_TOKENS, cache_control.as_ref())
            }
            other => {
                let Ok(serialized) = serde_json::to_vec(other) else {
                    return;
                };
                let tokens = (serialized.len() / TOOL_RESULT_BYTES_PER_TOKEN).max(1);
                (hash_bytes(&serialized), tokens, None)
            }
        };

        self.score_unit(hash, tokens, cache_control, result);
    }

    fn score_loose_block(
        &self,
        estimator: &TokenEstimator,
        block: &Value,
        result: &mut CacheResult,
    ) {
        let cache_control: Option<CacheControl> = block
            .get("cache_control")
            .and_then(|cc| serde_json::from_value(cc.clone()).ok());
        let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");

        let (hash, tokens) = match block_type {
            "text" => {
                let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                if text.is_empty() {
                    return;
                }
                (hash_text(text), estimator.estimate_text_tokens(text))
            }
            "tool_use" => {
                let Ok(serialized) = serde_json::to_vec(block) else {
                    return;
                };
                let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("");
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                (
                    hash_bytes(&serialized),
                    estimator.estimate_tool_use_tokens(name, &input),
                )
            }
            "image" => {
                let Ok(serialized) = serde_json::to_vec(block) else {
                    return;
                };
                (hash_bytes(&serialized), IMAGE_TOKENS)
            }
            _ => {
                let Ok(serialized) = serde_json::to_vec(block) else {
                    return;
                };
                let tokens = (serialized.len() / TOOL_RESULT_BYTES_PER_TOKEN).max(1);
                (hash_bytes(&serialized), tokens)
            }
        };

        self.score_unit(hash, tokens, cache_control.as_ref(), result);
    }

    /// Hit: count stored tokens as reads. Miss with an ephemeral marker:
    /// create and count as creation. Bare miss: nothing.
    fn score_unit(
        &self,
        hash: String,
        tokens: usize,
        cache_control: Option<&CacheControl>,
        result: &mut CacheResult,
    ) {
        if let Some(stored) = self.get(&hash) {
            result.cache_read_tokens += stored;
            return;
        }

        let ephemeral = cache_control
            .map(|cc| cc.type_ == "ephemeral")
            .unwrap_or(false);
        if ephemeral {
            let ttl = cache_control
                .and_then(|cc| cc.ttl.as_deref())
                .unwrap_or("5m");
            self.set(hash, tokens, ttl);
            result.cache_creation_tokens += tokens;
        }
    }
}

impl Default for PromptCache {
    fn default() -> Self {
        Self::new()
    }
}

/// "1h" is one hour, anything else five minutes.
fn ttl_duration(ttl: &str) -> Duration {
    match ttl {
        "1h" => Duration::from_secs(3600),
        _ => Duration::from_secs(300),
    }
}

pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

fn hash_bytes(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex_encode(&digest)
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
