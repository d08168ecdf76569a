//! SSE forwarding with signature sniffing
//!
//! The scanner watches the event stream line by line while forwarding it.
//! Bytes pass through verbatim — the forwarded stream is a byte-exact
//! prefix of the upstream stream — with one exception: a `signature_delta`
//! is rewritten inline when the backend's model group differs from the
//! client-facing one and a signature for the client group is cached.
//!
//! While forwarding it also collects what the bookkeeping needs: the
//! thinking text and signature of each thinking block (cached on the
//! block's completion event), the usage figures from `message_start` and
//! `message_delta`, and whether `message_stop` was observed. Nothing is
//! buffered for reordering and nothing is fabricated: if the upstream
//! truncates, the output simply stops.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use provider::model_group;
use serde_json::Value;

use crate::signature::{text_hash, SignatureCache};

#[derive(Debug, Default)]
struct ThinkingBlock {
    text: String,
    signature: Option<String>,
}

/// Line-oriented scanner over an SSE stream.
pub struct SseScanner {
    cache: Arc<SignatureCache>,
    client_group: String,
    backend_group: Option<String>,
    pending: BytesMut,
    current_event: String,
    blocks: HashMap<u64, ThinkingBlock>,
    input_tokens: u64,
    output_tokens: u64,
    saw_message_stop: bool,
}

impl SseScanner {
    pub fn new(cache: Arc<SignatureCache>, client_model: &str) -> Self {
        Self {
            cache,
            client_group: model_group(client_model).to_string(),
            backend_group: None,
            pending: BytesMut::new(),
            current_event: String::new(),
            blocks: HashMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            saw_message_stop: false,
        }
    }

    /// Total reported usage so far (input + output tokens).
    pub fn usage_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Whether the canonical terminator has been observed.
    pub fn complete(&self) -> bool {
        self.saw_message_stop
    }

    /// Process a chunk: complete lines are inspected and emitted, a
    /// trailing partial line is held until the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Bytes {
        self.pending.extend_from_slice(chunk);
        let mut out = BytesMut::new();

        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line = self.pending.split_to(newline + 1);
            match self.process_line(&line[..line.len() - 1]) {
                Some(replacement) => {
                    out.extend_from_slice(replacement.as_bytes());
                    out.extend_from_slice(b"\n");
                }
                None => out.extend_from_slice(&line),
            }
        }
        out.freeze()
    }

    /// Flush whatever partial line remains once the upstream closes.
    pub fn finish(&mut self) -> Bytes {
        self.pending.split().freeze()
    }

    /// Inspect one line (without its trailing newline). Returns a
    /// replacement line when a signature rewrite applies, None to forward
    /// the original bytes untouched.
    fn process_line(&mut self, line: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(line).ok()?;
        let text = text.strip_suffix('\r').unwrap_or(text);

        if let Some(event) = text.strip_prefix("event:") {
            self.current_event = event.trim().to_string();
            return None;
        }
        let data = text.strip_prefix("data:")?.trim_start();
        let json: Value = serde_json::from_str(data).ok()?;

        match self.current_event.as_str() {
            "message_start" => {
                if let Some(model) = json["message"]["model"].as_str() {
                    self.backend_group = Some(model_group(model).to_string());
                }
                if let Some(input) = json["message"]["usage"]["input_tokens"].as_u64() {
                    self.input_tokens = input;
                }
                None
            }
            "content_block_start" => {
                if json["content_block"]["type"].as_str() == Some("thinking")
                    && let Some(index) = json["index"].as_u64()
                {
                    self.blocks.insert(index, ThinkingBlock::default());
                }
                None
            }
            "content_block_delta" => self.handle_delta(json),
            "content_block_stop" => {
                if let Some(index) = json["index"].as_u64()
                    && let Some(block) = self.blocks.remove(&index)
                    && let Some(signature) = block.signature
                    && !block.text.is_empty()
                {
                    let group = self
                        .backend_group
                        .clone()
                        .unwrap_or_else(|| self.client_group.clone());
                    self.cache
                        .insert(&group, &text_hash(&block.text), signature);
                }
                None
            }
            "message_delta" => {
                if let Some(output) = json["usage"]["output_tokens"].as_u64() {
                    self.output_tokens = output;
                }
                if let Some(input) = json["usage"]["input_tokens"].as_u64() {
                    self.input_tokens = input;
                }
                None
            }
            "message_stop" => {
                self.saw_message_stop = true;
                None
            }
            _ => None,
        }
    }

    fn handle_delta(&mut self, mut json: Value) -> Option<String> {
        let index = json["index"].as_u64()?;
        match json["delta"]["type"].as_str() {
            Some("thinking_delta") => {
                if let Some(text) = json["delta"]["thinking"].as_str()
                    && let Some(block) = self.blocks.get_mut(&index)
                {
                    block.text.push_str(text);
                }
                None
            }
            Some("signature_delta") => {
                let signature = json["delta"]["signature"].as_str()?.to_string();
                let block = self.blocks.get_mut(&index)?;
                block.signature = Some(signature);

                // Cross-group response: substitute the signature that is
                // valid for the client-facing group, when one is cached.
                let cross_group = self
                    .backend_group
                    .as_deref()
                    .is_some_and(|g| g != self.client_group);
                if !cross_group {
                    return None;
                }
                let cached = self
                    .cache
                    .get(&self.client_group, &text_hash(&block.text))?;
                json["delta"]["signature"] = Value::String(cached);
                Some(format!("data: {json}"))
            }
            _ => None,
        }
    }
}
