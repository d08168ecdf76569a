//! Binary event-stream decoding for Bedrock-family responses
//!
//! Bedrock streams responses as length-prefixed binary frames:
//!
//! ```text
//! [ total_len u32 | headers_len u32 | prelude_crc u32 ]
//! [ headers: (name_len u8, name, type u8, value...)* ]
//! [ payload ]
//! [ message_crc u32 ]
//! ```
//!
//! The payload of a `chunk` event is JSON `{"bytes": "<base64>"}` whose
//! decoded content is one Messages-API stream event. The decoder re-emits
//! each as a canonical SSE event named by the inner `type` field. Frames
//! may straddle network chunks, so the decoder buffers across `feed` calls.
//! Length fields are trusted; the CRCs are not verified.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::{Error, Result, StreamDecoder};

/// Frame prelude plus trailing CRC.
const FRAME_OVERHEAD: usize = 16;
/// Upper bound on a single frame, guarding against corrupt length fields.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamDecoder for EventStreamDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Result<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            if self.buffer.len() < 12 {
                break;
            }
            let total_len = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap()) as usize;
            if total_len < FRAME_OVERHEAD || total_len > MAX_FRAME_LEN {
                return Err(Error::Decode(format!(
                    "implausible event-stream frame length {total_len}"
                )));
            }
            if self.buffer.len() < total_len {
                break;
            }
            let frame = self.buffer.split_to(total_len);
            if let Some(event) = decode_frame(&frame)? {
                out.push_str(&event);
            }
        }

        Ok(Bytes::from(out))
    }
}

/// Decode one complete frame into an SSE event, or None for frames that
/// carry nothing forwardable (e.g. empty ping payloads).
fn decode_frame(frame: &[u8]) -> Result<Option<String>> {
    let headers_len = u32::from_be_bytes(frame[4..8].try_into().unwrap()) as usize;
    let headers_end = 12 + headers_len;
    if headers_end + 4 > frame.len() {
        return Err(Error::Decode("frame headers overrun frame length".into()));
    }
    let headers = parse_headers(&frame[12..headers_end])?;
    let payload = &frame[headers_end..frame.len() - 4];

    if headers.message_type.as_deref() == Some("exception") {
        let detail = headers
            .exception_type
            .unwrap_or_else(|| "unknown".to_string());
        return Err(Error::Decode(format!(
            "upstream exception event: {detail}: {}",
            String::from_utf8_lossy(payload)
        )));
    }

    if payload.is_empty() {
        return Ok(None);
    }

    let envelope: Value = serde_json::from_slice(payload)
        .map_err(|e| Error::Decode(format!("frame payload is not JSON: {e}")))?;
    let inner = match envelope.get("bytes").and_then(Value::as_str) {
        Some(encoded) => {
            let decoded = BASE64
                .decode(encoded)
                .map_err(|e| Error::Decode(format!("frame payload base64 invalid: {e}")))?;
            serde_json::from_slice::<Value>(&decoded)
                .map_err(|e| Error::Decode(format!("decoded chunk is not JSON: {e}")))?
        }
        None => envelope,
    };

    let event_type = inner
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Decode("stream event missing type field".into()))?
        .to_string();

    Ok(Some(format!("event: {event_type}\ndata: {inner}\n\n")))
}

#[derive(Debug, Default)]
struct FrameHeaders {
    message_type: Option<String>,
    exception_type: Option<String>,
}

/// Walk the header block. Only string-typed headers are of interest; other
/// value types are skipped by their fixed widths.
fn parse_headers(mut block: &[u8]) -> Result<FrameHeaders> {
    let mut headers = FrameHeaders::default();
    while !block.is_empty() {
        let name_len = block[0] as usize;
        block = &block[1..];
        if block.len() < name_len + 1 {
            return Err(Error::Decode("truncated header name".into()));
        }
        let name = String::from_utf8_lossy(&block[..name_len]).to_string();
        let value_type = block[name_len];
        block = &block[name_len + 1..];

        let value = match value_type {
            // bool true / bool false carry no value bytes
            0 | 1 => {
                None
            }
            2 => {
                block = skip(block, 1)?;
                None
            }
            3 => {
                block = skip(block, 2)?;
                None
            }
            4 => {
                block = skip(block, 4)?;
                None
            }
            5 | 8 => {
                block = skip(block, 8)?;
                None
            }
            // byte array and string are u16-length-prefixed
            6 | 7 => {
                if block.len() < 2 {
                    return Err(Error::Decode("truncated header value length".into()));
                }
                let len = u16::from_be_bytes(block[0..2].try_into().unwrap()) as usize;
                if block.len() < 2 + len {
                    return Err(Error::Decode("truncated header value".into()));
                }
                let value = String::from_utf8_lossy(&block[2..2 + len]).to_string();
                block = &block[2 + len..];
                Some(value)
            }
            9 => {
                block = skip(block, 16)?;
                None
            }
            other => {
                return Err(Error::Decode(format!("unknown header value type {other}")));
            }
        };

        match name.as_str() {
            ":message-type" => headers.message_type = value,
            ":exception-type" => headers.exception_type = value,
            _ => {}
        }
    }
    Ok(headers)
}

fn skip(block: &[u8], n: usize) -> Result<&[u8]> {
    if block.len() < n {
        return Err(Error::Decode("truncated header value".into()));
    }
    Ok(&block[n..])
}
