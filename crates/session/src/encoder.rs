//! Builds wire-safe command payloads.
//!
//! Script source is base64-encoded inside a `[CMD:BROWSER_JS]` directive so
//! that brackets, quotes, newlines and non-ASCII text survive the outer JSON
//! framing untouched. The server decodes it; [`CommandEncoder::decode`]
//! exists for that side and for verification.

use base64::Engine;
use browserlink_core::{CorrelationId, Error, Message, Result};
use serde_json::Value;

pub const BROWSER_JS_PREFIX: &str = "[CMD:BROWSER_JS]";

pub struct CommandEncoder;

impl CommandEncoder {
    pub fn encode(script: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(script.as_bytes());
        format!("{} {}", BROWSER_JS_PREFIX, encoded)
    }

    pub fn decode(directive: &str) -> Result<String> {
        let payload = directive
            .strip_prefix(BROWSER_JS_PREFIX)
            .ok_or_else(|| Error::Encoding(format!("not a {} directive", BROWSER_JS_PREFIX)))?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim_end())
            .map_err(|e| Error::Encoding(format!("invalid base64 payload: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| Error::Encoding(format!("payload is not UTF-8: {}", e)))
    }

    pub fn is_directive(text: &str) -> bool {
        text.starts_with(BROWSER_JS_PREFIX)
    }

    /// Task message asking the server to run `script` in the browser context.
    pub fn script_task(id: CorrelationId, script: &str) -> Message {
        Message::task(id, Some("system"), Value::String(Self::encode(script)))
    }
}
