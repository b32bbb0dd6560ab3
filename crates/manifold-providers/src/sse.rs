//! Incremental parsers for the two streaming wire shapes the cloud providers
//! use: server-sent events (`data: ` lines, `[DONE]` terminator) and
//! newline-delimited JSON (Ollama, `"done": true` terminator).

/// Literal payload that terminates an OpenAI-style SSE stream.
pub const SSE_DONE: &str = "[DONE]";

/// Collects `data: ` payloads out of an SSE byte stream. Comment lines,
/// `event:` lines, and blank keep-alives are skipped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push raw bytes, get back every completed `data:` payload.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim().to_string();
            self.buffer.drain(..=newline_pos);
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data: ") {
                payloads.push(data.to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
            // "event: ..." and other fields are skipped
        }
        payloads
    }
}

/// Splits newline-delimited JSON out of a byte stream.
#[derive(Debug, Default)]
pub struct NdjsonParser {
    buffer: String,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push raw bytes, get back every completed non-empty line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim().to_string();
            self.buffer.drain(..=newline_pos);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}
