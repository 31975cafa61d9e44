/// Events emitted while streaming a chat completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// Stream completed.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        finish_reason: String,
    },

    /// Error during streaming.
    Error { message: String },
}

/// Parse a single SSE line: `event: <type>` or `data: <payload>`.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Byte chunks arrive mid-line; this accumulates and yields complete
/// lines only.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut lines: Vec<String> = Vec::new();
        while let Some(idx) = self.buf.find('\n') {
            let line = self.buf[..idx].trim_end_matches('\r').to_string();
            self.buf.drain(..=idx);
            lines.push(line);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_parse() {
        assert!(matches!(
            parse_sse_line("data: {\"x\":1}"),
            Some(SseParsed::Data(d)) if d == "{\"x\":1}"
        ));
        assert!(matches!(
            parse_sse_line("event: message_end"),
            Some(SseParsed::Event(e)) if e == "message_end"
        ));
        assert!(parse_sse_line(": keepalive").is_none());
    }

    #[test]
    fn line_buffer_handles_split_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push("data: par").is_empty());
        let lines = buf.push("tial\ndata: next\n");
        assert_eq!(lines, vec!["data: partial", "data: next"]);
    }
}
