//! Incremental Server-Sent Events parser.
//!
//! Consumes `text/event-stream` bytes in arbitrary chunks and yields complete
//! events. Only the `event:` and `data:` fields matter to the multiplexer;
//! `id:`, `retry:`, and comment lines are dropped. Partial lines are kept in
//! the buffer between calls, so any chunking of the same input yields the
//! same event list.

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if present.
    pub event: Option<String>,
    /// Joined `data:` lines (multi-line data joined with `\n`).
    pub data: String,
}

/// Stateful line-oriented SSE parser.
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            event: None,
            data_lines: Vec::new(),
        }
    }

    /// Feed a chunk of bytes (lossy UTF-8) and collect completed events.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(nl) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=nl).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                // A field line with no colon is a field name with empty value.
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data_lines.push(value.to_string()),
                // id:, retry:, and anything else are ignored.
                _ => {}
            }
        }
        events
    }

    /// Flush a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.take_event()
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.event.is_none() && self.data_lines.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        };
        self.data_lines.clear();
        if event.data.is_empty() && event.event.is_none() {
            None
        } else {
            Some(event)
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &str) -> Vec<SseEvent> {
        let mut p = SseParser::new();
        let mut out = p.feed(input.as_bytes());
        if let Some(e) = p.finish() {
            out.push(e);
        }
        out
    }

    #[test]
    fn single_event() {
        let events = parse_all("event: stdout\ndata: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("stdout"));
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn data_only_event() {
        let events = parse_all("data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn multiline_data_joined() {
        let events = parse_all("data: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn ignores_id_retry_and_comments() {
        let events = parse_all(": keep-alive\nid: 7\nretry: 1000\nevent: x\ndata: y\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("x"));
        assert_eq!(events[0].data, "y");
    }

    #[test]
    fn crlf_line_endings() {
        let events = parse_all("event: x\r\ndata: y\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "y");
    }

    #[test]
    fn chunking_is_invisible() {
        let input = "event: a\ndata: one\n\nevent: b\ndata: two\ndata: three\n\n: comment\ndata: tail\n\n";
        let whole = parse_all(input);
        assert_eq!(whole.len(), 3);

        // Any partition of the same bytes must produce the same events.
        let bytes = input.as_bytes();
        for split_at in 1..bytes.len() {
            let mut p = SseParser::new();
            let mut got = p.feed(&bytes[..split_at]);
            got.extend(p.feed(&bytes[split_at..]));
            if let Some(e) = p.finish() {
                got.push(e);
            }
            assert_eq!(got, whole, "split at {split_at}");
        }

        // One-byte-at-a-time too.
        let mut p = SseParser::new();
        let mut got = Vec::new();
        for b in bytes {
            got.extend(p.feed(std::slice::from_ref(b)));
        }
        if let Some(e) = p.finish() {
            got.push(e);
        }
        assert_eq!(got, whole);
    }

    #[test]
    fn unterminated_trailing_event_flushes() {
        let mut p = SseParser::new();
        let events = p.feed(b"data: incomplete\n");
        assert!(events.is_empty());
        assert_eq!(p.finish().unwrap().data, "incomplete");
    }
}
