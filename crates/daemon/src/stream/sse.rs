// Incremental Server-Sent Events decoder.

use berth_common::protocol::events::RoutedEvent;
use serde_json::Value;

/// One dispatched SSE message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry_ms: Option<u64>,
}

impl SseEvent {
    /// Unnamed messages are `message` per the SSE format. Non-JSON data is
    /// passed through as a string payload.
    pub fn into_routed(self) -> RoutedEvent {
        let payload = if self.data.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&self.data).unwrap_or(Value::String(self.data))
        };
        RoutedEvent::new(self.id, self.event.unwrap_or_else(|| "message".to_string()), payload)
    }
}

/// Buffers raw body chunks and yields complete events. Bytes are kept until a
/// block is complete so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|pair| pair == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block[..end])) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => event.id = Some(value.to_string()),
            "event" => event.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "retry" => event.retry_ms = value.parse().ok(),
            _ => {}
        }
    }

    if data_lines.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn events_split_across_chunks_are_reassembled() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"id: 4\nevent: del").is_empty());
        let events = parser.push(b"ta\ndata: {\"text\":\"hi\"}\n\nid: 5\n");
        assert_eq!(events.len(), 1);
        let routed = events[0].clone().into_routed();
        assert_eq!(routed.id.as_deref(), Some("4"));
        assert_eq!(routed.event_name, "delta");
        assert_eq!(routed.payload, json!({"text": "hi"}));

        let events = parser.push(b"event: complete\ndata: {}\n\n");
        assert_eq!(events[0].id.as_deref(), Some("5"));
    }

    #[test]
    fn comments_and_crlf_are_handled() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\r\n\r\nevent: status\r\ndata: {\"state\":\"idle\"}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("status"));
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: first\ndata: second\n\n");
        let routed = events[0].clone().into_routed();
        assert_eq!(routed.event_name, "message");
        assert_eq!(routed.payload, json!("first\nsecond"));
    }

    #[test]
    fn retry_field_is_parsed() {
        let mut parser = SseParser::new();
        let events = parser.push(b"retry: 1500\nevent: init\ndata: {\"generating\":false}\n\n");
        assert_eq!(events[0].retry_ms, Some(1500));
    }
}
