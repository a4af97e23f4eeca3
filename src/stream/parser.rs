//! 上游 SSE 行解析器
//!
//! 把任意切分的字节块还原为完整的 `data:` 行，再解析成 JSON chunk。
//! 一个 `data:` 行可能跨越多个网络包，半行会留在缓冲区里等待下一块数据。

use serde_json::Value;
use tracing::warn;

/// 上游事件
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// 一个 OpenAI 风格的 chunk
    Chunk(Value),
    /// `data: [DONE]`
    Done,
}

/// 增量 SSE 行解析器
#[derive(Debug, Default)]
pub struct SseLineParser {
    buffer: Vec<u8>,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一块字节，返回其中所有完整行解析出的事件
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<UpstreamEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// 流结束时处理没有换行结尾的最后一行
    pub fn flush(&mut self) -> Option<UpstreamEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(raw: &[u8]) -> Option<UpstreamEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\r', '\n']);

    // 空行是事件分隔符；冒号开头是注释（OpenRouter 会发送 ": OPENROUTER PROCESSING"）
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(UpstreamEvent::Done);
    }
    if data.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(value) => Some(UpstreamEvent::Chunk(value)),
        Err(e) => {
            warn!("[STREAM] 解析上游 chunk 失败: {} - data: {}", e, data);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_complete_lines() {
        let mut parser = SseLineParser::new();
        let events = parser.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            UpstreamEvent::Chunk(json!({"choices":[{"delta":{"content":"Hi"}}]}))
        );
        assert_eq!(events[1], UpstreamEvent::Done);
    }

    #[test]
    fn test_line_split_across_feeds() {
        let mut parser = SseLineParser::new();
        assert!(parser.feed(b"data: {\"choices\":[{\"del").is_empty());
        let events = parser.feed(b"ta\":{}}]}\r\n");
        assert_eq!(events, vec![UpstreamEvent::Chunk(json!({"choices":[{"delta":{}}]}))]);
    }

    #[test]
    fn test_multibyte_char_split_across_feeds() {
        let mut parser = SseLineParser::new();
        let line = "data: {\"t\":\"你好\"}\n".as_bytes();
        let (a, b) = line.split_at(12);
        assert!(parser.feed(a).is_empty());
        assert_eq!(parser.feed(b), vec![UpstreamEvent::Chunk(json!({"t":"你好"}))]);
    }

    #[test]
    fn test_comments_and_event_lines_ignored() {
        let mut parser = SseLineParser::new();
        let events = parser.feed(b": OPENROUTER PROCESSING\nevent: message\ndata: {\"a\":1}\n");
        assert_eq!(events, vec![UpstreamEvent::Chunk(json!({"a":1}))]);
    }

    #[test]
    fn test_invalid_json_skipped() {
        let mut parser = SseLineParser::new();
        let events = parser.feed(b"data: {not json}\ndata: {\"ok\":true}\n");
        assert_eq!(events, vec![UpstreamEvent::Chunk(json!({"ok":true}))]);
    }

    #[test]
    fn test_flush_trailing_line() {
        let mut parser = SseLineParser::new();
        assert!(parser.feed(b"data: [DONE]").is_empty());
        assert_eq!(parser.flush(), Some(UpstreamEvent::Done));
        assert_eq!(parser.flush(), None);
    }
}
