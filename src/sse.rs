//! Upstream SSE parsing.
//!
//! `EventParser` wraps the raw byte stream of a Dify streaming response and
//! yields one `UpstreamEvent` per complete `data:` block. It knows nothing about
//! the caller-facing protocols.
//!
//! Rules:
//! - consecutive `data:` lines are joined with `\n`; a blank line ends the block
//! - a block whose content is `[DONE]` is skipped
//! - the first malformed block yields one `Transport` event and ends the sequence
//! - an upstream `error` event yields one `Failed` event and ends the sequence
//! - an unterminated block at end of input is dropped
//! - a read error yields one `Transport` event and ends the sequence
//! - a line longer than `MAX_LINE_BYTES` yields one `Transport` event and ends
//!   the sequence

use bytes::{Bytes, BytesMut};
use futures_util::stream::Stream;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::upstream::{TokenEvent, UpstreamEvent, UpstreamFailure};

/// Failure while reading or decoding the upstream stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream read error: {0}")]
    Io(String),
    #[error("malformed stream event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("stream deadline exceeded")]
    DeadlineExceeded,
    #[error("stream line exceeds {0} bytes")]
    LineTooLong(usize),
}

const DONE_SENTINEL: &[u8] = b"[DONE]";

/// Longest line accepted from the upstream stream.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// Decode one complete block into an event.
fn decode_block(data: &[u8]) -> Result<UpstreamEvent, StreamError> {
    let value: serde_json::Value = serde_json::from_slice(data)?;
    if value.get("event").and_then(|v| v.as_str()) == Some("error") {
        let failure: UpstreamFailure = serde_json::from_value(value)?;
        return Ok(UpstreamEvent::Failed(failure));
    }
    let token: TokenEvent = serde_json::from_value(value)?;
    Ok(UpstreamEvent::Token(token))
}

/// Lazy, finite, non-restartable sequence of upstream events.
pub struct EventParser<S> {
    inner: S,
    buffer: BytesMut,
    /// Prefix of `buffer` already searched for a newline.
    scanned: usize,
    data: Vec<u8>,
    has_data: bool,
    finished: bool,
}

impl<S, E> EventParser<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            scanned: 0,
            data: Vec::new(),
            has_data: false,
            finished: false,
        }
    }

    /// Consume buffered lines until an event is ready or the buffer holds no
    /// complete line.
    fn next_buffered(&mut self) -> Option<UpstreamEvent> {
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buffer.len();
                return None;
            };
            let mut line = self.buffer.split_to(self.scanned + offset + 1);
            self.scanned = 0;
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                if !self.has_data {
                    continue;
                }
                let block = std::mem::take(&mut self.data);
                self.has_data = false;
                let payload = trim_ascii(&block);
                if payload.is_empty() || payload == DONE_SENTINEL {
                    continue;
                }
                let event = decode_block(payload).unwrap_or_else(UpstreamEvent::Transport);
                if event.is_terminal() {
                    self.finished = true;
                }
                return Some(event);
            }

            if let Some(rest) = line.strip_prefix(b"data:") {
                if self.has_data {
                    self.data.push(b'\n');
                }
                self.data.extend_from_slice(trim_ascii(rest));
                self.has_data = true;
            }
            // event:, id:, retry: and comments carry nothing we use.
        }
    }
}

impl<S, E> Stream for EventParser<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    type Item = UpstreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            if let Some(event) = this.next_buffered() {
                return Poll::Ready(Some(event));
            }
            if this.buffer.len() > MAX_LINE_BYTES {
                this.finished = true;
                return Poll::Ready(Some(UpstreamEvent::Transport(StreamError::LineTooLong(
                    MAX_LINE_BYTES,
                ))));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(err))) => {
                    this.finished = true;
                    return Poll::Ready(Some(UpstreamEvent::Transport(StreamError::Io(
                        err.to_string(),
                    ))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::{self, StreamExt};

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        let items: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(items)
    }

    async fn collect(parts: &[&str]) -> Vec<UpstreamEvent> {
        EventParser::new(chunks(parts)).collect().await
    }

    fn answer(event: &UpstreamEvent) -> &str {
        match event {
            UpstreamEvent::Token(t) => t.answer.as_str(),
            other => panic!("expected token, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_tokens_then_done() {
        let events = collect(&[
            "data: {\"event\":\"message\",\"answer\":\"Hel\"}\n\n",
            "data: {\"event\":\"message\",\"answer\":\"lo\"}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(answer(&events[0]), "Hel");
        assert_eq!(answer(&events[1]), "lo");
    }

    #[tokio::test]
    async fn blocks_split_across_chunks_and_crlf() {
        let events = collect(&[
            "data: {\"event\":\"mess",
            "age\",\"answer\":\"a\"}\r",
            "\n\r\n",
            "event: ping\n\n",
            "data: {\"event\":\"agent_message\",\"answer\":\"b\"}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(answer(&events[0]), "a");
        assert_eq!(answer(&events[1]), "b");
    }

    #[tokio::test]
    async fn malformed_block_ends_sequence() {
        let events = collect(&[
            "data: {not json}\n\n",
            "data: {\"event\":\"message\",\"answer\":\"never\"}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            UpstreamEvent::Transport(StreamError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn upstream_error_event_is_terminal() {
        let events = collect(&[
            "data: {\"event\":\"message\",\"answer\":\"x\"}\n\n",
            "data: {\"event\":\"error\",\"status\":400,\"code\":\"invalid_param\",\"message\":\"bad\"}\n\n",
            "data: {\"event\":\"message\",\"answer\":\"y\"}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            UpstreamEvent::Failed(f) => {
                assert_eq!(f.status, 400);
                assert_eq!(f.code, "invalid_param");
                assert_eq!(f.message, "bad");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unterminated_trailing_block_is_dropped() {
        let events = collect(&[
            "data: {\"event\":\"message\",\"answer\":\"kept\"}\n\n",
            "data: {\"event\":\"message\",\"answer\":\"lost\"}\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
        assert_eq!(answer(&events[0]), "kept");
    }

    #[tokio::test]
    async fn clean_end_without_done_is_not_an_error() {
        let events = collect(&["data: {\"event\":\"message_end\"}\n\n"]).await;
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_terminal());
    }

    #[tokio::test]
    async fn multi_line_data_is_joined() {
        let events = collect(&[
            "data: {\"event\":\"message\",\n",
            "data: \"answer\":\"joined\"}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
        assert_eq!(answer(&events[0]), "joined");
    }

    #[tokio::test]
    async fn read_error_yields_single_transport_event() {
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"event\":\"message\",\"answer\":\"a\"}\n\n")),
            Err(std::io::Error::other("connection reset")),
            Ok(Bytes::from_static(b"data: {\"event\":\"message\",\"answer\":\"b\"}\n\n")),
        ];
        let mut parser = EventParser::new(stream::iter(items));
        assert_eq!(answer(&parser.next().await.unwrap()), "a");
        match parser.next().await {
            Some(UpstreamEvent::Transport(StreamError::Io(msg))) => {
                assert!(msg.contains("connection reset"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parser.next().await.is_none());
        assert!(parser.next().await.is_none());
    }

    #[tokio::test]
    async fn many_blocks_in_one_chunk() {
        let mut raw = String::new();
        for i in 0..500 {
            raw.push_str(&format!("data: {{\"event\":\"message\",\"answer\":\"{i}\"}}\n\n"));
        }
        let events = collect(&[raw.as_str()]).await;
        assert_eq!(events.len(), 500);
        assert_eq!(answer(&events[0]), "0");
        assert_eq!(answer(&events[499]), "499");
    }

    #[tokio::test]
    async fn oversized_line_ends_sequence() {
        let huge = "x".repeat(MAX_LINE_BYTES + 1);
        let mut parser = EventParser::new(chunks(&[
            "data: {\"event\":\"message\",\"answer\":\"a\"}\n\n",
            "data: ",
            huge.as_str(),
            "\n\n",
        ]));
        assert_eq!(answer(&parser.next().await.unwrap()), "a");
        match parser.next().await {
            Some(UpstreamEvent::Transport(StreamError::LineTooLong(limit))) => {
                assert_eq!(limit, MAX_LINE_BYTES)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parser.next().await.is_none());
    }
}
