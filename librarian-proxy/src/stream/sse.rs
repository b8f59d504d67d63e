//! Server-sent-event decoding for the upstream streaming RPC.
//!
//! The runtime streams `data: <json>` frames separated by blank lines and
//! closes the sequence with `data: [DONE]`. [`SseDecoder`] turns a chunked
//! byte stream into assembled frames; line boundaries may fall anywhere
//! inside a chunk, including inside a multi-byte character.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

/// Sentinel payload that terminates the upstream sequence.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One assembled SSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// True for the `[DONE]` terminator
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

#[derive(Default)]
struct FrameBuilder {
    event: Option<String>,
    data: Vec<String>,
}

impl FrameBuilder {
    /// Feed one line; returns a frame when the line closes one.
    fn push(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.take();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            // id / retry carry nothing the gateway uses
            _ => {}
        }
        None
    }

    fn take(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let frame = SseFrame { event: self.event.take(), data: self.data.join("\n") };
        self.data.clear();
        Some(frame)
    }
}

/// Stream adapter from raw body chunks to [`SseFrame`]s.
pub struct SseDecoder<S> {
    inner: S,
    buffer: Vec<u8>,
    builder: FrameBuilder,
    finished: bool,
}

impl<S> SseDecoder<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, buffer: Vec::new(), builder: FrameBuilder::default(), finished: false }
    }

    /// Pop the next complete line out of the buffer, if any.
    fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl<S, E> Stream for SseDecoder<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<SseFrame, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            while let Some(line) = self.next_line() {
                if let Some(frame) = self.builder.push(&line) {
                    return Poll::Ready(Some(Ok(frame)));
                }
            }

            if self.finished {
                // Flush a trailing line and frame that were not newline-terminated
                if !self.buffer.is_empty() {
                    let rest = std::mem::take(&mut self.buffer);
                    let line = String::from_utf8_lossy(&rest).into_owned();
                    if let Some(frame) = self.builder.push(&line) {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                }
                return Poll::Ready(self.builder.take().map(Ok));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => self.finished = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use std::convert::Infallible;

    async fn decode(chunks: Vec<&'static [u8]>) -> Vec<SseFrame> {
        let input = stream::iter(chunks.into_iter().map(|c| Ok::<_, Infallible>(Bytes::from(c))));
        SseDecoder::new(input).map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_single_chunk() {
        let frames = decode(vec![b"data: {\"a\":1}\n\ndata: [DONE]\n\n"]).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert!(frames[1].is_done());
    }

    #[tokio::test]
    async fn test_frame_split_across_chunks() {
        let frames = decode(vec![b"da", b"ta: hel", b"lo\r\n", b"\r\n"]).await;
        assert_eq!(frames, vec![SseFrame { event: None, data: "hello".into() }]);
    }

    #[tokio::test]
    async fn test_multibyte_character_split() {
        // "é" is 0xC3 0xA9
        let frames = decode(vec![b"data: caf\xC3", b"\xA9\n\n"]).await;
        assert_eq!(frames[0].data, "café");
    }

    #[tokio::test]
    async fn test_event_field_and_comments() {
        let frames = decode(vec![b": keep-alive\nevent: message\ndata: x\n\n"]).await;
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, "x");
    }

    #[tokio::test]
    async fn test_multiline_data_and_unterminated_tail() {
        let frames = decode(vec![b"data: a\ndata: b\n\ndata: tail"]).await;
        assert_eq!(frames[0].data, "a\nb");
        assert_eq!(frames[1].data, "tail");
    }
}
