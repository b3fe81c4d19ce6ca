//! Minimal `text/event-stream` decoding for the sync event endpoint.

use std::{collections::VecDeque, pin::Pin};

use futures::{stream, Stream, StreamExt};
use shared::protocol::SyncEvent;

use crate::{error::ClientError, EventStream};

/// Longest line the decoder buffers while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// A pending line outgrew the decoder's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTooLong {
    pub limit: usize,
}

/// Incremental decoder: bytes go in as they arrive, complete frames come out.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    event: Option<String>,
    last_id: Option<String>,
    data: Vec<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
            event: None,
            last_id: None,
            data: Vec::new(),
        }
    }

    /// Frames completed by `chunk`. Fails once the unterminated tail exceeds the line limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, LineTooLong> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline_index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.buffer.drain(..=newline_index).collect::<Vec<_>>();
            line.pop();
            if matches!(line.last(), Some(b'\r')) {
                line.pop();
            }
            if let Some(frame) = self.feed_line(&String::from_utf8_lossy(&line)) {
                frames.push(frame);
            }
        }
        if self.buffer.len() > self.max_line {
            self.buffer.clear();
            return Err(LineTooLong {
                limit: self.max_line,
            });
        }
        Ok(frames)
    }

    /// Flushes whatever the server sent before closing without a trailing blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches('\r');
            if let Some(frame) = self.feed_line(line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_owned()),
            "event" => self.event = Some(value.to_owned()),
            "id" => self.last_id = Some(value.to_owned()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event,
            id: self.last_id.clone(),
            data,
        })
    }
}

struct DecodeState<S> {
    source: Pin<Box<S>>,
    decoder: SseDecoder,
    ready: VecDeque<Result<SyncEvent, ClientError>>,
    finished: bool,
    url: String,
}

impl<S> DecodeState<S> {
    fn enqueue(&mut self, frames: impl IntoIterator<Item = SseFrame>) {
        for frame in frames {
            let decoded = serde_json::from_str::<SyncEvent>(&frame.data).map_err(|source| {
                ClientError::Decode {
                    context: format!("sync event from {}", self.url),
                    source,
                }
            });
            self.ready.push_back(decoded);
        }
    }
}

/// Turns a raw response body into a stream of sync events in arrival order.
///
/// A frame that does not decode yields a `ClientError::Decode` item and the
/// stream carries on; a transport error is yielded once and ends the stream.
pub fn decode_event_stream<S, B>(source: S, url: impl Into<String>) -> EventStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = DecodeState {
        source: Box::pin(source),
        decoder: SseDecoder::default(),
        ready: VecDeque::new(),
        finished: false,
        url: url.into(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.source.next().await {
                Some(Ok(chunk)) => match state.decoder.push(chunk.as_ref()) {
                    Ok(frames) => state.enqueue(frames),
                    Err(LineTooLong { limit }) => {
                        state.finished = true;
                        state.ready.push_back(Err(ClientError::LineTooLong {
                            url: state.url.clone(),
                            limit,
                        }));
                    }
                },
                Some(Err(source)) => {
                    state.finished = true;
                    let error = ClientError::transport(state.url.clone(), source);
                    state.ready.push_back(Err(error));
                }
                None => {
                    state.finished = true;
                    let frame = state.decoder.finish();
                    state.enqueue(frame);
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_chunks_are_reassembled() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").expect("push").is_empty());
        assert!(decoder.push(b"1}\r\n").expect("push").is_empty());
        let frames = decoder.push(b"\r\ndata: second\n\n").expect("push");
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: None,
                    id: None,
                    data: "{\"a\":1}".to_owned(),
                },
                SseFrame {
                    event: None,
                    id: None,
                    data: "second".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn comments_and_unknown_fields_are_ignored() {
        let mut decoder = SseDecoder::default();
        let frames = decoder
            .push(b": keep-alive\n\nretry: 3000\nevent: sync\nid: 7\ndata: x\n\n")
            .expect("push");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("sync".to_owned()),
                id: Some("7".to_owned()),
                data: "x".to_owned(),
            }]
        );
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push(b"data: first\ndata:second\n\n").expect("push");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "first\nsecond");
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").expect("push").is_empty());
        let frame = decoder.finish().expect("frame");
        assert_eq!(frame.data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn undecodable_frames_do_not_end_the_stream() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(b"data: {\"timestamp\":\"2024-05-01T08:00:00Z\",\"message\":\"one\"}\n\n".to_vec()),
            Ok(b"data: not json\n\n".to_vec()),
            Ok(b"data: {\"timestamp\":\"2024-05-01T08:00:01Z\",\"message\":\"two\"}\n\n".to_vec()),
        ];
        let items = decode_event_stream(stream::iter(chunks), "http://test/sync/events")
            .collect::<Vec<_>>()
            .await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().expect("first").message, "one");
        assert!(items[1].as_ref().expect_err("second").is_decode());
        assert_eq!(items[2].as_ref().expect("third").message, "two");
    }

    #[test]
    fn unterminated_line_beyond_limit_is_rejected() {
        let mut decoder = SseDecoder::with_max_line(16);
        assert_eq!(decoder.push(b"data: short\n\n").expect("push").len(), 1);
        assert!(decoder.push(b"data: 0123456789").expect("push").is_empty());
        assert_eq!(
            decoder.push(b"abcdef"),
            Err(LineTooLong { limit: 16 })
        );
    }

    #[tokio::test]
    async fn runaway_line_ends_the_stream() {
        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(b"data: {\"timestamp\":\"2024-05-01T08:00:00Z\",\"message\":\"one\"}\n\n".to_vec()),
            Ok(vec![b'x'; MAX_LINE_BYTES + 1]),
            Ok(b"data: {\"timestamp\":\"2024-05-01T08:00:01Z\",\"message\":\"two\"}\n\n".to_vec()),
        ];
        let items = decode_event_stream(stream::iter(chunks), "http://test/sync/events")
            .collect::<Vec<_>>()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().expect("first").message, "one");
        let err = items[1].as_ref().expect_err("overflow");
        assert!(matches!(err, ClientError::LineTooLong { limit, .. } if *limit == MAX_LINE_BYTES));
        assert!(!err.is_decode());
    }
}
