//! Chunked HTTP fallback channel.
//!
//! The server answers `POST {base}/{id}/{token}/id?i={n}` with a body that
//! never ends on its own: one padding line followed by newline-delimited
//! JSON messages. Each stream lives for a fixed window and is replaced by
//! the next index until the websocket takes over.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::TransportEvent;
use crate::protocol::ControlMessage;

/// Delay between the websocket opening and the last stream being dropped.
pub const WEBSOCKET_GRACE: Duration = Duration::from_secs(5);

/// Splits a chunked body into messages. Line 0 is server padding.
#[derive(Debug, Default)]
pub struct StreamReader {
    buf: Vec<u8>,
    line: usize,
}

impl StreamReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the messages completed by `chunk`, in order. A trailing
    /// partial line is held until its newline arrives.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ControlMessage> {
        self.buf.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(pos) = self.buf.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.take_line(&line[..pos], &mut messages);
        }
        messages
    }

    /// Flushes the last line once the body has ended.
    pub fn finish(&mut self) -> Vec<ControlMessage> {
        let rest = std::mem::take(&mut self.buf);
        let mut messages = Vec::new();
        if !rest.is_empty() {
            self.take_line(&rest, &mut messages);
        }
        messages
    }

    fn take_line(&mut self, line: &[u8], out: &mut Vec<ControlMessage>) {
        let index = self.line;
        self.line += 1;
        if index == 0 {
            return;
        }
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(message) => out.push(message),
            Err(err) => {
                tracing::warn!(
                    target = "pier",
                    line = index,
                    error = %err,
                    "invalid server message on http stream"
                );
            }
        }
    }
}

/// A running stream request; aborted when dropped.
struct StreamHandle {
    index: u32,
    task: JoinHandle<()>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        tracing::debug!(target = "pier", stream = self.index, "closing http stream");
        self.task.abort();
    }
}

pub(crate) struct StreamSupervisor {
    pub(crate) http: reqwest::Client,
    /// `{base}/{id}/{token}/id`
    pub(crate) url: String,
    pub(crate) timeout: Duration,
    pub(crate) events: mpsc::UnboundedSender<TransportEvent>,
    pub(crate) ws_open: watch::Receiver<bool>,
}

impl StreamSupervisor {
    pub(crate) async fn run(self) {
        let mut index = 0;
        let mut current = self.open(index, None);
        loop {
            let mut ws_open = self.ws_open.clone();
            let websocket_up = async move { ws_open.wait_for(|open| *open).await.is_ok() };
            tokio::select! {
                _ = tokio::time::sleep(self.timeout) => {
                    if *self.ws_open.borrow() {
                        drop(current);
                        return;
                    }
                    index += 1;
                    current = self.open(index, Some(current));
                }
                up = websocket_up => {
                    if up {
                        tokio::time::sleep(WEBSOCKET_GRACE).await;
                    }
                    drop(current);
                    return;
                }
            }
        }
    }

    fn open(&self, index: u32, previous: Option<StreamHandle>) -> StreamHandle {
        let http = self.http.clone();
        let url = format!("{}?i={index}", self.url);
        let events = self.events.clone();
        let task = tokio::spawn(read_stream(http, url, index, previous, events));
        StreamHandle { index, task }
    }
}

async fn read_stream(
    http: reqwest::Client,
    url: String,
    index: u32,
    previous: Option<StreamHandle>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    tracing::debug!(target = "pier", stream = index, url = %url, "opening http stream");
    let response = match http.post(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(target = "pier", stream = index, error = %err, "http stream request failed");
            return;
        }
    };
    // Headers are in; the replaced stream can go.
    drop(previous);

    if !response.status().is_success() {
        tracing::warn!(
            target = "pier",
            stream = index,
            status = response.status().as_u16(),
            "http stream rejected"
        );
        return;
    }

    let mut response = response;
    let mut reader = StreamReader::new();
    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                for message in reader.feed(&bytes) {
                    if events.send(TransportEvent::Message(message)).is_err() {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(target = "pier", stream = index, error = %err, "http stream read failed");
                break;
            }
        }
    }
    for message in reader.finish() {
        let _ = events.send(TransportEvent::Message(message));
    }
    tracing::debug!(target = "pier", stream = index, "http stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[test]
    fn skips_padding_and_keeps_order() {
        let mut reader = StreamReader::new();
        let body = b"pppppppppp\n{\"type\":\"OPEN\"}\n\n{\"type\":\"EXPIRE\",\"src\":\"bob\"}\n";
        let messages = reader.feed(body);
        let kinds: Vec<_> = messages.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageType::Open, MessageType::Expire]);
        assert_eq!(messages[1].src.as_deref(), Some("bob"));
    }

    #[test]
    fn holds_partial_line_until_newline() {
        let mut reader = StreamReader::new();
        assert!(reader.feed(b"{\"type\":\"OPEN\"}\n{\"type\":\"LE").is_empty());
        let messages = reader.feed(b"AVE\",\"src\":\"bob\"}\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageType::Leave);
    }

    #[test]
    fn trailing_line_is_flushed_at_end() {
        let mut reader = StreamReader::new();
        assert!(reader.feed(b"\n{\"type\":\"OPEN\"}").is_empty());
        let messages = reader.finish();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageType::Open);
    }

    #[test]
    fn invalid_lines_are_dropped() {
        let mut reader = StreamReader::new();
        let messages = reader.feed(b"\nnot json\n{\"type\":\"OPEN\"}\n");
        assert_eq!(messages.len(), 1);
    }
}
