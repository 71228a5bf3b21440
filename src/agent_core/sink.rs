//! Response streaming contract.
//!
//! The engine writes progress and the conclusion through a [`Sink`]:
//! headers, chunks, and exactly one `end`. How that maps onto a wire
//! protocol belongs to the implementor. [`SinkWriter`] is the engine-side
//! wrapper that enforces the ordering rules.

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent_core::errors::SinkError;

#[async_trait]
pub trait Sink: Send {
    async fn write_header(&mut self, text: &str) -> Result<(), SinkError>;
    async fn write_chunk(&mut self, text: &str) -> Result<(), SinkError>;
    /// Called once per request. `total_length` counts bytes of all header
    /// and chunk text written.
    async fn end(&mut self, total_length: usize) -> Result<(), SinkError>;
}

// ─── Channel Sink ───────────────────────────────────────────────────────────

/// One sink write, as delivered over a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkEvent {
    Header { text: String },
    Chunk { text: String },
    End { total_length: usize },
}

/// Forwards writes as [`SinkEvent`]s. A dropped receiver closes the sink.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    async fn send(&self, event: SinkEvent) -> Result<(), SinkError> {
        self.tx.send(event).await.map_err(|_| SinkError::Closed)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn write_header(&mut self, text: &str) -> Result<(), SinkError> {
        self.send(SinkEvent::Header { text: text.to_string() }).await
    }

    async fn write_chunk(&mut self, text: &str) -> Result<(), SinkError> {
        self.send(SinkEvent::Chunk { text: text.to_string() }).await
    }

    async fn end(&mut self, total_length: usize) -> Result<(), SinkError> {
        self.send(SinkEvent::End { total_length }).await
    }
}

// ─── Writer Sink ────────────────────────────────────────────────────────────

/// Renders onto any async byte writer (a terminal, a file).
pub struct WriterSink<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sink for WriterSink<W> {
    async fn write_header(&mut self, text: &str) -> Result<(), SinkError> {
        self.writer.write_all(format!("\n== {text} ==\n").as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_chunk(&mut self, text: &str) -> Result<(), SinkError> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn end(&mut self, _total_length: usize) -> Result<(), SinkError> {
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

// ─── SinkWriter ─────────────────────────────────────────────────────────────

/// Engine-side guard around a sink.
///
/// Writes stay in call order, `end` goes out at most once, and nothing is
/// written after cancellation or after the sink failed.
pub(crate) struct SinkWriter<'a> {
    sink: &'a mut dyn Sink,
    cancel: CancellationToken,
    written: usize,
    ended: bool,
    broken: bool,
}

impl<'a> SinkWriter<'a> {
    pub(crate) fn new(sink: &'a mut dyn Sink, cancel: CancellationToken) -> Self {
        Self {
            sink,
            cancel,
            written: 0,
            ended: false,
            broken: false,
        }
    }

    /// Whether further writes would reach the sink.
    pub(crate) fn is_live(&self) -> bool {
        !self.ended && !self.broken && !self.cancel.is_cancelled()
    }

    pub(crate) async fn header(&mut self, text: &str) {
        if !self.is_live() {
            return;
        }
        let result = self.sink.write_header(text).await;
        self.record(result, text.len());
    }

    pub(crate) async fn chunk(&mut self, text: &str) {
        if !self.is_live() || text.is_empty() {
            return;
        }
        let result = self.sink.write_chunk(text).await;
        self.record(result, text.len());
    }

    pub(crate) async fn end(&mut self) {
        if !self.is_live() {
            return;
        }
        self.ended = true;
        if let Err(e) = self.sink.end(self.written).await {
            tracing::warn!(error = %e, "sink end failed");
        }
    }

    fn record(&mut self, result: Result<(), SinkError>, len: usize) {
        match result {
            Ok(()) => self.written += len,
            Err(e) => {
                tracing::warn!(error = %e, "sink write failed, dropping further output");
                self.broken = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CollectingSink;

    #[tokio::test]
    async fn test_sink_writer_ends_once_with_length() {
        let mut sink = CollectingSink::default();
        {
            let mut out = SinkWriter::new(&mut sink, CancellationToken::new());
            out.header("Step 1").await;
            out.chunk("abc").await;
            out.chunk("").await;
            out.end().await;
            out.chunk("late").await;
            out.end().await;
        }
        assert_eq!(
            sink.events,
            vec![
                SinkEvent::Header { text: "Step 1".into() },
                SinkEvent::Chunk { text: "abc".into() },
                SinkEvent::End { total_length: 9 },
            ]
        );
    }

    #[tokio::test]
    async fn test_sink_writer_silent_after_cancel() {
        let mut sink = CollectingSink::default();
        let cancel = CancellationToken::new();
        {
            let mut out = SinkWriter::new(&mut sink, cancel.clone());
            out.chunk("before").await;
            cancel.cancel();
            out.chunk("after").await;
            out.end().await;
        }
        assert_eq!(sink.events, vec![SinkEvent::Chunk { text: "before".into() }]);
    }

    #[tokio::test]
    async fn test_channel_sink_closed_receiver() {
        let (mut sink, rx) = ChannelSink::new(4);
        sink.write_chunk("hi").await.unwrap();
        drop(rx);
        assert!(matches!(sink.write_chunk("again").await, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn test_writer_sink_renders_text() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write_header("Answer").await.unwrap();
        sink.write_chunk("42").await.unwrap();
        sink.end(2).await.unwrap();
        assert_eq!(String::from_utf8(sink.into_inner()).unwrap(), "\n== Answer ==\n42\n");
    }
}
