use std::io;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

use super::frames::DONE_FRAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client disconnected")]
pub struct SinkClosed;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The client was not keeping up and the write had to wait.
    pub backpressure: bool,
}

/// Where relayed frames go: usually an HTTP response body.
#[async_trait]
pub trait StreamSink: Send {
    async fn write_frame(&mut self, frame: Bytes) -> Result<WriteOutcome, SinkClosed>;

    async fn done(&mut self) -> Result<(), SinkClosed> {
        self.write_frame(Bytes::from_static(DONE_FRAME)).await.map(|_| ())
    }

    /// Resolves once the client has gone away.
    fn on_abort(&self) -> BoxFuture<'static, ()>;
}

/// Bounded channel sink; the receiving half becomes the response body.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl ChannelSink {
    pub fn new(
        capacity: usize,
    ) -> (Self, impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ReceiverStream::new(rx))
    }

    /// Raw receiver, for callers that want to drive the channel themselves.
    pub fn with_receiver(capacity: usize) -> (Self, mpsc::Receiver<Result<Bytes, io::Error>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn write_frame(&mut self, frame: Bytes) -> Result<WriteOutcome, SinkClosed> {
        match self.tx.try_send(Ok(frame)) {
            Ok(()) => Ok(WriteOutcome::default()),
            Err(TrySendError::Full(item)) => {
                self.tx.send(item).await.map_err(|_| SinkClosed)?;
                Ok(WriteOutcome { backpressure: true })
            }
            Err(TrySendError::Closed(_)) => Err(SinkClosed),
        }
    }

    fn on_abort(&self) -> BoxFuture<'static, ()> {
        let tx = self.tx.clone();
        async move { tx.closed().await }.boxed()
    }
}

/// Collects frames in memory; used where the whole stream is wanted at once.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub frames: Vec<Bytes>,
}

#[async_trait]
impl StreamSink for BufferSink {
    async fn write_frame(&mut self, frame: Bytes) -> Result<WriteOutcome, SinkClosed> {
        self.frames.push(frame);
        Ok(WriteOutcome::default())
    }

    fn on_abort(&self) -> BoxFuture<'static, ()> {
        futures_util::future::pending().boxed()
    }
}

impl BufferSink {
    pub fn text(&self) -> String {
        self.frames
            .iter()
            .map(|frame| String::from_utf8_lossy(frame))
            .collect()
    }
}
