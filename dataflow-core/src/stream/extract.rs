use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::{Data, Message};
use crate::stream::{ReadStream, StreamId};

/// Consumer handle for reading a stream from outside the graph. It is subscribed while the graph is
/// built, so it observes every message the stream ever carries.
#[derive(Debug)]
pub struct ExtractStream<D> {
    id: StreamId,
    name: String,
    rx: mpsc::UnboundedReceiver<Arc<Message<D>>>,
}

impl<D: Data> ExtractStream<D> {
    pub(crate) fn new(read_stream: &ReadStream<D>) -> Result<Self> {
        Ok(Self {
            id: read_stream.id(),
            name: read_stream.name().to_string(),
            rx: read_stream.subscribe_channel()?,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next message. Returns `None` once the stream has ended: its terminal watermark
    /// was read or its producer is gone.
    pub async fn read(&mut self) -> Option<Message<D>> {
        self.rx.recv().await.map(Arc::unwrap_or_clone)
    }

    /// Returns the next message if one is already available.
    pub fn try_read(&mut self) -> Option<Message<D>> {
        self.rx.try_recv().ok().map(Arc::unwrap_or_clone)
    }
}
