//! Streams are typed single-producer, multi-consumer broadcast channels. The producer owns the
//! only [WriteStream]; consumers are registered by the runtime (one per reactive operator reading
//! the stream, plus any [ExtractStream]) and each receives its own ordered copy of every message.
//!
//! A stream remembers the last watermark it emitted and rejects anything that would break the
//! completeness promise made by that watermark:
//! - data at or below the last watermark ([Error::OrderViolation]),
//! - a watermark that does not strictly advance ([Error::OrderViolation]),
//! - anything after the terminal (`Top`) watermark ([Error::ClosedStream]).
//!
//! Until the runtime arms a stream, sent messages are buffered so nothing is lost between graph
//! construction and the moment every consumer is subscribed.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{Data, Message, MessageKind, TimestampedData};
use crate::metrics::{engine_metrics, stream_labels};
use crate::operator::{Callbacks, MessageHandler};
use crate::timestamp::Timestamp;

/// Lets code outside the graph read a stream.
mod extract;
pub use extract::ExtractStream;

/// Lets code outside the graph feed a stream.
mod ingest;
pub use ingest::IngestStream;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub(crate) fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// What a reactive operator's dispatch queue receives. The payload is type-erased so one FIFO
/// queue can serve input streams of different data types; the message handler registered for
/// the stream downcasts it back.
pub(crate) enum Delivery {
    Data {
        stream: StreamId,
        timestamp: Timestamp,
        message: Arc<dyn Any + Send + Sync>,
    },
    Watermark {
        stream: StreamId,
        timestamp: Timestamp,
    },
}

/// A consumer registration. Returns false once the consumer is gone, so the stream can forget it.
type Subscriber<D> = Box<dyn Fn(&Arc<Message<D>>) -> bool + Send + Sync>;

struct StreamState<D> {
    last_watermark: Option<Timestamp>,
    closed: bool,
    armed: bool,
    producer_dropped: bool,
    backlog: Vec<Arc<Message<D>>>,
    subscribers: Vec<Subscriber<D>>,
}

/// Shared part of a stream. The producer handle, every read handle and the watermark forwarders
/// of the owning operator point at the same core.
pub(crate) struct StreamCore<D> {
    id: StreamId,
    name: String,
    labels: Vec<(String, String)>,
    state: Mutex<StreamState<D>>,
}

impl<D: Data> StreamCore<D> {
    fn new(name: Option<String>) -> Arc<Self> {
        let id = StreamId::next();
        let name = name.unwrap_or_else(|| id.to_string());
        debug!(stream = %name, %id, "Initializing stream");
        Arc::new(Self {
            id,
            labels: stream_labels(&name),
            name,
            state: Mutex::new(StreamState {
                last_watermark: None,
                closed: false,
                armed: false,
                producer_dropped: false,
                backlog: Vec::new(),
                subscribers: Vec::new(),
            }),
        })
    }

    pub(crate) fn send(&self, message: Message<D>) -> Result<()> {
        let mut state = self.state.lock();

        if state.closed {
            warn!(stream = %self.name, "Trying to send on a closed stream");
            return Err(Error::ClosedStream(self.name.clone()));
        }

        match &message {
            Message::TimestampedData(td) => {
                if let Some(watermark) = &state.last_watermark
                    && td.timestamp <= *watermark
                {
                    warn!(stream = %self.name, timestamp = %td.timestamp, %watermark, "Rejecting late data");
                    return Err(Error::OrderViolation {
                        stream: self.name.clone(),
                        reason: format!(
                            "data at {} is at or below the last watermark {}",
                            td.timestamp, watermark
                        ),
                    });
                }
            }
            Message::Watermark(timestamp) => {
                if let Some(previous) = &state.last_watermark
                    && timestamp.partial_cmp(previous) != Some(std::cmp::Ordering::Greater)
                {
                    warn!(stream = %self.name, %timestamp, %previous, "Rejecting non-advancing watermark");
                    return Err(Error::OrderViolation {
                        stream: self.name.clone(),
                        reason: format!("watermark {timestamp} does not advance past {previous}"),
                    });
                }
                debug!(stream = %self.name, from = ?state.last_watermark, to = %timestamp, "Updating watermark");
                state.last_watermark = Some(timestamp.clone());
                if timestamp.is_top() {
                    debug!(stream = %self.name, "Sending top watermark, closing stream");
                    state.closed = true;
                }
            }
        }

        match message.kind() {
            MessageKind::Data => engine_metrics().data_sent.get_or_create(&self.labels).inc(),
            MessageKind::Watermark => engine_metrics()
                .watermarks_sent
                .get_or_create(&self.labels)
                .inc(),
        };

        let message = Arc::new(message);
        if state.armed {
            state.subscribers.retain(|deliver| deliver(&message));
            if state.closed {
                state.subscribers.clear();
            }
        } else {
            state.backlog.push(message);
        }
        Ok(())
    }

    fn subscribe(&self, subscriber: Subscriber<D>) -> Result<()> {
        let mut state = self.state.lock();
        if state.armed {
            return Err(Error::Registration(format!(
                "stream {} is already running, consumers must subscribe before the runtime starts",
                self.name
            )));
        }
        state.subscribers.push(subscriber);
        Ok(())
    }

    fn last_watermark(&self) -> Option<Timestamp> {
        self.state.lock().last_watermark.clone()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<D> StreamCore<D> {
    /// Called when the producer handle goes away: no message can follow, so consumers are
    /// released and their queues observe the end of the stream.
    fn detach(&self) {
        let mut state = self.state.lock();
        state.producer_dropped = true;
        if state.armed {
            state.subscribers.clear();
        }
        debug!(stream = %self.name, "Producer dropped, releasing consumers");
    }
}

/// Type-erased view of a stream used by the graph and the runtime.
pub(crate) trait StreamEndpoint: Send + Sync {
    fn id(&self) -> StreamId;

    fn name(&self) -> &str;

    fn type_name(&self) -> &'static str;

    /// Subscribes a reactive operator's dispatch queue.
    fn subscribe_queue(&self, queue: mpsc::UnboundedSender<Delivery>) -> Result<()>;

    /// Starts delivering to the subscribed consumers, flushing whatever was sent before.
    fn arm(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<D: Data> StreamEndpoint for StreamCore<D> {
    fn id(&self) -> StreamId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        type_name::<D>()
    }

    fn subscribe_queue(&self, queue: mpsc::UnboundedSender<Delivery>) -> Result<()> {
        let stream = self.id;
        self.subscribe(Box::new(move |message: &Arc<Message<D>>| {
            let delivery = match message.as_ref() {
                Message::TimestampedData(td) => Delivery::Data {
                    stream,
                    timestamp: td.timestamp.clone(),
                    message: Arc::clone(message) as Arc<dyn Any + Send + Sync>,
                },
                Message::Watermark(timestamp) => Delivery::Watermark {
                    stream,
                    timestamp: timestamp.clone(),
                },
            };
            queue.send(delivery).is_ok()
        }))
    }

    fn arm(&self) {
        let mut state = self.state.lock();
        if state.armed {
            return;
        }
        state.armed = true;

        let backlog = std::mem::take(&mut state.backlog);
        debug!(stream = %self.name, buffered = backlog.len(), consumers = state.subscribers.len(), "Arming stream");
        for message in backlog {
            state.subscribers.retain(|deliver| deliver(&message));
        }
        if state.closed || state.producer_dropped {
            state.subscribers.clear();
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Emits watermarks on an output stream on behalf of the engine (auto-forwarding after a
/// watermark callback).
pub(crate) trait WatermarkSink: Send + Sync {
    fn id(&self) -> StreamId;

    fn send_watermark(&self, timestamp: &Timestamp) -> Result<()>;
}

impl<D: Data> WatermarkSink for StreamCore<D> {
    fn id(&self) -> StreamId {
        self.id
    }

    fn send_watermark(&self, timestamp: &Timestamp) -> Result<()> {
        self.send(Message::Watermark(timestamp.clone()))
    }
}

/// Engine-side handle on an output stream, used to auto-forward low watermarks.
#[derive(Clone)]
pub struct WatermarkOutput {
    sink: Arc<dyn WatermarkSink>,
}

impl WatermarkOutput {
    pub fn id(&self) -> StreamId {
        self.sink.id()
    }

    pub(crate) fn send_watermark(&self, timestamp: &Timestamp) -> Result<()> {
        self.sink.send_watermark(timestamp)
    }
}

/// Anything that identifies an input stream of a watermark registration.
pub trait InputStream {
    fn id(&self) -> StreamId;

    fn name(&self) -> &str;
}

/// Anything that can receive auto-forwarded watermarks.
pub trait OutputStream {
    fn watermark_output(&self) -> WatermarkOutput;
}

/// The exclusive producer handle of a stream.
pub struct WriteStream<D> {
    core: Arc<StreamCore<D>>,
}

impl<D: Data> WriteStream<D> {
    pub fn new() -> Self {
        Self {
            core: StreamCore::new(None),
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            core: StreamCore::new(Some(name.into())),
        }
    }

    pub fn id(&self) -> StreamId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Broadcasts the message to every consumer, in send order.
    pub fn send(&mut self, message: Message<D>) -> Result<()> {
        self.core.send(message)
    }

    /// Returns `true` once the terminal watermark was sent.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn last_watermark(&self) -> Option<Timestamp> {
        self.core.last_watermark()
    }

    /// The type-erased read handle handed to downstream operators.
    pub fn stream(&self) -> Stream {
        let endpoint: Arc<dyn StreamEndpoint> = Arc::clone(&self.core) as Arc<dyn StreamEndpoint>;
        Stream { endpoint }
    }
}

impl<D: Data> Default for WriteStream<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Drop for WriteStream<D> {
    fn drop(&mut self) {
        self.core.detach();
    }
}

impl<D> fmt::Debug for WriteStream<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WriteStream {{ id: {}, name: {} }}",
            self.core.id, self.core.name
        )
    }
}

impl<D: Data> OutputStream for WriteStream<D> {
    fn watermark_output(&self) -> WatermarkOutput {
        let sink: Arc<dyn WatermarkSink> = Arc::clone(&self.core) as Arc<dyn WatermarkSink>;
        WatermarkOutput { sink }
    }
}

/// The typed consumer handle of a stream. Operators receive these as inputs and register their
/// message callbacks on them.
pub struct ReadStream<D> {
    core: Arc<StreamCore<D>>,
}

impl<D: Data> ReadStream<D> {
    pub fn id(&self) -> StreamId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Registers the handler to run once per data message of this stream, in stream order, on the
    /// consuming operator's dispatch unit.
    pub fn add_callback<S, F>(&self, callbacks: &mut Callbacks<S>, mut handler: F) -> Result<()>
    where
        S: 'static,
        F: FnMut(&mut S, &TimestampedData<D>) -> Result<()> + Send + 'static,
    {
        let stream_name = self.core.name.clone();
        let message_handler: MessageHandler<S> =
            Box::new(move |state: &mut S, message: &(dyn Any + Send + Sync)| {
                match message.downcast_ref::<Message<D>>() {
                    Some(Message::TimestampedData(td)) => handler(state, td),
                    Some(Message::Watermark(_)) => Ok(()),
                    None => Err(Error::StreamType(format!(
                        "stream {stream_name} delivered a payload that is not {}",
                        type_name::<D>()
                    ))),
                }
            });
        callbacks.register_message(self.id(), self.name(), message_handler)
    }

    pub(crate) fn subscribe_channel(&self) -> Result<mpsc::UnboundedReceiver<Arc<Message<D>>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.core
            .subscribe(Box::new(move |message: &Arc<Message<D>>| {
                tx.send(Arc::clone(message)).is_ok()
            }))?;
        Ok(rx)
    }
}

impl<D> Clone for ReadStream<D> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<D> fmt::Debug for ReadStream<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReadStream {{ id: {}, name: {} }}",
            self.core.id, self.core.name
        )
    }
}

impl<D: Data> InputStream for ReadStream<D> {
    fn id(&self) -> StreamId {
        self.core.id
    }

    fn name(&self) -> &str {
        &self.core.name
    }
}

/// Type-erased read handle, what [crate::GraphBuilder::connect] hands out and accepts.
#[derive(Clone)]
pub struct Stream {
    endpoint: Arc<dyn StreamEndpoint>,
}

impl Stream {
    pub fn id(&self) -> StreamId {
        self.endpoint.id()
    }

    pub fn name(&self) -> &str {
        self.endpoint.name()
    }

    /// Recovers the typed read handle, failing if the stream carries another payload type.
    pub fn typed<D: Data>(&self) -> Result<ReadStream<D>> {
        Arc::clone(&self.endpoint)
            .as_any()
            .downcast::<StreamCore<D>>()
            .map(|core| ReadStream { core })
            .map_err(|_| {
                Error::StreamType(format!(
                    "stream {} carries {}, not {}",
                    self.endpoint.name(),
                    self.endpoint.type_name(),
                    type_name::<D>()
                ))
            })
    }

    pub(crate) fn endpoint(&self) -> &Arc<dyn StreamEndpoint> {
        &self.endpoint
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stream {{ id: {}, name: {}, type: {} }}",
            self.endpoint.id(),
            self.endpoint.name(),
            self.endpoint.type_name()
        )
    }
}

impl InputStream for Stream {
    fn id(&self) -> StreamId {
        self.endpoint.id()
    }

    fn name(&self) -> &str {
        self.endpoint.name()
    }
}
