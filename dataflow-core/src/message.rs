//! Message is what flows over a stream: either a timestamped payload or a watermark, the producer's
//! promise that nothing at or below the watermark's timestamp will follow on that stream. Messages
//! are wrapped in an `Arc` once when sent, so every consumer of a broadcast stream observes the same
//! immutable copy.

use std::fmt;

use crate::timestamp::Timestamp;

/// Payloads that can travel over a stream.
pub trait Data: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Data for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// A payload stamped with the logical time it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedData<D> {
    pub timestamp: Timestamp,
    pub data: D,
}

impl<D> TimestampedData<D> {
    pub fn new(timestamp: Timestamp, data: D) -> Self {
        Self { timestamp, data }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message<D> {
    TimestampedData(TimestampedData<D>),
    /// No further data at or below the timestamp will appear on the stream.
    Watermark(Timestamp),
}

impl<D> Message<D> {
    pub fn new_message(timestamp: Timestamp, data: D) -> Self {
        Message::TimestampedData(TimestampedData::new(timestamp, data))
    }

    pub fn new_watermark(timestamp: Timestamp) -> Self {
        Message::Watermark(timestamp)
    }

    /// The terminal watermark. Nothing can be sent on a stream after it.
    pub fn new_top_watermark() -> Self {
        Message::Watermark(Timestamp::Top)
    }

    pub fn timestamp(&self) -> &Timestamp {
        match self {
            Message::TimestampedData(td) => &td.timestamp,
            Message::Watermark(t) => t,
        }
    }

    pub fn data(&self) -> Option<&D> {
        match self {
            Message::TimestampedData(td) => Some(&td.data),
            Message::Watermark(_) => None,
        }
    }

    pub fn is_watermark(&self) -> bool {
        matches!(self, Message::Watermark(_))
    }

    pub fn is_top_watermark(&self) -> bool {
        matches!(self, Message::Watermark(Timestamp::Top))
    }

    pub(crate) fn kind(&self) -> MessageKind {
        match self {
            Message::TimestampedData(_) => MessageKind::Data,
            Message::Watermark(_) => MessageKind::Watermark,
        }
    }
}

impl<D> From<TimestampedData<D>> for Message<D> {
    fn from(td: TimestampedData<D>) -> Self {
        Message::TimestampedData(td)
    }
}

/// Kind of the [Message], used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Data,
    Watermark,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Data => write!(f, "Data"),
            MessageKind::Watermark => write!(f, "Watermark"),
        }
    }
}
