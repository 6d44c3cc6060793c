//! A dataflow execution engine: a directed graph of stateful operators communicating over typed,
//! timestamped broadcast streams. Watermarks let an operator know that all data at or before a
//! timestamp has arrived on its inputs, without any global clock.
//!
//! A graph is described with a [GraphBuilder], finalized into an immutable [Graph] and executed by
//! the [Runtime]:
//! - driver operators run their own loop on a tokio task and produce messages,
//! - reactive operators register callbacks and are driven by a FIFO dispatch queue,
//! - watermark callbacks fire once per advance of the low watermark of their inputs, only after
//!   every data callback at or below it has returned.
//!
//! Reactive operators that keep per-timestamp state can hand a [TimeVersionedState] to the engine,
//! which files appended data under message timestamps and releases it once the watermark passes.

pub mod config;
pub use crate::config::{OperatorConfig, RuntimeConfig};

mod error;
pub use crate::error::{Error, Result};

pub mod graph;
pub use crate::graph::{Graph, GraphBuilder, OperatorDescription, OperatorId};

pub mod message;
pub use crate::message::{Data, Message, TimestampedData};

pub mod metrics;

pub mod operator;
pub use crate::operator::{
    Callbacks, Downstream, Operator, OperatorKind, StateAccessor, Upstream,
    add_watermark_callback,
};

pub mod runtime;
pub use crate::runtime::{Runtime, RuntimeHandle, run};

pub mod state;
pub use crate::state::TimeVersionedState;

pub mod stream;
pub use crate::stream::{
    ExtractStream, IngestStream, InputStream, OutputStream, ReadStream, Stream, StreamId,
    WatermarkOutput, WriteStream,
};

pub mod timestamp;
pub use crate::timestamp::Timestamp;

pub mod watermark;
pub use crate::watermark::WatermarkTracker;

#[cfg(test)]
mod test_utils;
