//! Operators are the units of computation of a graph. An operator type declares its graph shape
//! through [Operator::connect] (a pure function of its upstream streams returning the output
//! streams it will own) and is constructed once the graph is finalized through [Operator::new].
//!
//! There are two kinds of operators:
//! - **Driver** operators own a run loop, [Operator::run], executed once on a dedicated task. They
//!   typically produce timestamped data and watermarks at their own pace.
//! - **Reactive** operators never loop. While being constructed they fill the [Callbacks] table:
//!   one message handler per input stream and any number of watermark registrations. The runtime
//!   then invokes these handlers strictly serially from the operator's dispatch queue, so a
//!   handler has exclusive access to the operator's state.
//!
//! A watermark registration tracks the low watermark of its input streams. When it advances, the
//! handler runs once with the new low watermark and the engine then forwards that watermark to the
//! registration's output streams. Because a single queue carries every delivery of the operator in
//! arrival order, every data handler for a message at or below the low watermark has returned by
//! the time the watermark handler runs.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;

use futures::future::BoxFuture;
use tracing::debug;

use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::message::Data;
use crate::metrics::{engine_metrics, operator_labels};
use crate::state::{AccessContext, Versioned};
use crate::stream::{
    Delivery, InputStream, OutputStream, ReadStream, Stream, StreamId, WatermarkOutput,
    WriteStream,
};
use crate::timestamp::Timestamp;
use crate::watermark::WatermarkTracker;

/// How the runtime executes an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Driver,
    Reactive,
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorKind::Driver => write!(f, "Driver"),
            OperatorKind::Reactive => write!(f, "Reactive"),
        }
    }
}

pub trait Operator: Sized + Send + 'static {
    /// The upstream read streams, `()`, a single [ReadStream] or a tuple of them.
    type Inputs: Upstream;
    /// The output write streams, `()`, a single [WriteStream] or a tuple of them.
    type Outputs: Downstream;
    /// Extra initialization arguments handed to [Operator::new].
    type Args: Send + 'static;

    const KIND: OperatorKind = OperatorKind::Reactive;

    /// Declares the output streams of the operator. Runs while the graph is being built, before
    /// the operator exists, and must not have side effects.
    fn connect(inputs: &Self::Inputs) -> Self::Outputs;

    /// Constructs the operator when the graph is finalized. Every callback has to be registered
    /// here; the table is frozen afterwards.
    fn new(
        config: OperatorConfig,
        inputs: Self::Inputs,
        outputs: Self::Outputs,
        args: Self::Args,
        callbacks: &mut Callbacks<Self>,
    ) -> Result<Self>;

    /// Entry point of a driver operator, invoked exactly once. Reactive operators keep the default.
    fn run(self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

fn arity_error(operator: &str, expected: usize, actual: usize) -> Error {
    Error::Arity {
        operator: operator.to_string(),
        expected,
        actual,
    }
}

/// The upstream side of an operator's signature.
pub trait Upstream: Sized + Send + 'static {
    const ARITY: usize;

    /// Recovers the typed read handles from the erased streams given to the builder.
    fn from_streams(operator: &str, streams: &[Stream]) -> Result<Self>;

    fn ids(&self) -> Vec<StreamId>;
}

impl Upstream for () {
    const ARITY: usize = 0;

    fn from_streams(operator: &str, streams: &[Stream]) -> Result<Self> {
        match streams {
            [] => Ok(()),
            _ => Err(arity_error(operator, Self::ARITY, streams.len())),
        }
    }

    fn ids(&self) -> Vec<StreamId> {
        Vec::new()
    }
}

impl<A: Data> Upstream for ReadStream<A> {
    const ARITY: usize = 1;

    fn from_streams(operator: &str, streams: &[Stream]) -> Result<Self> {
        match streams {
            [a] => a.typed::<A>(),
            _ => Err(arity_error(operator, Self::ARITY, streams.len())),
        }
    }

    fn ids(&self) -> Vec<StreamId> {
        vec![self.id()]
    }
}

impl<A: Data, B: Data> Upstream for (ReadStream<A>, ReadStream<B>) {
    const ARITY: usize = 2;

    fn from_streams(operator: &str, streams: &[Stream]) -> Result<Self> {
        match streams {
            [a, b] => Ok((a.typed::<A>()?, b.typed::<B>()?)),
            _ => Err(arity_error(operator, Self::ARITY, streams.len())),
        }
    }

    fn ids(&self) -> Vec<StreamId> {
        vec![self.0.id(), self.1.id()]
    }
}

impl<A: Data, B: Data, C: Data> Upstream for (ReadStream<A>, ReadStream<B>, ReadStream<C>) {
    const ARITY: usize = 3;

    fn from_streams(operator: &str, streams: &[Stream]) -> Result<Self> {
        match streams {
            [a, b, c] => Ok((a.typed::<A>()?, b.typed::<B>()?, c.typed::<C>()?)),
            _ => Err(arity_error(operator, Self::ARITY, streams.len())),
        }
    }

    fn ids(&self) -> Vec<StreamId> {
        vec![self.0.id(), self.1.id(), self.2.id()]
    }
}

/// The downstream side of an operator's signature.
pub trait Downstream: Send + 'static {
    /// Read handles of the declared outputs, in declaration order.
    fn streams(&self) -> Vec<Stream>;

    fn watermark_outputs(&self) -> Vec<WatermarkOutput>;
}

impl Downstream for () {
    fn streams(&self) -> Vec<Stream> {
        Vec::new()
    }

    fn watermark_outputs(&self) -> Vec<WatermarkOutput> {
        Vec::new()
    }
}

impl<A: Data> Downstream for WriteStream<A> {
    fn streams(&self) -> Vec<Stream> {
        vec![self.stream()]
    }

    fn watermark_outputs(&self) -> Vec<WatermarkOutput> {
        vec![self.watermark_output()]
    }
}

impl<A: Data, B: Data> Downstream for (WriteStream<A>, WriteStream<B>) {
    fn streams(&self) -> Vec<Stream> {
        vec![self.0.stream(), self.1.stream()]
    }

    fn watermark_outputs(&self) -> Vec<WatermarkOutput> {
        vec![self.0.watermark_output(), self.1.watermark_output()]
    }
}

impl<A: Data, B: Data, C: Data> Downstream for (WriteStream<A>, WriteStream<B>, WriteStream<C>) {
    fn streams(&self) -> Vec<Stream> {
        vec![self.0.stream(), self.1.stream(), self.2.stream()]
    }

    fn watermark_outputs(&self) -> Vec<WatermarkOutput> {
        vec![
            self.0.watermark_output(),
            self.1.watermark_output(),
            self.2.watermark_output(),
        ]
    }
}

/// Handler of a data message. The payload is the type-erased `Message<D>` of the stream, the
/// closure built by [ReadStream::add_callback] downcasts it.
pub(crate) type MessageHandler<S> =
    Box<dyn FnMut(&mut S, &(dyn Any + Send + Sync)) -> Result<()> + Send>;

type WatermarkHandler<S> = Box<dyn FnMut(&mut S, &Timestamp) -> Result<()> + Send>;

/// Borrows the operator's time-versioned state.
pub type StateAccessor<S> = fn(&mut S) -> &mut dyn Versioned;

struct MessageSlot<S> {
    stream_name: String,
    handler: MessageHandler<S>,
}

struct WatermarkSlot<S> {
    tracker: WatermarkTracker,
    outputs: Vec<WatermarkOutput>,
    /// `None` for slots that only forward watermarks.
    handler: Option<WatermarkHandler<S>>,
}

/// The fixed handler table of a reactive operator `S`, filled in while the operator is
/// constructed.
pub struct Callbacks<S> {
    operator: String,
    labels: Vec<(String, String)>,
    message_slots: HashMap<StreamId, MessageSlot<S>>,
    watermark_slots: Vec<WatermarkSlot<S>>,
    versioned_state: Option<StateAccessor<S>>,
}

impl<S> Callbacks<S> {
    pub(crate) fn new(operator: &str) -> Self {
        Self {
            operator: operator.to_string(),
            labels: operator_labels(operator),
            message_slots: HashMap::new(),
            watermark_slots: Vec::new(),
            versioned_state: None,
        }
    }

    /// Name of the operator the table belongs to.
    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn is_empty(&self) -> bool {
        self.message_slots.is_empty()
            && self.watermark_slots.is_empty()
            && self.versioned_state.is_none()
    }

    pub(crate) fn register_message(
        &mut self,
        stream: StreamId,
        stream_name: &str,
        handler: MessageHandler<S>,
    ) -> Result<()> {
        if self.message_slots.contains_key(&stream) {
            return Err(Error::Registration(format!(
                "{} registered a second message callback on {}",
                self.operator, stream_name
            )));
        }
        debug!(operator = %self.operator, stream = %stream_name, "Registering message callback");
        self.message_slots.insert(
            stream,
            MessageSlot {
                stream_name: stream_name.to_string(),
                handler,
            },
        );
        Ok(())
    }

    /// Hands the operator's [TimeVersionedState](crate::state::TimeVersionedState) to the engine,
    /// which then sets its current time before every handler and closes it after every watermark
    /// callback.
    pub fn set_versioned_state(&mut self, accessor: StateAccessor<S>) -> Result<()> {
        if self.versioned_state.is_some() {
            return Err(Error::Registration(format!(
                "{} registered its versioned state twice",
                self.operator
            )));
        }
        self.versioned_state = Some(accessor);
        Ok(())
    }

    fn register_watermark(
        &mut self,
        inputs: Vec<StreamId>,
        outputs: Vec<WatermarkOutput>,
        handler: Option<WatermarkHandler<S>>,
    ) -> Result<()> {
        if inputs.is_empty() {
            return Err(Error::Registration(format!(
                "{} registered a watermark callback without input streams",
                self.operator
            )));
        }
        for output in &outputs {
            if self.forwards_to(output.id()) {
                return Err(Error::Registration(format!(
                    "{} forwards watermarks to {} from more than one watermark callback",
                    self.operator,
                    output.id()
                )));
            }
        }
        debug!(operator = %self.operator, inputs = ?inputs, outputs = outputs.len(), "Registering watermark callback");
        self.watermark_slots.push(WatermarkSlot {
            tracker: WatermarkTracker::new(inputs),
            outputs,
            handler,
        });
        Ok(())
    }

    fn forwards_to(&self, output: StreamId) -> bool {
        self.watermark_slots
            .iter()
            .any(|slot| slot.outputs.iter().any(|o| o.id() == output))
    }

    /// Every handler must reference the operator's own streams.
    fn validate(&self, inputs: &[StreamId], outputs: &[StreamId]) -> Result<()> {
        for (stream, slot) in &self.message_slots {
            if !inputs.contains(stream) {
                return Err(Error::Registration(format!(
                    "{} registered a message callback on {}, which is not one of its inputs",
                    self.operator, slot.stream_name
                )));
            }
        }
        for slot in &self.watermark_slots {
            if let Some(foreign) = slot.tracker.inputs().iter().find(|s| !inputs.contains(s)) {
                return Err(Error::Registration(format!(
                    "{} registered a watermark callback on {foreign}, which is not one of its inputs",
                    self.operator
                )));
            }
            if let Some(foreign) = slot.outputs.iter().find(|o| !outputs.contains(&o.id())) {
                return Err(Error::Registration(format!(
                    "{} forwards watermarks to {}, which is not one of its outputs",
                    self.operator,
                    foreign.id()
                )));
            }
        }
        Ok(())
    }

    /// Runs the handlers a delivery triggers. Errors are returned as is, the unit turns them fatal.
    pub(crate) fn dispatch(&mut self, state: &mut S, delivery: Delivery) -> Result<()> {
        match delivery {
            Delivery::Data {
                stream,
                timestamp,
                message,
            } => {
                if let Some(slot) = self.message_slots.get_mut(&stream) {
                    if let Some(accessor) = self.versioned_state {
                        accessor(state).set_current_time(&timestamp, AccessContext::DataCallback);
                    }
                    (slot.handler)(state, message.as_ref())?;
                    engine_metrics()
                        .data_callbacks
                        .get_or_create(&self.labels)
                        .inc();
                }
            }
            Delivery::Watermark { stream, timestamp } => {
                for slot in self.watermark_slots.iter_mut() {
                    let Some(low_watermark) = slot.tracker.observe(stream, &timestamp)? else {
                        continue;
                    };
                    if let Some(handler) = slot.handler.as_mut() {
                        if let Some(accessor) = self.versioned_state {
                            accessor(state)
                                .set_current_time(&low_watermark, AccessContext::WatermarkCallback);
                        }
                        handler(state, &low_watermark)?;
                        if let Some(accessor) = self.versioned_state {
                            accessor(state).close_time(&low_watermark);
                        }
                        engine_metrics()
                            .watermark_callbacks
                            .get_or_create(&self.labels)
                            .inc();
                    }
                    for output in &slot.outputs {
                        output.send_watermark(&low_watermark)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl<S> fmt::Debug for Callbacks<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("operator", &self.operator)
            .field("message_slots", &self.message_slots.len())
            .field("watermark_slots", &self.watermark_slots.len())
            .field("versioned_state", &self.versioned_state.is_some())
            .finish()
    }
}

/// Registers `handler` to run once per advance of the low watermark of `inputs`. After it
/// returns, the low watermark is sent on every stream of `outputs`, so the handler must not send
/// watermarks on those streams itself.
pub fn add_watermark_callback<S, F>(
    callbacks: &mut Callbacks<S>,
    inputs: &[&dyn InputStream],
    outputs: &[&dyn OutputStream],
    handler: F,
) -> Result<()>
where
    F: FnMut(&mut S, &Timestamp) -> Result<()> + Send + 'static,
{
    callbacks.register_watermark(
        inputs.iter().map(|input| input.id()).collect(),
        outputs.iter().map(|output| output.watermark_output()).collect(),
        Some(Box::new(handler)),
    )
}

/// A reactive operator's state together with its handler table.
pub(crate) trait Dispatcher: Send {
    fn dispatch(&mut self, delivery: Delivery) -> Result<()>;
}

struct ReactiveUnit<O: Operator> {
    operator: O,
    callbacks: Callbacks<O>,
}

impl<O: Operator> Dispatcher for ReactiveUnit<O> {
    fn dispatch(&mut self, delivery: Delivery) -> Result<()> {
        self.callbacks.dispatch(&mut self.operator, delivery)
    }
}

/// A constructed operator, ready to be executed by the runtime.
pub(crate) enum Unit {
    Driver(BoxFuture<'static, Result<()>>),
    Reactive(Box<dyn Dispatcher>),
}

impl Unit {
    /// Constructs the operator and validates what it registered.
    pub(crate) fn build<O: Operator>(
        name: &str,
        config: OperatorConfig,
        inputs: O::Inputs,
        outputs: O::Outputs,
        args: O::Args,
    ) -> Result<Unit> {
        let input_ids = inputs.ids();
        let watermark_outputs = outputs.watermark_outputs();
        let output_ids: Vec<StreamId> = watermark_outputs.iter().map(|o| o.id()).collect();
        let flow_watermarks = config.flow_watermarks;

        let mut callbacks = Callbacks::new(name);
        let operator = O::new(config, inputs, outputs, args, &mut callbacks)?;

        if O::KIND == OperatorKind::Driver {
            if !callbacks.is_empty() {
                return Err(Error::Registration(format!(
                    "driver {name} registered callbacks, only reactive operators can"
                )));
            }
            debug!(operator = %name, "Constructed driver operator");
            return Ok(Unit::Driver(Box::pin(operator.run())));
        }

        callbacks.validate(&input_ids, &output_ids)?;

        if flow_watermarks && !input_ids.is_empty() {
            let uncovered: Vec<WatermarkOutput> = watermark_outputs
                .into_iter()
                .filter(|o| !callbacks.forwards_to(o.id()))
                .collect();
            if !uncovered.is_empty() {
                callbacks.register_watermark(input_ids, uncovered, None)?;
            }
        }

        debug!(operator = %name, ?callbacks, "Constructed reactive operator");
        Ok(Unit::Reactive(Box::new(ReactiveUnit {
            operator,
            callbacks,
        })))
    }
}

/// Default operator name: the type name without its path and generic arguments.
pub(crate) fn default_name<O>() -> String {
    let full = type_name::<O>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
