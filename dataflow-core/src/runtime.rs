//! Executes a finalized [Graph].
//!
//! Every operator gets its own execution unit:
//! - a reactive operator gets one unbounded FIFO dispatch queue, subscribed to each of its distinct
//!   input streams, and a blocking thread draining it. Deliveries from all inputs are handled in
//!   arrival order, one at a time, which keeps the operator's state single-writer.
//! - a driver operator gets a tokio task running its entry point until it returns or the runtime
//!   is aborted.
//!
//! Queues are subscribed and their units spawned before any stream is armed, and streams are armed
//! before any driver starts, so no message is ever sent to a consumer that is not listening yet.
//!
//! A failure in a unit (an error returned by a callback or a driver, or a panic) halts that unit
//! only and is reported as [Error::FatalOperator] by [RuntimeHandle::join]. When a unit stops, its
//! output streams lose their producer and their consumers see the end of those streams.

use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::graph::{Graph, Node};
use crate::metrics::{engine_metrics, operator_labels};
use crate::operator::{Dispatcher, Unit};
use crate::stream::{Delivery, StreamId};

pub struct Runtime {
    config: RuntimeConfig,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Starts every operator of the graph and returns without waiting for them. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, graph: Graph) -> Result<RuntimeHandle> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("the dataflow runtime needs a tokio runtime: {e}")))?;

        let (nodes, streams) = graph.into_parts();
        let find_stream = |id: &StreamId| streams.iter().find(|s| s.id() == *id);

        // subscribe every dispatch queue before anything runs
        let mut reactive = Vec::new();
        let mut drivers = Vec::new();
        for Node { description, unit } in nodes {
            match unit {
                Unit::Reactive(dispatcher) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let mut subscribed: Vec<StreamId> = Vec::new();
                    for input in &description.inputs {
                        if subscribed.contains(input) {
                            continue;
                        }
                        let stream = find_stream(input).ok_or_else(|| {
                            Error::Registration(format!(
                                "{} reads {input}, which is not part of the graph",
                                description.name
                            ))
                        })?;
                        stream.endpoint().subscribe_queue(tx.clone())?;
                        subscribed.push(*input);
                    }
                    reactive.push((description.name, dispatcher, rx));
                }
                Unit::Driver(driver) => drivers.push((description.name, driver)),
            }
        }

        let cln_token = CancellationToken::new();
        let mut units = JoinSet::new();
        let mut names = HashMap::new();

        for (name, dispatcher, rx) in reactive {
            let queue_depth_warn = self.config.queue_depth_warn;
            let unit_name = name.clone();
            let abort_handle = units.spawn_blocking_on(
                move || drain(&unit_name, dispatcher, rx, queue_depth_warn),
                &handle,
            );
            names.insert(abort_handle.id(), name);
        }

        for stream in &streams {
            stream.endpoint().arm();
        }

        for (name, driver) in drivers {
            let abort_handle = units.spawn_on(
                run_driver(name.clone(), driver, cln_token.clone()),
                &handle,
            );
            names.insert(abort_handle.id(), name);
        }

        info!(operators = names.len(), streams = streams.len(), "Started dataflow runtime");
        Ok(RuntimeHandle {
            units,
            names,
            cln_token,
        })
    }

    /// Runs the graph until every operator has stopped.
    pub async fn run(&self, graph: Graph) -> Result<()> {
        self.start(graph)?.join().await
    }
}

/// Runs the graph with the default [RuntimeConfig] until every operator has stopped.
pub async fn run(graph: Graph) -> Result<()> {
    Runtime::default().run(graph).await
}

/// Handle on a running graph. Dropping it aborts the driver operators.
pub struct RuntimeHandle {
    units: JoinSet<Result<()>>,
    names: HashMap<Id, String>,
    cln_token: CancellationToken,
}

impl RuntimeHandle {
    /// Stops every driver operator. Their output streams end, and the end cascades through the
    /// reactive operators downstream.
    pub fn abort(&self) {
        info!("Aborting dataflow runtime");
        self.cln_token.cancel();
    }

    /// A token that aborts the runtime when cancelled, usable while [RuntimeHandle::join] runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cln_token.clone()
    }

    /// Waits for every operator to stop. Returns the first fatal operator error, if any.
    pub async fn join(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.units.join_next_with_id().await {
            let result = match joined {
                Ok((_, result)) => result,
                Err(e) => {
                    let name = self
                        .names
                        .get(&e.id())
                        .map(String::as_str)
                        .unwrap_or("unknown");
                    error!(operator = %name, error = ?e, "Operator unit panicked");
                    engine_metrics()
                        .fatal_errors
                        .get_or_create(&operator_labels(name))
                        .inc();
                    Err(Error::fatal(name, format!("execution unit failed: {e}")))
                }
            };
            if let Err(e) = result
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        info!("Dataflow runtime stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Drains a reactive operator's dispatch queue until all its inputs have ended.
fn drain(
    name: &str,
    mut dispatcher: Box<dyn Dispatcher>,
    mut queue: mpsc::UnboundedReceiver<Delivery>,
    queue_depth_warn: usize,
) -> Result<()> {
    info!(operator = %name, "Starting reactive operator");
    let mut lagging = false;
    while let Some(delivery) = queue.blocking_recv() {
        let depth = queue.len();
        if depth >= queue_depth_warn && !lagging {
            warn!(operator = %name, depth, "Dispatch queue is backing up, callbacks are slower than their inputs");
            lagging = true;
        } else if depth < queue_depth_warn / 2 {
            lagging = false;
        }

        if let Err(e) = dispatcher.dispatch(delivery) {
            error!(operator = %name, error = ?e, "Operator callback failed, halting operator");
            engine_metrics()
                .fatal_errors
                .get_or_create(&operator_labels(name))
                .inc();
            return Err(Error::fatal(name, e));
        }
    }
    info!(operator = %name, "Input streams ended, stopping reactive operator");
    Ok(())
}

async fn run_driver(
    name: String,
    driver: BoxFuture<'static, Result<()>>,
    cln_token: CancellationToken,
) -> Result<()> {
    info!(operator = %name, "Starting driver operator");
    let result = tokio::select! {
        result = driver => result,
        _ = cln_token.cancelled() => {
            info!(operator = %name, "Cancellation token received, stopping driver operator");
            return Ok(());
        }
    };

    match result {
        Ok(()) => {
            debug!(operator = %name, "Driver operator finished");
            Ok(())
        }
        Err(e) => {
            error!(operator = %name, error = ?e, "Driver operator failed");
            engine_metrics()
                .fatal_errors
                .get_or_create(&operator_labels(&name))
                .inc();
            Err(Error::fatal(&name, e))
        }
    }
}
