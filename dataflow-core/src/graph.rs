//! Graph construction. A [GraphBuilder] is threaded through every `connect` call: it runs each
//! operator's declarator right away (so its output streams can feed the next `connect`), defers
//! the construction of the operator, and validates the whole shape in [GraphBuilder::finalize].
//! Every shape error surfaces there or in `connect`, never once the graph runs.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::{debug, info};

use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::message::Data;
use crate::operator::{Downstream, Operator, OperatorKind, Unit, Upstream, default_name};
use crate::stream::{ExtractStream, IngestStream, Stream, StreamId};

/// Position of an operator in the order of `connect` calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(usize);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operator-{}", self.0)
    }
}

/// Read-only view of an operator node and its stream edges.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorDescription {
    pub id: OperatorId,
    pub name: String,
    pub kind: OperatorKind,
    pub inputs: Vec<StreamId>,
    pub outputs: Vec<StreamId>,
}

type Constructor = Box<dyn FnOnce() -> Result<Unit> + Send>;

struct PendingOperator {
    description: OperatorDescription,
    constructor: Constructor,
}

#[derive(Default)]
pub struct GraphBuilder {
    operators: Vec<PendingOperator>,
    streams: Vec<Stream>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operator of type `O` reading `upstream`, and returns the streams it declares.
    pub fn connect<O: Operator>(
        &mut self,
        config: OperatorConfig,
        upstream: &[Stream],
        args: O::Args,
    ) -> Result<Vec<Stream>> {
        let name = config.name.clone().unwrap_or_else(default_name::<O>);

        if upstream.len() != <O::Inputs as Upstream>::ARITY {
            return Err(Error::Arity {
                operator: name,
                expected: <O::Inputs as Upstream>::ARITY,
                actual: upstream.len(),
            });
        }
        if let Some(foreign) = upstream.iter().find(|s| !self.contains(s.id())) {
            return Err(Error::Registration(format!(
                "{name} reads {}, which was not created by this graph builder",
                foreign.name()
            )));
        }

        let inputs = <O::Inputs as Upstream>::from_streams(&name, upstream)?;
        let outputs = O::connect(&inputs);
        let output_streams = outputs.streams();
        if let Some(reused) = output_streams.iter().find(|s| self.contains(s.id())) {
            return Err(Error::Registration(format!(
                "{name} declares {} as an output, but it already belongs to the graph",
                reused.name()
            )));
        }

        let description = OperatorDescription {
            id: OperatorId(self.operators.len()),
            name: name.clone(),
            kind: O::KIND,
            inputs: inputs.ids(),
            outputs: output_streams.iter().map(Stream::id).collect(),
        };
        debug!(operator = %name, id = %description.id, kind = %O::KIND, inputs = ?description.inputs, outputs = ?description.outputs, "Connected operator");

        self.streams.extend(output_streams.iter().cloned());
        self.operators.push(PendingOperator {
            description,
            constructor: Box::new(move || Unit::build::<O>(&name, config, inputs, outputs, args)),
        });
        Ok(output_streams)
    }

    /// Creates a stream fed from outside the graph.
    pub fn ingest<D: Data>(&mut self, name: impl Into<String>) -> IngestStream<D> {
        let ingest = IngestStream::new(Some(name.into()));
        debug!(stream = %ingest.name(), "Added ingest stream");
        self.streams.push(ingest.stream());
        ingest
    }

    /// Subscribes a reader outside the graph to one of its streams.
    pub fn extract<D: Data>(&mut self, stream: &Stream) -> Result<ExtractStream<D>> {
        if !self.contains(stream.id()) {
            return Err(Error::Registration(format!(
                "cannot extract {}, it was not created by this graph builder",
                stream.name()
            )));
        }
        ExtractStream::new(&stream.typed::<D>()?)
    }

    fn contains(&self, stream: StreamId) -> bool {
        self.streams.iter().any(|s| s.id() == stream)
    }

    /// Validates the graph and constructs every operator, upstream operators first.
    ///
    /// [GraphBuilder::connect] only reads streams the builder already holds and always creates
    /// fresh outputs, so a graph built through it cannot contain a cycle. The topological sort
    /// still reports one as [Error::GraphCycle].
    pub fn finalize(self) -> Result<Graph> {
        let shapes: Vec<NodeShape> = self
            .operators
            .iter()
            .map(|op| NodeShape {
                name: op.description.name.clone(),
                inputs: op.description.inputs.clone(),
                outputs: op.description.outputs.clone(),
            })
            .collect();
        let order = topological_order(&shapes)?;

        let mut pending: Vec<Option<PendingOperator>> =
            self.operators.into_iter().map(Some).collect();
        let mut nodes = Vec::with_capacity(pending.len());
        for index in order {
            let Some(PendingOperator {
                description,
                constructor,
            }) = pending.get_mut(index).and_then(Option::take)
            else {
                continue;
            };
            debug!(operator = %description.name, id = %description.id, "Constructing operator");
            let unit = constructor()?;
            nodes.push(Node { description, unit });
        }

        info!(
            operators = nodes.len(),
            streams = self.streams.len(),
            "Finalized graph"
        );
        Ok(Graph {
            nodes,
            streams: self.streams,
        })
    }
}

impl fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphBuilder")
            .field(
                "operators",
                &self
                    .operators
                    .iter()
                    .map(|op| &op.description)
                    .collect::<Vec<_>>(),
            )
            .field("streams", &self.streams)
            .finish()
    }
}

/// Stream edges of an operator, all the topological sort looks at.
#[derive(Clone, Debug)]
pub(crate) struct NodeShape {
    pub(crate) name: String,
    pub(crate) inputs: Vec<StreamId>,
    pub(crate) outputs: Vec<StreamId>,
}

/// Kahn's algorithm over the operators, an operator depending on the producers of its inputs.
/// Returns the indexes of `nodes` in dependency order, or a [Error::GraphCycle] naming the
/// operators that could not be ordered.
pub(crate) fn topological_order(nodes: &[NodeShape]) -> Result<Vec<usize>> {
    let producers: HashMap<StreamId, usize> = nodes
        .iter()
        .enumerate()
        .flat_map(|(index, node)| node.outputs.iter().map(move |s| (*s, index)))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (consumer, node) in nodes.iter().enumerate() {
        for input in &node.inputs {
            let Some(&producer) = producers.get(input) else {
                continue;
            };
            if let Some(edges) = successors.get_mut(producer) {
                edges.push(consumer);
            }
            if let Some(degree) = in_degree.get_mut(consumer) {
                *degree += 1;
            }
        }
    }

    let mut ready: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| index)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(index) = ready.pop_front() {
        order.push(index);
        let Some(edges) = successors.get(index) else {
            continue;
        };
        for &consumer in edges {
            if let Some(degree) = in_degree.get_mut(consumer) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(consumer);
                }
            }
        }
    }

    if order.len() < nodes.len() {
        let blocked: Vec<&str> = nodes
            .iter()
            .zip(in_degree.iter())
            .filter(|(_, degree)| **degree > 0)
            .map(|(node, _)| node.name.as_str())
            .collect();
        return Err(Error::GraphCycle(format!(
            "operators on or behind a cycle: {}",
            blocked.join(", ")
        )));
    }
    Ok(order)
}

pub(crate) struct Node {
    pub(crate) description: OperatorDescription,
    pub(crate) unit: Unit,
}

/// An immutable, validated graph of constructed operators, ready to be run.
pub struct Graph {
    nodes: Vec<Node>,
    streams: Vec<Stream>,
}

impl Graph {
    /// Operators in construction (topological) order.
    pub fn operators(&self) -> impl Iterator<Item = &OperatorDescription> {
        self.nodes.iter().map(|node| &node.description)
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub(crate) fn into_parts(self) -> (Vec<Node>, Vec<Stream>) {
        (self.nodes, self.streams)
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("operators", &self.operators().collect::<Vec<_>>())
            .field("streams", &self.streams)
            .finish()
    }
}
