// Graph — Static dataflow graph of tensor nodes and operation nodes
//
// A graph is built once, incrementally, by a GraphBuilder and is immutable
// afterwards. Every node (tensor or operation) gets an id from one counter,
// so ids are unique across node kinds and never reused.
//
// NODE KINDS:
//
//   flow node  — a tensor that is either a graph input (no producer) or the
//                single output of an operation node
//   data node  — an externally bound tensor (parameter/constant); never
//                produced inside the graph
//   op node    — an Operation with an ordered list of input tensor ids and
//                exactly one output flow node
//
// PARTITIONS:
//
//   inputs    flow nodes with no producer
//   outputs   flow nodes marked observable via make_output()
//   internal  produced flow nodes that are not outputs
//   data      data nodes
//
// Example, `y = square(x - v)`:
//
//   x (input) ──┐
//               ├─ sub ─→ t (internal) ─ square ─→ y (output)
//   v (data)  ──┘
//
// Runners, the dependency analysis and sections all borrow the graph and
// never mutate it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Error, Result};
use crate::op::Operation;
use crate::shape::Shape;

/// Graph-scoped node identifier, shared by tensor and operation nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// A flow or data node.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorNode {
    pub id: NodeId,
    pub shape: Shape,
    /// Producing operation. Always `None` for graph inputs and data nodes.
    pub producer: Option<NodeId>,
    /// Consuming operations, each listed once, in creation order.
    pub consumers: Vec<NodeId>,
}

impl TensorNode {
    fn new(id: NodeId, shape: Shape, producer: Option<NodeId>) -> Self {
        TensorNode {
            id,
            shape,
            producer,
            consumers: Vec::new(),
        }
    }
}

/// An operation node. Input order is the positional contract with kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct OpNode {
    pub id: NodeId,
    pub op: Operation,
    pub inputs: Vec<NodeId>,
    pub output: NodeId,
}

impl OpNode {
    /// Distinct input ids, in first-occurrence order.
    pub fn distinct_inputs(&self) -> Vec<NodeId> {
        let mut seen = Vec::with_capacity(self.inputs.len());
        for &id in &self.inputs {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }
}

/// An immutable computation graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    flow_nodes: BTreeMap<NodeId, TensorNode>,
    data_nodes: BTreeMap<NodeId, TensorNode>,
    op_nodes: BTreeMap<NodeId, OpNode>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    internal: Vec<NodeId>,
    data: Vec<NodeId>,
}

/// The raw tables of a graph, used to reassemble one from storage.
#[derive(Debug, Clone, Default)]
pub struct GraphParts {
    pub flow_nodes: Vec<TensorNode>,
    pub data_nodes: Vec<TensorNode>,
    pub op_nodes: Vec<OpNode>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    pub internal: Vec<NodeId>,
    pub data: Vec<NodeId>,
}

impl Graph {
    /// Reassemble a graph from its tables, checking the structural
    /// invariants:
    ///
    /// - node ids are unique across flow, data and op tables
    /// - every flow node sits in exactly one of inputs/outputs/internal and
    ///   every data node in `data`, with no repeats
    /// - producer and op output links agree in both directions
    /// - consumer lists agree with op inputs in both directions, without
    ///   repeats
    /// - every op's output shape follows its shape rule
    /// - the ops form a DAG
    pub fn from_parts(parts: GraphParts) -> Result<Graph> {
        let counts = (parts.flow_nodes.len(), parts.data_nodes.len(), parts.op_nodes.len());
        let graph = Graph {
            flow_nodes: parts.flow_nodes.into_iter().map(|n| (n.id, n)).collect(),
            data_nodes: parts.data_nodes.into_iter().map(|n| (n.id, n)).collect(),
            op_nodes: parts.op_nodes.into_iter().map(|o| (o.id, o)).collect(),
            inputs: parts.inputs,
            outputs: parts.outputs,
            internal: parts.internal,
            data: parts.data,
        };
        if counts != (graph.flow_nodes.len(), graph.data_nodes.len(), graph.op_nodes.len()) {
            crate::bail!("graph tables contain repeated node ids");
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Split the graph into its tables.
    pub fn to_parts(&self) -> GraphParts {
        GraphParts {
            flow_nodes: self.flow_nodes.values().cloned().collect(),
            data_nodes: self.data_nodes.values().cloned().collect(),
            op_nodes: self.op_nodes.values().cloned().collect(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            internal: self.internal.clone(),
            data: self.data.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        let all_ids = self
            .flow_nodes
            .keys()
            .chain(self.data_nodes.keys())
            .chain(self.op_nodes.keys());
        for &id in all_ids {
            if !ids.insert(id) {
                crate::bail!("node id {} is used by more than one node", id);
            }
        }

        self.validate_partitions()?;

        for node in self.tensor_nodes() {
            if self.data_nodes.contains_key(&node.id) && node.producer.is_some() {
                crate::bail!("data node {} has a producer", node.id);
            }
            let mut seen = BTreeSet::new();
            for &c in &node.consumers {
                if !seen.insert(c) {
                    crate::bail!("op {} is listed twice among the consumers of {}", c, node.id);
                }
                match self.op_nodes.get(&c) {
                    Some(op) if op.inputs.contains(&node.id) => {}
                    _ => crate::bail!("node {} lists {} as a consumer, which does not read it", node.id, c),
                }
            }
        }

        for op in self.op_nodes.values() {
            match self.flow_nodes.get(&op.output) {
                Some(out) if out.producer == Some(op.id) => {}
                _ => crate::bail!("op {} output {} does not name it as producer", op.id, op.output),
            }
            let mut shapes = Vec::with_capacity(op.inputs.len());
            for &input in &op.inputs {
                let node = self.tensor(input).ok_or(Error::UnknownNode(input))?;
                if !node.consumers.contains(&op.id) {
                    crate::bail!("op {} is missing from the consumers of {}", op.id, input);
                }
                shapes.push(&node.shape);
            }
            if let Some(expected) = op.op.infer_shape(&shapes)? {
                let got = &self.flow_nodes[&op.output].shape;
                if &expected != got {
                    return Err(Error::ShapeMismatch {
                        expected,
                        got: got.clone(),
                    });
                }
            }
        }

        self.validate_acyclic()
    }

    fn validate_partitions(&self) -> Result<()> {
        let mut flow = BTreeSet::new();
        for &id in self.inputs.iter().chain(&self.outputs).chain(&self.internal) {
            if !flow.insert(id) {
                crate::bail!("flow node {} appears in more than one partition slot", id);
            }
            self.flow_nodes.get(&id).ok_or(Error::UnknownNode(id))?;
        }
        if flow.len() != self.flow_nodes.len() {
            crate::bail!("graph partitions do not cover every flow node");
        }
        for &id in &self.inputs {
            if self.flow_nodes[&id].producer.is_some() {
                crate::bail!("graph input {} has a producer", id);
            }
        }
        for &id in self.outputs.iter().chain(&self.internal) {
            let producer = self.flow_nodes[&id]
                .producer
                .ok_or_else(|| Error::msg(format!("produced node {} has no producer", id)))?;
            match self.op_nodes.get(&producer) {
                Some(op) if op.output == id => {}
                _ => crate::bail!("node {} names {} as producer, which does not output it", id, producer),
            }
        }

        let mut data = BTreeSet::new();
        for &id in &self.data {
            if !data.insert(id) {
                crate::bail!("data node {} is listed twice", id);
            }
            if !self.data_nodes.contains_key(&id) {
                return Err(Error::UnknownNode(id));
            }
        }
        if data.len() != self.data_nodes.len() {
            crate::bail!("graph partitions do not cover every data node");
        }
        Ok(())
    }

    /// Kahn's algorithm over op nodes.
    fn validate_acyclic(&self) -> Result<()> {
        let mut pending: BTreeMap<NodeId, usize> = self
            .op_nodes
            .values()
            .map(|op| {
                let produced = op
                    .distinct_inputs()
                    .into_iter()
                    .filter(|&id| self.producer(id).is_some())
                    .count();
                (op.id, produced)
            })
            .collect();
        let mut ready: Vec<NodeId> = pending
            .iter()
            .filter(|&(_, &n)| n == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop() {
            visited += 1;
            let out = self.op_nodes[&id].output;
            for c in &self.flow_nodes[&out].consumers {
                if let Some(n) = pending.get_mut(c) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(*c);
                    }
                }
            }
        }
        if visited != self.op_nodes.len() {
            crate::bail!("graph contains a cycle");
        }
        Ok(())
    }

    /// Look up a flow or data node.
    pub fn tensor(&self, id: NodeId) -> Option<&TensorNode> {
        self.flow_nodes.get(&id).or_else(|| self.data_nodes.get(&id))
    }

    pub fn op(&self, id: NodeId) -> Option<&OpNode> {
        self.op_nodes.get(&id)
    }

    pub fn shape(&self, id: NodeId) -> Option<&Shape> {
        self.tensor(id).map(|n| &n.shape)
    }

    /// The op producing `id`, if any.
    pub fn producer(&self, id: NodeId) -> Option<&OpNode> {
        self.flow_nodes
            .get(&id)
            .and_then(|n| n.producer)
            .and_then(|p| self.op_nodes.get(&p))
    }

    pub fn flow_nodes(&self) -> impl Iterator<Item = &TensorNode> {
        self.flow_nodes.values()
    }

    pub fn data_nodes(&self) -> impl Iterator<Item = &TensorNode> {
        self.data_nodes.values()
    }

    /// All flow and data nodes, in id order.
    pub fn tensor_nodes(&self) -> impl Iterator<Item = &TensorNode> {
        let mut all: Vec<&TensorNode> = self
            .flow_nodes
            .values()
            .chain(self.data_nodes.values())
            .collect();
        all.sort_by_key(|n| n.id);
        all.into_iter()
    }

    pub fn op_nodes(&self) -> impl Iterator<Item = &OpNode> {
        self.op_nodes.values()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn internal(&self) -> &[NodeId] {
        &self.internal
    }

    pub fn data(&self) -> &[NodeId] {
        &self.data
    }

    pub fn is_data(&self, id: NodeId) -> bool {
        self.data_nodes.contains_key(&id)
    }

    pub fn is_input(&self, id: NodeId) -> bool {
        self.inputs.contains(&id)
    }

    pub fn is_output(&self, id: NodeId) -> bool {
        self.outputs.contains(&id)
    }

    pub fn num_tensor_nodes(&self) -> usize {
        self.flow_nodes.len() + self.data_nodes.len()
    }

    pub fn num_op_nodes(&self) -> usize {
        self.op_nodes.len()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in self.tensor_nodes() {
            let role = if self.is_data(node.id) {
                "data"
            } else if self.is_input(node.id) {
                "input"
            } else if self.is_output(node.id) {
                "output"
            } else {
                "internal"
            };
            writeln!(f, "{} {}: {}", role, node.id, node.shape)?;
        }
        for op in self.op_nodes() {
            let inputs: Vec<String> = op.inputs.iter().map(|i| i.to_string()).collect();
            writeln!(f, "{} = {}({}) -> {}", op.id, op.op, inputs.join(", "), op.output)?;
        }
        Ok(())
    }
}

// GraphBuilder — Append-only graph construction

/// Incremental, append-only graph builder.
///
/// ```ignore
/// let mut b = GraphBuilder::new();
/// let x = b.add_input_node(3);
/// let v = b.add_data_node(3);
/// let d = b.apply(Operation::sub(), &[x, v])?;
/// let y = b.apply(Operation::square(), &[d])?;
/// b.make_output(y)?;
/// let graph = b.build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    next_id: u32,
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Add a graph input (a flow node without producer).
    pub fn add_input_node(&mut self, shape: impl Into<Shape>) -> NodeId {
        let id = self.fresh_id();
        self.graph
            .flow_nodes
            .insert(id, TensorNode::new(id, shape.into(), None));
        self.graph.inputs.push(id);
        id
    }

    /// Add an externally bound data node.
    pub fn add_data_node(&mut self, shape: impl Into<Shape>) -> NodeId {
        let id = self.fresh_id();
        self.graph
            .data_nodes
            .insert(id, TensorNode::new(id, shape.into(), None));
        self.graph.data.push(id);
        id
    }

    /// Add an operation node and its output flow node. Returns
    /// `(op_id, output_id)`; the output starts out `internal`.
    ///
    /// The declared `output_shape` must match the shape inferred from the
    /// inputs (except for `Noop`, which has no shape rule). On error the
    /// builder is unchanged.
    pub fn add_op_node(
        &mut self,
        op: Operation,
        inputs: &[NodeId],
        output_shape: impl Into<Shape>,
    ) -> Result<(NodeId, NodeId)> {
        let output_shape = output_shape.into();
        if let Some(inferred) = self.infer(&op, inputs)? {
            if inferred != output_shape {
                return Err(Error::ShapeMismatch {
                    expected: inferred,
                    got: output_shape,
                });
            }
        }
        Ok(self.insert_op(op, inputs, output_shape))
    }

    /// Add an operation, inferring its output shape. Returns the output id.
    pub fn apply(&mut self, op: Operation, inputs: &[NodeId]) -> Result<NodeId> {
        let shape = self
            .infer(&op, inputs)?
            .ok_or_else(|| Error::msg(format!("{} needs an explicit output shape", op)))?;
        let (_, output) = self.insert_op(op, inputs, shape);
        Ok(output)
    }

    fn infer(&self, op: &Operation, inputs: &[NodeId]) -> Result<Option<Shape>> {
        let shapes = inputs
            .iter()
            .map(|&id| self.graph.shape(id).ok_or(Error::UnknownNode(id)))
            .collect::<Result<Vec<_>>>()?;
        op.infer_shape(&shapes)
    }

    fn insert_op(&mut self, op: Operation, inputs: &[NodeId], output_shape: Shape) -> (NodeId, NodeId) {
        let op_id = self.fresh_id();
        let out_id = self.fresh_id();
        for &input in inputs {
            let node = match self.graph.flow_nodes.get_mut(&input) {
                Some(n) => n,
                None => match self.graph.data_nodes.get_mut(&input) {
                    Some(n) => n,
                    None => continue,
                },
            };
            if !node.consumers.contains(&op_id) {
                node.consumers.push(op_id);
            }
        }
        self.graph
            .flow_nodes
            .insert(out_id, TensorNode::new(out_id, output_shape, Some(op_id)));
        self.graph.op_nodes.insert(
            op_id,
            OpNode {
                id: op_id,
                op,
                inputs: inputs.to_vec(),
                output: out_id,
            },
        );
        self.graph.internal.push(out_id);
        (op_id, out_id)
    }

    /// Move an internal node to the outputs.
    pub fn make_output(&mut self, id: NodeId) -> Result<()> {
        let pos = self
            .graph
            .internal
            .iter()
            .position(|&n| n == id)
            .ok_or(Error::NotInternal(id))?;
        self.graph.internal.remove(pos);
        self.graph.outputs.push(id);
        Ok(())
    }

    /// Move an output back to the internal nodes.
    pub fn unset_output(&mut self, id: NodeId) -> Result<()> {
        let pos = self
            .graph
            .outputs
            .iter()
            .position(|&n| n == id)
            .ok_or(Error::NotOutput(id))?;
        self.graph.outputs.remove(pos);
        self.graph.internal.push(id);
        Ok(())
    }

    /// Read access to the graph built so far.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Snapshot the graph. The builder stays usable.
    pub fn build(&self) -> Graph {
        self.graph.clone()
    }
}
