// Runners — Dependency-tracked traversal of a graph's operation nodes
//
// Both runners are small state machines over a borrowed Graph. They do not
// execute anything themselves; they hand out "ready" operations and are told
// when each one is finished.
//
//   reset()           READY → IN_PROGRESS, seed the ready set
//   ready_ops()       operations that may run now, in any order
//   op_finished(op)   release whatever op was blocking
//   state()           READY once the traversal is complete
//
// ForwardRunner counts fan-in: an op becomes ready once every distinct flow
// node it reads has been produced. Data nodes are always available and do
// not gate readiness.
//
// BackwardRunner counts fan-out: an op becomes ready once every consumer of
// its output that can reach a graph output has finished, so the output's
// gradients are complete before the op propagates them into its inputs. Ops
// that cannot reach any graph output are never visited.
//
// Ready sets are BTreeSets, so `run()` dispatches in a deterministic order.
// Calling reset() mid-run or op_finished() on a non-ready op is a
// programming error and panics.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, OpNode};

/// Runner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    InProgress,
    Ready,
}

// ForwardRunner

/// Producer-before-consumer traversal.
#[derive(Debug)]
pub struct ForwardRunner<'g> {
    graph: &'g Graph,
    fan_in: BTreeMap<NodeId, usize>,
    pending: BTreeMap<NodeId, usize>,
    ready: BTreeSet<NodeId>,
    unready_outputs: usize,
    state: RunState,
}

impl<'g> ForwardRunner<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        let fan_in = graph
            .op_nodes()
            .map(|op| {
                let flow_inputs = op
                    .distinct_inputs()
                    .into_iter()
                    .filter(|&id| !graph.is_data(id))
                    .count();
                (op.id, flow_inputs)
            })
            .collect();
        ForwardRunner {
            graph,
            fan_in,
            pending: BTreeMap::new(),
            ready: BTreeSet::new(),
            unready_outputs: 0,
            state: RunState::Ready,
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn ready_ops(&self) -> &BTreeSet<NodeId> {
        &self.ready
    }

    /// Start a new traversal.
    pub fn reset(&mut self) {
        assert_eq!(self.state, RunState::Ready, "reset() while a forward run is in progress");
        self.pending = self.fan_in.clone();
        self.ready = self
            .pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        self.unready_outputs = self.graph.outputs().len();
        self.state = RunState::InProgress;
        for &input in self.graph.inputs() {
            self.node_available(input);
        }
        self.check_done();
    }

    /// Mark `op` as executed; its consumers may become ready.
    pub fn op_finished(&mut self, op: NodeId) {
        assert_eq!(self.state, RunState::InProgress, "op_finished() outside a forward run");
        assert!(self.ready.remove(&op), "op {} finished but was not ready", op);
        let output = match self.graph.op(op) {
            Some(node) => node.output,
            None => unreachable!("ready op {} is not in the graph", op),
        };
        self.node_available(output);
        if self.graph.is_output(output) {
            self.unready_outputs -= 1;
        }
        self.check_done();
    }

    fn node_available(&mut self, id: NodeId) {
        let Some(node) = self.graph.tensor(id) else {
            return;
        };
        for consumer in &node.consumers {
            if let Some(count) = self.pending.get_mut(consumer) {
                *count -= 1;
                if *count == 0 {
                    self.ready.insert(*consumer);
                }
            }
        }
    }

    fn check_done(&mut self) {
        if self.unready_outputs == 0 && self.ready.is_empty() {
            self.state = RunState::Ready;
        }
    }

    fn abort(&mut self) {
        self.ready.clear();
        self.state = RunState::Ready;
    }

    /// Reset and drive a full traversal, calling `f` once per op.
    ///
    /// If `f` fails the traversal is abandoned and the runner is left ready
    /// for the next `run`.
    pub fn run<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&'g OpNode) -> Result<()>,
    {
        self.reset();
        while self.state == RunState::InProgress {
            let step = self.next_op().and_then(|op| f(op).map(|_| op.id));
            match step {
                Ok(id) => self.op_finished(id),
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn next_op(&self) -> Result<&'g OpNode> {
        let graph = self.graph;
        let id = self
            .ready
            .first()
            .copied()
            .ok_or_else(|| Error::msg("forward run stalled with unproduced outputs"))?;
        graph.op(id).ok_or(Error::UnknownNode(id))
    }
}

// BackwardRunner

/// Consumer-before-producer traversal over the ops that reach an output.
#[derive(Debug)]
pub struct BackwardRunner<'g> {
    graph: &'g Graph,
    fan_out: BTreeMap<NodeId, usize>,
    pending: BTreeMap<NodeId, usize>,
    ready: BTreeSet<NodeId>,
    remaining: usize,
    state: RunState,
}

impl<'g> BackwardRunner<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        // ops from which some graph output is reachable
        let mut reachable = BTreeSet::new();
        let mut stack: Vec<NodeId> = graph
            .outputs()
            .iter()
            .filter_map(|&o| graph.producer(o))
            .map(|op| op.id)
            .collect();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(op) = graph.op(id) {
                for input in op.distinct_inputs() {
                    if let Some(p) = graph.producer(input) {
                        stack.push(p.id);
                    }
                }
            }
        }

        let fan_out = reachable
            .iter()
            .map(|&id| {
                let consumers = graph
                    .op(id)
                    .and_then(|op| graph.tensor(op.output))
                    .map(|n| n.consumers.iter().filter(|c| reachable.contains(*c)).count())
                    .unwrap_or(0);
                (id, consumers)
            })
            .collect();

        BackwardRunner {
            graph,
            fan_out,
            pending: BTreeMap::new(),
            ready: BTreeSet::new(),
            remaining: 0,
            state: RunState::Ready,
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn ready_ops(&self) -> &BTreeSet<NodeId> {
        &self.ready
    }

    /// Number of ops a full traversal visits.
    pub fn num_reachable(&self) -> usize {
        self.fan_out.len()
    }

    pub fn reset(&mut self) {
        assert_eq!(self.state, RunState::Ready, "reset() while a backward run is in progress");
        self.pending = self.fan_out.clone();
        self.ready = self
            .pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        self.remaining = self.fan_out.len();
        self.state = if self.remaining == 0 {
            RunState::Ready
        } else {
            RunState::InProgress
        };
    }

    /// Mark `op` as having propagated; producers of its inputs may become ready.
    pub fn op_finished(&mut self, op: NodeId) {
        assert_eq!(self.state, RunState::InProgress, "op_finished() outside a backward run");
        assert!(self.ready.remove(&op), "op {} finished but was not ready", op);
        let inputs = match self.graph.op(op) {
            Some(node) => node.distinct_inputs(),
            None => unreachable!("ready op {} is not in the graph", op),
        };
        for input in inputs {
            let Some(producer) = self.graph.producer(input) else {
                continue;
            };
            if let Some(count) = self.pending.get_mut(&producer.id) {
                *count -= 1;
                if *count == 0 {
                    self.ready.insert(producer.id);
                }
            }
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            self.state = RunState::Ready;
        }
    }

    fn abort(&mut self) {
        self.ready.clear();
        self.state = RunState::Ready;
    }

    /// Reset and drive a full traversal, calling `f` once per reachable op.
    pub fn run<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&'g OpNode) -> Result<()>,
    {
        self.reset();
        while self.state == RunState::InProgress {
            let graph = self.graph;
            let step = self
                .ready
                .first()
                .copied()
                .ok_or_else(|| Error::msg("backward run stalled"))
                .and_then(|id| graph.op(id).ok_or(Error::UnknownNode(id)))
                .and_then(|op| f(op).map(|_| op.id));
            match step {
                Ok(id) => self.op_finished(id),
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
