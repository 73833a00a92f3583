// DiffInfo — Static dependency analysis for gradient allocation
//
// Before any gradient tensor is allocated we classify every (node, variable)
// and every (node, output) pair as one of:
//
//   Independent  provably zero gradient, nothing is ever allocated
//   Identity     the node *is* the variable / output; d(n)/d(n) = I
//   Dependent    a real Jacobian block that kernels must fill
//
// The analysis runs in two sweeps over the graph:
//
//   1. Forward (ForwardRunner): variables are Identity to themselves, other
//      sources are Independent. An op's output becomes Dependent on v if any
//      of its inputs is not Independent of v.
//
//   2. Backward (BackwardRunner): every output is Identity to itself. An op's
//      inputs become Dependent for output o if the op's output is not
//      Independent of o.
//
// Nodes on dead branches (no path to any output) stay Independent for every
// output, so no gradient storage is reserved for them.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use crate::runner::{BackwardRunner, ForwardRunner};

/// Three-state dependency flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepType {
    #[default]
    Independent,
    Identity,
    Dependent,
}

impl DepType {
    pub fn is_independent(self) -> bool {
        self == DepType::Independent
    }
}

/// Dependency record of one tensor node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeDiffInfo {
    /// Per variable: is this node's value influenced by it?
    pub variable_deps: BTreeMap<NodeId, DepType>,
    /// Per graph output: does this node's value influence it?
    pub output_deps: BTreeMap<NodeId, DepType>,
}

impl NodeDiffInfo {
    pub fn variable_dep(&self, v: NodeId) -> DepType {
        self.variable_deps.get(&v).copied().unwrap_or_default()
    }

    pub fn output_dep(&self, o: NodeId) -> DepType {
        self.output_deps.get(&o).copied().unwrap_or_default()
    }

    /// True if the node is, or is computed from, at least one variable.
    pub fn depends_on_variables(&self) -> bool {
        self.variable_deps.values().any(|d| !d.is_independent())
    }
}

/// Dependency records for every tensor node of a graph.
#[derive(Debug, Clone, Default)]
pub struct DiffInfo {
    nodes: BTreeMap<NodeId, NodeDiffInfo>,
    variables: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

impl DiffInfo {
    pub fn get(&self, id: NodeId) -> Option<&NodeDiffInfo> {
        self.nodes.get(&id)
    }

    /// Like [`get`](DiffInfo::get), but a missing record is an error.
    pub fn require(&self, id: NodeId) -> Result<&NodeDiffInfo> {
        self.nodes.get(&id).ok_or(Error::MissingDiffInfo(id))
    }

    pub fn variables(&self) -> &[NodeId] {
        &self.variables
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeDiffInfo)> {
        self.nodes.iter().map(|(&id, info)| (id, info))
    }

    /// Number of (node, output) pairs marked Dependent.
    pub fn num_dependent_pairs(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|n| n.output_deps.values())
            .filter(|&&d| d == DepType::Dependent)
            .count()
    }
}

/// Runs the dependency analysis.
///
/// ```ignore
/// let info = DiffInfoBuilder::new(&graph).variables(vec![w]).build()?;
/// ```
#[derive(Debug)]
pub struct DiffInfoBuilder<'g> {
    graph: &'g Graph,
    variables: Option<Vec<NodeId>>,
}

impl<'g> DiffInfoBuilder<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        DiffInfoBuilder {
            graph,
            variables: None,
        }
    }

    /// Differentiate with respect to these nodes. Each must be a data node
    /// or a graph input, listed once.
    pub fn variables(mut self, variables: Vec<NodeId>) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Differentiate with respect to every data node (the default).
    pub fn all_data_nodes(mut self) -> Self {
        self.variables = None;
        self
    }

    pub fn build(self) -> Result<DiffInfo> {
        let graph = self.graph;
        let variables = match self.variables {
            Some(vars) => {
                let mut seen = BTreeSet::new();
                for &v in &vars {
                    if !seen.insert(v) {
                        crate::bail!("variable {} is listed more than once", v);
                    }
                    if graph.tensor(v).is_none() {
                        return Err(Error::UnknownNode(v));
                    }
                    if graph.producer(v).is_some() {
                        crate::bail!("variable {} is produced by an operation", v);
                    }
                }
                vars
            }
            None => graph.data().to_vec(),
        };
        let outputs = graph.outputs().to_vec();

        let mut nodes: BTreeMap<NodeId, NodeDiffInfo> = graph
            .tensor_nodes()
            .map(|n| (n.id, NodeDiffInfo::default()))
            .collect();

        // sources: identity to themselves, independent of everything else
        for node in graph.tensor_nodes().filter(|n| n.producer.is_none()) {
            let info = nodes
                .get_mut(&node.id)
                .ok_or(Error::MissingDiffInfo(node.id))?;
            for &v in &variables {
                let dep = if v == node.id {
                    DepType::Identity
                } else {
                    DepType::Independent
                };
                info.variable_deps.insert(v, dep);
            }
        }

        ForwardRunner::new(graph).run(|op| {
            for &v in &variables {
                let mut dep = DepType::Independent;
                for input in &op.inputs {
                    if !nodes.get(input).ok_or(Error::MissingDiffInfo(*input))?.variable_dep(v).is_independent() {
                        dep = DepType::Dependent;
                        break;
                    }
                }
                nodes
                    .get_mut(&op.output)
                    .ok_or(Error::MissingDiffInfo(op.output))?
                    .variable_deps
                    .insert(v, dep);
            }
            Ok(())
        })?;

        for (&id, info) in nodes.iter_mut() {
            for &o in &outputs {
                let dep = if o == id {
                    DepType::Identity
                } else {
                    DepType::Independent
                };
                info.output_deps.insert(o, dep);
            }
        }

        BackwardRunner::new(graph).run(|op| {
            let reached: Vec<NodeId> = {
                let out = nodes.get(&op.output).ok_or(Error::MissingDiffInfo(op.output))?;
                outputs
                    .iter()
                    .copied()
                    .filter(|&o| !out.output_dep(o).is_independent())
                    .collect()
            };
            for input in &op.inputs {
                let info = nodes.get_mut(input).ok_or(Error::MissingDiffInfo(*input))?;
                for &o in &reached {
                    let entry = info.output_deps.entry(o).or_default();
                    if *entry != DepType::Identity {
                        *entry = DepType::Dependent;
                    }
                }
            }
            Ok(())
        })?;

        let info = DiffInfo {
            nodes,
            variables,
            outputs,
        };
        log::debug!(
            "dependency analysis: {} nodes, {} variables, {} outputs, {} dependent pairs",
            info.nodes.len(),
            info.variables.len(),
            info.outputs.len(),
            info.num_dependent_pairs()
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::op::Operation;

    #[test]
    fn test_sub_square_dependencies() {
        let mut b = GraphBuilder::new();
        let x = b.add_input_node(3);
        let v = b.add_data_node(3);
        let d = b.apply(Operation::sub(), &[x, v]).unwrap();
        let y = b.apply(Operation::square(), &[d]).unwrap();
        b.make_output(y).unwrap();
        let g = b.build();

        let info = DiffInfoBuilder::new(&g).build().unwrap();
        assert_eq!(info.variables(), &[v]);

        assert_eq!(info.require(v).unwrap().variable_dep(v), DepType::Identity);
        assert_eq!(info.require(x).unwrap().variable_dep(v), DepType::Independent);
        assert_eq!(info.require(d).unwrap().variable_dep(v), DepType::Dependent);
        assert_eq!(info.require(y).unwrap().variable_dep(v), DepType::Dependent);

        assert_eq!(info.require(y).unwrap().output_dep(y), DepType::Identity);
        assert_eq!(info.require(d).unwrap().output_dep(y), DepType::Dependent);
        assert_eq!(info.require(v).unwrap().output_dep(y), DepType::Dependent);
        assert_eq!(info.require(x).unwrap().output_dep(y), DepType::Dependent);
    }

    #[test]
    fn test_dead_branch_is_independent() {
        let mut b = GraphBuilder::new();
        let w = b.add_data_node(2);
        let y = b.apply(Operation::square(), &[w]).unwrap();
        let dead = b.apply(Operation::square(), &[w]).unwrap();
        b.make_output(y).unwrap();
        let g = b.build();

        let info = DiffInfoBuilder::new(&g).build().unwrap();
        let dead_info = info.require(dead).unwrap();
        assert_eq!(dead_info.variable_dep(w), DepType::Dependent);
        assert_eq!(dead_info.output_dep(y), DepType::Independent);
    }

    #[test]
    fn test_variable_not_reaching_output() {
        let mut b = GraphBuilder::new();
        let w = b.add_data_node(2);
        let u = b.add_data_node(2);
        let y = b.apply(Operation::square(), &[w]).unwrap();
        b.apply(Operation::square(), &[u]).unwrap();
        b.make_output(y).unwrap();
        let g = b.build();

        let info = DiffInfoBuilder::new(&g).build().unwrap();
        assert_eq!(info.require(u).unwrap().output_dep(y), DepType::Independent);
        assert_eq!(info.require(y).unwrap().variable_dep(u), DepType::Independent);
    }

    #[test]
    fn test_explicit_variables() {
        let mut b = GraphBuilder::new();
        let x = b.add_input_node(2);
        let w = b.add_data_node(2);
        let y = b.apply(Operation::mult(), &[x, w]).unwrap();
        b.make_output(y).unwrap();
        let g = b.build();

        let info = DiffInfoBuilder::new(&g).variables(vec![x]).build().unwrap();
        assert_eq!(info.require(x).unwrap().variable_dep(x), DepType::Identity);
        assert_eq!(info.require(w).unwrap().variable_dep(x), DepType::Independent);
        assert_eq!(info.require(y).unwrap().variable_dep(x), DepType::Dependent);

        assert!(DiffInfoBuilder::new(&g).variables(vec![y]).build().is_err());
        assert!(matches!(
            DiffInfoBuilder::new(&g).variables(vec![NodeId(77)]).build(),
            Err(Error::UnknownNode(_))
        ));
    }

    #[test]
    fn test_repeated_variable_rejected() {
        let mut b = GraphBuilder::new();
        let w = b.add_data_node(2);
        let y = b.apply(Operation::square(), &[w]).unwrap();
        b.make_output(y).unwrap();
        let g = b.build();

        let err = DiffInfoBuilder::new(&g).variables(vec![w, w]).build().unwrap_err();
        assert!(err.to_string().contains("more than once"), "{}", err);
    }

    #[test]
    fn test_output_feeding_output() {
        let mut b = GraphBuilder::new();
        let w = b.add_data_node(2);
        let y1 = b.apply(Operation::square(), &[w]).unwrap();
        let y2 = b.apply(Operation::square(), &[y1]).unwrap();
        b.make_output(y1).unwrap();
        b.make_output(y2).unwrap();
        let g = b.build();

        let info = DiffInfoBuilder::new(&g).build().unwrap();
        let y1_info = info.require(y1).unwrap();
        assert_eq!(y1_info.output_dep(y1), DepType::Identity);
        assert_eq!(y1_info.output_dep(y2), DepType::Dependent);
        assert_eq!(info.require(y2).unwrap().output_dep(y1), DepType::Independent);
        assert_eq!(info.require(w).unwrap().output_dep(y1), DepType::Dependent);
    }
}
