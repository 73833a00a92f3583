// GradSystem — Sparse storage for Jacobian-form gradients
//
// For a node n and graph output o, the gradient d(o)/d(n) is a tensor of
// shape n.shape ⊗ o.shape. Storing one block per pair would cost
// O(|nodes|²) tensors, so the system keeps a two-level sparse map
//
//   source node → (output node → Gradient)
//
// and allocates only what the dependency analysis allows:
//
//   - every output o gets an identity block for itself (materialized, never
//     zeroed)
//   - any other node n gets a zero block for o iff n depends on at least
//     one variable and n's output dependency on o is not Independent
//
// Every tensor node has a map, possibly empty. A missing (node, output) pair
// means "no contribution", never an error.
//
// All blocks live in one TensorArena and are addressed by TensorHandle.

use std::collections::BTreeMap;

use crate::diff_info::{DepType, DiffInfo};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use crate::shape::Shape;
use crate::tensor::{Tensor, TensorArena, TensorHandle};

/// One gradient block d(output)/d(source).
#[derive(Debug, Clone, PartialEq)]
pub struct Gradient {
    /// Shape of the source node.
    pub in_shape: Shape,
    /// Shape of the target output.
    pub out_shape: Shape,
    pub handle: TensorHandle,
    /// Fixed identity block; skipped by zeroing and never written by kernels.
    pub identity: bool,
}

impl Gradient {
    /// The full Jacobian shape, `in_shape ⊗ out_shape`.
    pub fn shape(&self) -> Shape {
        &self.in_shape * &self.out_shape
    }
}

pub type GradMap = BTreeMap<NodeId, Gradient>;

/// Gradient storage for one graph and one dependency analysis.
#[derive(Debug, Default)]
pub struct GradSystem {
    arena: TensorArena,
    maps: BTreeMap<NodeId, GradMap>,
}

impl GradSystem {
    pub fn new(graph: &Graph, info: &DiffInfo) -> Result<Self> {
        let mut arena = TensorArena::new();
        let mut maps: BTreeMap<NodeId, GradMap> =
            graph.tensor_nodes().map(|n| (n.id, GradMap::new())).collect();

        for &o in info.outputs() {
            let shape = graph.shape(o).ok_or(Error::UnknownNode(o))?.clone();
            let handle = arena.insert(Tensor::identity(&shape));
            maps.entry(o).or_default().insert(
                o,
                Gradient {
                    in_shape: shape.clone(),
                    out_shape: shape,
                    handle,
                    identity: true,
                },
            );
        }

        for node in graph.tensor_nodes() {
            let record = info.require(node.id)?;
            if !record.depends_on_variables() {
                continue;
            }
            for &o in info.outputs() {
                if record.output_dep(o) != DepType::Dependent {
                    continue;
                }
                let out_shape = graph.shape(o).ok_or(Error::UnknownNode(o))?.clone();
                let handle = arena.allocate(&node.shape * &out_shape);
                maps.entry(node.id).or_default().insert(
                    o,
                    Gradient {
                        in_shape: node.shape.clone(),
                        out_shape,
                        handle,
                        identity: false,
                    },
                );
            }
        }

        let system = GradSystem { arena, maps };
        log::debug!(
            "gradient system: {} blocks, {} f32 elements",
            system.num_blocks(),
            system.arena.elem_count()
        );
        Ok(system)
    }

    /// Gradient map of `node`, keyed by output.
    pub fn grad_map(&self, node: NodeId) -> Option<&GradMap> {
        self.maps.get(&node)
    }

    /// The gradient entry for `(node, output)`, if one exists.
    pub fn entry(&self, node: NodeId, output: NodeId) -> Option<&Gradient> {
        self.maps.get(&node).and_then(|m| m.get(&output))
    }

    /// d(output)/d(node) as a `[node.size(), output.size()]` row-major block.
    pub fn get(&self, node: NodeId, output: NodeId) -> Option<&Tensor> {
        self.entry(node, output).map(|g| self.arena.get(g.handle))
    }

    pub fn tensor(&self, grad: &Gradient) -> &Tensor {
        self.arena.get(grad.handle)
    }

    /// Zero every non-identity block.
    pub fn zero_non_identity(&mut self) {
        for grad in self.maps.values().flat_map(|m| m.values()) {
            if !grad.identity {
                self.arena.zero(grad.handle);
            }
        }
    }

    pub(crate) fn arena_mut(&mut self) -> &mut TensorArena {
        &mut self.arena
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, NodeId, &Gradient)> {
        self.maps
            .iter()
            .flat_map(|(&n, m)| m.iter().map(move |(&o, g)| (n, o, g)))
    }

    /// Number of allocated blocks, identity blocks included.
    pub fn num_blocks(&self) -> usize {
        self.maps.values().map(|m| m.len()).sum()
    }

    pub fn elem_count(&self) -> usize {
        self.arena.elem_count()
    }
}
