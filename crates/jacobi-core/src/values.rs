use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::graph::NodeId;
use crate::shape::Shape;
use crate::tensor::{Tensor, TensorArena, TensorHandle};

/// Value tensors of a section's graph nodes, keyed by node id.
///
/// Slots are allocated once; later writes copy into the existing buffer.
#[derive(Debug, Default)]
pub struct NodeValues {
    arena: TensorArena,
    slots: BTreeMap<NodeId, TensorHandle>,
}

impl NodeValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a zeroed slot for `id`.
    pub(crate) fn allocate(&mut self, id: NodeId, shape: &Shape) {
        let handle = self.arena.allocate(shape.clone());
        self.slots.insert(id, handle);
    }

    /// Store `tensor` for `id`, reusing the slot if one exists.
    pub(crate) fn bind(&mut self, id: NodeId, tensor: Tensor) {
        match self.slots.get(&id) {
            Some(&h) => self.arena.put(h, tensor),
            None => {
                let h = self.arena.insert(tensor);
                self.slots.insert(id, h);
            }
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Result<&Tensor> {
        let h = self.slots.get(&id).ok_or(Error::UnknownNode(id))?;
        Ok(self.arena.get(*h))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Tensor> {
        let h = self.slots.get(&id).ok_or(Error::UnknownNode(id))?;
        Ok(self.arena.get_mut(*h))
    }

    pub(crate) fn zero(&mut self, id: NodeId) {
        if let Some(&h) = self.slots.get(&id) {
            self.arena.zero(h);
        }
    }

    /// Input tensors of an op, in positional order.
    pub fn gather(&self, ids: &[NodeId]) -> Result<Vec<&Tensor>> {
        ids.iter().map(|&id| self.get(id)).collect()
    }

    /// Move a value out so it can be written while others are borrowed.
    /// Must be followed by [`put`](NodeValues::put).
    pub(crate) fn take(&mut self, id: NodeId) -> Result<Tensor> {
        let h = self.slots.get(&id).ok_or(Error::UnknownNode(id))?;
        Ok(self.arena.take(*h))
    }

    pub(crate) fn put(&mut self, id: NodeId, tensor: Tensor) {
        if let Some(&h) = self.slots.get(&id) {
            self.arena.put(h, tensor);
        }
    }

    pub fn elem_count(&self) -> usize {
        self.arena.elem_count()
    }
}
