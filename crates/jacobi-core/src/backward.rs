// Backward — Reverse-mode propagation of Jacobian-form gradients
//
// Given the forward values of every node and a zeroed GradSystem, one pass
// fills d(o)/d(n) for every allocated (node, output) pair.
//
// HOW IT WORKS:
//
//   1. At construction every op node gets its own gradient-update kernel
//      from the backend. A missing kernel fails here, before anything runs.
//
//   2. The BackwardRunner visits ops consumers-first, so when an op is
//      visited the gradient map of its output is complete.
//
//   3. For each input position i and each output o present in BOTH the
//      op-output's map and the input's map:
//
//        kernel.update_grad(inputs, i, grad[op.output][o], grad[input_i][o])
//
//      which adds d(op.output)/d(input_i) · grad[op.output][o] into the
//      input's block.
//
// ACCUMULATION: a node feeding several ops, or reaching an output along
// several paths, receives one `+=` per (op, position). With mult(x, x) the
// kernel runs once for position 0 and once for position 1, giving 2·x.
//
// Identity blocks are never written: an op's input can only hold an
// identity block for itself, and the op's output cannot reach its own input.

use std::collections::BTreeMap;

use crate::backend::{Backend, GradKernel};
use crate::error::{Error, Result};
use crate::grad::GradSystem;
use crate::graph::{Graph, NodeId};
use crate::runner::BackwardRunner;
use crate::tensor::TensorHandle;
use crate::values::NodeValues;

/// Reverse-mode driver over one graph, with kernels resolved up front.
#[derive(Debug)]
pub struct BackwardEngine<'g> {
    runner: BackwardRunner<'g>,
    kernels: BTreeMap<NodeId, Box<dyn GradKernel>>,
}

impl<'g> BackwardEngine<'g> {
    pub fn new<B: Backend + ?Sized>(graph: &'g Graph, backend: &B) -> Result<Self> {
        let mut kernels = BTreeMap::new();
        for op in graph.op_nodes() {
            kernels.insert(op.id, backend.create_grad_kernel(&op.op)?);
        }
        log::debug!(
            "backward engine: {} kernels from backend '{}'",
            kernels.len(),
            backend.name()
        );
        Ok(BackwardEngine {
            runner: BackwardRunner::new(graph),
            kernels,
        })
    }

    /// Propagate gradients for one pass. `grads` must already be zeroed.
    pub fn run(&mut self, values: &NodeValues, grads: &mut GradSystem) -> Result<()> {
        let kernels = &mut self.kernels;
        self.runner.run(|op| {
            let kernel = kernels
                .get_mut(&op.id)
                .ok_or(Error::KernelNotFound(op.op.kind))?;
            let inputs = values.gather(&op.inputs)?;
            kernel.reset(&inputs, values.get(op.output)?)?;

            let out_map: Vec<(NodeId, TensorHandle)> = match grads.grad_map(op.output) {
                Some(m) => m.iter().map(|(&o, g)| (o, g.handle)).collect(),
                None => return Ok(()),
            };
            log::trace!("backward {} {} over {} outputs", op.id, op.op, out_map.len());

            for (index, &input) in op.inputs.iter().enumerate() {
                let targets: Vec<(TensorHandle, TensorHandle)> = match grads.grad_map(input) {
                    Some(in_map) => out_map
                        .iter()
                        .filter_map(|(o, out_h)| {
                            in_map
                                .get(o)
                                .filter(|g| !g.identity)
                                .map(|g| (*out_h, g.handle))
                        })
                        .collect(),
                    None => continue,
                };
                for (out_h, in_h) in targets {
                    let (out_grad, in_grad) = grads.arena_mut().pair_mut(out_h, in_h);
                    kernel.update_grad(&inputs, index, out_grad, in_grad)?;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff_info::DiffInfoBuilder;
    use crate::graph::GraphBuilder;
    use crate::op::{OpKind, Operation};
    use crate::tensor::Tensor;
    use std::sync::{Arc, Mutex};

    /// Kernel that records each update and adds `index + 1` to every element.
    #[derive(Debug)]
    struct CountingKernel {
        log: Arc<Mutex<Vec<(OpKind, usize)>>>,
        kind: OpKind,
    }

    impl GradKernel for CountingKernel {
        fn reset(&mut self, _inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
            Ok(())
        }

        fn update_grad(
            &self,
            _inputs: &[&Tensor],
            index: usize,
            _out_grad: &Tensor,
            in_grad: &mut Tensor,
        ) -> Result<()> {
            self.log.lock().unwrap().push((self.kind, index));
            for x in in_grad.data_mut() {
                *x += (index + 1) as f32;
            }
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<(OpKind, usize)>>>,
        refuse: Option<OpKind>,
    }

    impl Backend for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn exec_op(&self, _op: &Operation, _inputs: &[&Tensor], _output: &mut Tensor) -> Result<()> {
            Ok(())
        }

        fn create_grad_kernel(&self, op: &Operation) -> Result<Box<dyn GradKernel>> {
            if self.refuse == Some(op.kind) {
                return Err(Error::KernelNotFound(op.kind));
            }
            Ok(Box::new(CountingKernel {
                log: self.log.clone(),
                kind: op.kind,
            }))
        }
    }

    fn values_for(graph: &Graph) -> NodeValues {
        let mut values = NodeValues::new();
        for node in graph.tensor_nodes() {
            values.allocate(node.id, &node.shape);
        }
        values
    }

    #[test]
    fn test_missing_kernel_fails_at_construction() {
        let mut b = GraphBuilder::new();
        let x = b.add_input_node(2);
        let y = b.apply(Operation::square(), &[x]).unwrap();
        b.make_output(y).unwrap();
        let g = b.build();
        let backend = Recorder {
            refuse: Some(OpKind::Square),
            ..Default::default()
        };
        let r = BackwardEngine::new(&g, &backend);
        assert!(matches!(r, Err(Error::KernelNotFound(OpKind::Square))));
    }

    #[test]
    fn test_updates_only_allocated_pairs() {
        // y = x * w; only w is a variable, so x receives no update
        let mut b = GraphBuilder::new();
        let x = b.add_input_node(2);
        let w = b.add_data_node(2);
        let y = b.apply(Operation::mult(), &[x, w]).unwrap();
        b.make_output(y).unwrap();
        let g = b.build();

        let backend = Recorder::default();
        let info = DiffInfoBuilder::new(&g).build().unwrap();
        let mut grads = GradSystem::new(&g, &info).unwrap();
        let mut engine = BackwardEngine::new(&g, &backend).unwrap();
        engine.run(&values_for(&g), &mut grads).unwrap();

        assert_eq!(*backend.log.lock().unwrap(), vec![(OpKind::Mult, 1)]);
        assert!(grads.get(w, y).unwrap().data().iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_repeated_input_updates_each_position() {
        let mut b = GraphBuilder::new();
        let w = b.add_data_node(2);
        let y = b.apply(Operation::mult(), &[w, w]).unwrap();
        b.make_output(y).unwrap();
        let g = b.build();

        let backend = Recorder::default();
        let info = DiffInfoBuilder::new(&g).build().unwrap();
        let mut grads = GradSystem::new(&g, &info).unwrap();
        BackwardEngine::new(&g, &backend)
            .unwrap()
            .run(&values_for(&g), &mut grads)
            .unwrap();

        assert_eq!(backend.log.lock().unwrap().len(), 2);
        // 1 from position 0, 2 from position 1
        assert!(grads.get(w, y).unwrap().data().iter().all(|&v| v == 3.0));
        assert_eq!(grads.get(y, y).unwrap().data(), &[1.0, 0.0, 0.0, 1.0]);
    }
}
