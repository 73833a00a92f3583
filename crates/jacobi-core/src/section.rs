// Section — An executable binding of a graph to a backend and its tensors
//
// A Section owns every tensor needed to run one graph repeatedly:
//
//   input slots     one per graph input, overwritten by each execute()
//   data tensors    bound once by the caller, reused across runs
//   value tensors   one per produced node (internal and outputs), zeroed
//                   before each run
//   gradients       the GradSystem, when built with differentiation
//
// All storage is allocated in SectionBuilder::build() and reused by every
// execute(). Shapes are graph-static, so nothing is ever reallocated; a
// different batch size means a different graph and a new section.
//
// WORKFLOW:
//
//   let mut section = SectionBuilder::new(&graph, CpuBackend::new())
//       .config(SectionConfig::default().with_differentiate(true))
//       .bind_data(w, weights)
//       .build()?;
//   let result = section.execute(&[(x, &input)], true)?;
//   let y_value = result.output(y);
//   let dy_dw = result.grad(w, y);
//
// A Section is not reentrant: execute() takes &mut self and the
// zero-then-accumulate protocol assumes one run at a time. The borrowed
// Graph may be shared by any number of sections.

use std::collections::BTreeMap;

use crate::backend::Backend;
use crate::backward::BackwardEngine;
use crate::diff_info::{DiffInfo, DiffInfoBuilder};
use crate::error::{Error, Result};
use crate::grad::GradSystem;
use crate::graph::{Graph, NodeId};
use crate::runner::ForwardRunner;
use crate::tensor::Tensor;
use crate::values::NodeValues;

// Configuration

/// Build-time options for a [`Section`].
#[derive(Debug, Clone, Default)]
pub struct SectionConfig {
    /// Build the dependency analysis, gradient storage and kernels.
    pub differentiate: bool,
    /// Nodes to differentiate with respect to. `None` means every data node.
    pub variables: Option<Vec<NodeId>>,
}

impl SectionConfig {
    pub fn with_differentiate(mut self, differentiate: bool) -> Self {
        self.differentiate = differentiate;
        self
    }

    pub fn with_variables(mut self, variables: Vec<NodeId>) -> Self {
        self.variables = Some(variables);
        self
    }
}

// Builder

pub struct SectionBuilder<'g, B: Backend> {
    graph: &'g Graph,
    backend: B,
    config: SectionConfig,
    data: BTreeMap<NodeId, Tensor>,
}

impl<'g, B: Backend> SectionBuilder<'g, B> {
    pub fn new(graph: &'g Graph, backend: B) -> Self {
        SectionBuilder {
            graph,
            backend,
            config: SectionConfig::default(),
            data: BTreeMap::new(),
        }
    }

    pub fn config(mut self, config: SectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind a data node's tensor. Checked in [`build`](SectionBuilder::build).
    pub fn bind_data(mut self, id: NodeId, tensor: Tensor) -> Self {
        self.data.insert(id, tensor);
        self
    }

    pub fn build(self) -> Result<Section<'g, B>> {
        let graph = self.graph;
        let mut values = NodeValues::new();

        for (id, tensor) in self.data {
            check_data(graph, id, &tensor)?;
            values.bind(id, tensor);
        }
        for &id in graph.inputs().iter().chain(graph.internal()).chain(graph.outputs()) {
            let shape = graph.shape(id).ok_or(Error::UnknownNode(id))?;
            values.allocate(id, shape);
        }

        let diff = if self.config.differentiate {
            let builder = match &self.config.variables {
                Some(vars) => DiffInfoBuilder::new(graph).variables(vars.clone()),
                None => DiffInfoBuilder::new(graph).all_data_nodes(),
            };
            let info = builder.build()?;
            let grads = GradSystem::new(graph, &info)?;
            let engine = BackwardEngine::new(graph, &self.backend)?;
            Some(Differentiation { info, grads, engine })
        } else {
            None
        };

        log::debug!(
            "section built: {} ops, {} value elements, differentiate={}",
            graph.num_op_nodes(),
            values.elem_count(),
            diff.is_some()
        );

        Ok(Section {
            graph,
            backend: self.backend,
            config: self.config,
            values,
            forward: ForwardRunner::new(graph),
            diff,
        })
    }
}

fn check_data(graph: &Graph, id: NodeId, tensor: &Tensor) -> Result<()> {
    if !graph.is_data(id) {
        crate::bail!("node {} is not a data node", id);
    }
    let shape = graph.shape(id).ok_or(Error::UnknownNode(id))?;
    if tensor.shape() != shape {
        return Err(Error::ShapeMismatch {
            expected: shape.clone(),
            got: tensor.shape().clone(),
        });
    }
    Ok(())
}

#[derive(Debug)]
struct Differentiation<'g> {
    info: DiffInfo,
    grads: GradSystem,
    engine: BackwardEngine<'g>,
}

// Section

/// A graph bound to a backend, ready to execute.
#[derive(Debug)]
pub struct Section<'g, B: Backend> {
    graph: &'g Graph,
    backend: B,
    config: SectionConfig,
    values: NodeValues,
    forward: ForwardRunner<'g>,
    diff: Option<Differentiation<'g>>,
}

impl<'g, B: Backend> Section<'g, B> {
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &SectionConfig {
        &self.config
    }

    /// The dependency analysis, if built with differentiation.
    pub fn diff_info(&self) -> Option<&DiffInfo> {
        self.diff.as_ref().map(|d| &d.info)
    }

    /// Gradients of the last differentiating run.
    pub fn grads(&self) -> Option<&GradSystem> {
        self.diff.as_ref().map(|d| &d.grads)
    }

    /// Value of any node after the last run.
    pub fn value(&self, id: NodeId) -> Result<&Tensor> {
        self.values.get(id)
    }

    /// Rebind a data node between runs.
    pub fn set_data(&mut self, id: NodeId, tensor: Tensor) -> Result<()> {
        check_data(self.graph, id, &tensor)?;
        self.values.bind(id, tensor);
        Ok(())
    }

    /// Mutable access to a bound data tensor between runs.
    pub fn data_mut(&mut self, id: NodeId) -> Result<&mut Tensor> {
        if !self.graph.is_data(id) {
            crate::bail!("node {} is not a data node", id);
        }
        if !self.values.contains(id) {
            return Err(Error::UnboundData(id));
        }
        self.values.get_mut(id)
    }

    /// Run the graph once.
    ///
    /// Every graph input must be supplied with its declared shape and every
    /// data node must be bound. With `calc_diffs`, gradients of every output
    /// with respect to the configured variables are recomputed.
    pub fn execute(&mut self, inputs: &[(NodeId, &Tensor)], calc_diffs: bool) -> Result<ExecResult<'_>> {
        if calc_diffs && self.diff.is_none() {
            return Err(Error::DifferentiationDisabled);
        }
        self.check_bindings(inputs)?;

        for &id in self.graph.internal().iter().chain(self.graph.outputs()) {
            self.values.zero(id);
        }
        for &(id, tensor) in inputs {
            self.values.get_mut(id)?.copy_from(tensor)?;
        }

        let backend = &self.backend;
        let values = &mut self.values;
        self.forward.run(|op| {
            log::trace!("forward {} {}", op.id, op.op);
            let mut out = values.take(op.output)?;
            let res = values
                .gather(&op.inputs)
                .and_then(|ins| backend.exec_op(&op.op, &ins, &mut out));
            values.put(op.output, out);
            res
        })?;

        if calc_diffs {
            if let Some(diff) = self.diff.as_mut() {
                diff.grads.zero_non_identity();
                diff.engine.run(&self.values, &mut diff.grads)?;
            }
        }

        Ok(ExecResult {
            values: &self.values,
            outputs: self.graph.outputs(),
            grads: if calc_diffs {
                self.diff.as_ref().map(|d| &d.grads)
            } else {
                None
            },
        })
    }

    fn check_bindings(&self, inputs: &[(NodeId, &Tensor)]) -> Result<()> {
        for &(id, tensor) in inputs {
            if !self.graph.is_input(id) {
                crate::bail!("node {} is not a graph input", id);
            }
            let shape = self.graph.shape(id).ok_or(Error::UnknownNode(id))?;
            if tensor.shape() != shape {
                return Err(Error::ShapeMismatch {
                    expected: shape.clone(),
                    got: tensor.shape().clone(),
                });
            }
        }
        for &id in self.graph.inputs() {
            if !inputs.iter().any(|&(i, _)| i == id) {
                return Err(Error::MissingInput(id));
            }
        }
        for &id in self.graph.data() {
            if !self.values.contains(id) {
                return Err(Error::UnboundData(id));
            }
        }
        Ok(())
    }
}

// Execution result

/// Borrowed view of one run's results, valid until the next `execute`.
#[derive(Debug)]
pub struct ExecResult<'a> {
    values: &'a NodeValues,
    outputs: &'a [NodeId],
    grads: Option<&'a GradSystem>,
}

impl<'a> ExecResult<'a> {
    /// Value of a graph output.
    pub fn output(&self, id: NodeId) -> Option<&'a Tensor> {
        if !self.outputs.contains(&id) {
            return None;
        }
        self.values.get(id).ok()
    }

    /// All outputs, in declaration order.
    pub fn outputs(&self) -> impl Iterator<Item = (NodeId, &'a Tensor)> + '_ {
        self.outputs
            .iter()
            .filter_map(|&id| self.values.get(id).ok().map(|t| (id, t)))
    }

    /// The gradient system, when this run differentiated.
    pub fn grads(&self) -> Option<&'a GradSystem> {
        self.grads
    }

    /// d(output)/d(node), or `None` when the pair has no gradient.
    pub fn grad(&self, node: NodeId, output: NodeId) -> Option<&'a Tensor> {
        self.grads.and_then(|g| g.get(node, output))
    }
}
