// Gradient-update kernels — the chain rule for each operation kind
//
// Gradients are Jacobian blocks. For an op `y = f(x_0, x_1, ...)` visited on
// behalf of a graph output o of size O:
//
//   out_grad  d(o)/d(y)    row-major [y.size(), O]
//   in_grad   d(o)/d(x_i)  row-major [x_i.size(), O], accumulated with +=
//
// so every rule below is "in(p, a) += Σ_q d(y_q)/d(x_i,p) · out(q, a)" with
// the sum collapsed to what the operation actually touches. `a` always runs
// over 0..O, the trailing (output) half of the block.
//
// RULES:
//
//   Identity, Add       in(i,a) += out(i,a)
//   Sub                 in0(i,a) += out(i,a)       in1(i,a) -= out(i,a)
//   Mult                in_k(i,a) += x_{1-k}(i) · out(i,a)
//   Square              in(i,a) += 2·x(i) · out(i,a)
//   DotProduct          in_k(i,a) += x_{1-k}(i) · out(0,a)
//   VecMatmul x·W       in0(m,a)   += Σ_n W(m,n) · out(n,a)
//                       in1(m,n,a) += x(m) · out(n,a)
//   MatVecmul A·x       in0(m,n,a) += out(m,a) · x(n)
//                       in1(n,a)   += Σ_m A(m,n) · out(m,a)
//   Matmul A·B          in0(i,l,a) += Σ_j out(i,j,a) · B(l,j)
//                       in1(l,j,a) += Σ_i out(i,j,a) · A(i,l)
//   ReduceSum(axis)     in(m,k,n,a) += out(m,n,a)       (outer m, axis k, inner n)
//   ReduceMean(axis)    in(m,k,n,a) += out(m,n,a) / len(axis)
//   Noop                nothing
//
// The matmul family fills rows of `in_grad` in parallel (rayon); each row of
// the input gradient is written by exactly one task.

use rayon::prelude::*;

use jacobi_core::{Error, GradKernel, OpKind, Operation, Result, Tensor};

/// Look up the gradient kernel for an operation kind.
pub fn kernel_for(op: &Operation) -> Box<dyn GradKernel> {
    match op.kind {
        OpKind::Noop => Box::new(NoopGrad),
        OpKind::Identity | OpKind::Add => Box::new(PassThroughGrad { signs: [1.0, 1.0] }),
        OpKind::Sub => Box::new(PassThroughGrad { signs: [1.0, -1.0] }),
        OpKind::Mult => Box::new(MultGrad),
        OpKind::Square => Box::new(SquareGrad),
        OpKind::DotProduct => Box::new(DotGrad),
        OpKind::VecMatmul => Box::new(VecMatmulGrad::default()),
        OpKind::MatVecmul => Box::new(MatVecmulGrad::default()),
        OpKind::Matmul => Box::new(MatmulGrad::default()),
        OpKind::ReduceSum => Box::new(ReduceGrad::new(*op, false)),
        OpKind::ReduceMean => Box::new(ReduceGrad::new(*op, true)),
    }
}

/// Width O of a gradient block whose rows index a tensor of `rows` elements.
fn block_width(grad: &Tensor, rows: usize) -> Result<usize> {
    if rows == 0 || grad.is_empty() || grad.len() % rows != 0 {
        return Err(Error::msg(format!(
            "gradient block of {} elements does not have {} rows",
            grad.len(),
            rows
        )));
    }
    Ok(grad.len() / rows)
}

/// Width of the output half, checking that `in_grad` agrees with it.
fn widths(input: &Tensor, out_rows: usize, out_grad: &Tensor, in_grad: &Tensor) -> Result<usize> {
    let o = block_width(out_grad, out_rows)?;
    if in_grad.len() != input.len() * o {
        return Err(Error::msg(format!(
            "input gradient has {} elements, expected {}x{}",
            in_grad.len(),
            input.len(),
            o
        )));
    }
    Ok(o)
}

fn input<'a>(inputs: &[&'a Tensor], index: usize) -> Result<&'a Tensor> {
    inputs
        .get(index)
        .copied()
        .ok_or_else(|| Error::msg(format!("no input at position {}", index)))
}

/// True when either block has no elements (a zero-size dimension somewhere).
fn nothing_to_update(out_grad: &Tensor, in_grad: &Tensor) -> bool {
    out_grad.is_empty() || in_grad.is_empty()
}

// Element-wise family

#[derive(Debug)]
struct NoopGrad;

impl GradKernel for NoopGrad {
    fn reset(&mut self, _inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
        Ok(())
    }

    fn update_grad(&self, _: &[&Tensor], _: usize, _: &Tensor, _: &mut Tensor) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct PassThroughGrad {
    signs: [f32; 2],
}

impl GradKernel for PassThroughGrad {
    fn reset(&mut self, _inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
        Ok(())
    }

    fn update_grad(
        &self,
        inputs: &[&Tensor],
        index: usize,
        out_grad: &Tensor,
        in_grad: &mut Tensor,
    ) -> Result<()> {
        if nothing_to_update(out_grad, in_grad) {
            return Ok(());
        }
        let x = input(inputs, index)?;
        widths(x, x.len(), out_grad, in_grad)?;
        let sign = self.signs[index.min(1)];
        for (g, &o) in in_grad.data_mut().iter_mut().zip(out_grad.data()) {
            *g += sign * o;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MultGrad;

impl GradKernel for MultGrad {
    fn reset(&mut self, _inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
        Ok(())
    }

    fn update_grad(
        &self,
        inputs: &[&Tensor],
        index: usize,
        out_grad: &Tensor,
        in_grad: &mut Tensor,
    ) -> Result<()> {
        if nothing_to_update(out_grad, in_grad) {
            return Ok(());
        }
        let x = input(inputs, index)?;
        let other = input(inputs, 1 - index.min(1))?.data();
        let o = widths(x, x.len(), out_grad, in_grad)?;
        scale_rows(in_grad.data_mut(), out_grad.data(), o, |i| other[i]);
        Ok(())
    }
}

#[derive(Debug)]
struct SquareGrad;

impl GradKernel for SquareGrad {
    fn reset(&mut self, _inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
        Ok(())
    }

    fn update_grad(
        &self,
        inputs: &[&Tensor],
        index: usize,
        out_grad: &Tensor,
        in_grad: &mut Tensor,
    ) -> Result<()> {
        if nothing_to_update(out_grad, in_grad) {
            return Ok(());
        }
        let x = input(inputs, index)?;
        let o = widths(x, x.len(), out_grad, in_grad)?;
        let xs = x.data();
        scale_rows(in_grad.data_mut(), out_grad.data(), o, |i| 2.0 * xs[i]);
        Ok(())
    }
}

/// `in(i, a) += s(i) · out(i, a)` for blocks of equal shape.
fn scale_rows(in_grad: &mut [f32], out_grad: &[f32], o: usize, s: impl Fn(usize) -> f32) {
    for (i, (g_row, o_row)) in in_grad.chunks_mut(o).zip(out_grad.chunks(o)).enumerate() {
        let s = s(i);
        for (g, &v) in g_row.iter_mut().zip(o_row) {
            *g += s * v;
        }
    }
}

#[derive(Debug)]
struct DotGrad;

impl GradKernel for DotGrad {
    fn reset(&mut self, _inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
        Ok(())
    }

    fn update_grad(
        &self,
        inputs: &[&Tensor],
        index: usize,
        out_grad: &Tensor,
        in_grad: &mut Tensor,
    ) -> Result<()> {
        if nothing_to_update(out_grad, in_grad) {
            return Ok(());
        }
        let x = input(inputs, index)?;
        let other = input(inputs, 1 - index.min(1))?.data();
        let o = widths(x, 1, out_grad, in_grad)?;
        let out = out_grad.data();
        for (i, row) in in_grad.data_mut().chunks_mut(o).enumerate() {
            for (g, &v) in row.iter_mut().zip(out) {
                *g += other[i] * v;
            }
        }
        Ok(())
    }
}

// Matmul family

/// `[M] · [M, N] → [N]`
#[derive(Debug, Default)]
struct VecMatmulGrad {
    n: usize,
}

impl GradKernel for VecMatmulGrad {
    fn reset(&mut self, inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
        let w = input(inputs, 1)?;
        self.n = w.dims().get(1).copied().unwrap_or(1);
        Ok(())
    }

    fn update_grad(
        &self,
        inputs: &[&Tensor],
        index: usize,
        out_grad: &Tensor,
        in_grad: &mut Tensor,
    ) -> Result<()> {
        if nothing_to_update(out_grad, in_grad) {
            return Ok(());
        }
        let n = self.n;
        let x = input(inputs, 0)?.data();
        let w = input(inputs, 1)?.data();
        let o = widths(input(inputs, index)?, n, out_grad, in_grad)?;
        let out = out_grad.data();
        match index {
            0 => in_grad
                .data_mut()
                .par_chunks_mut(o)
                .enumerate()
                .for_each(|(i, row)| {
                    for j in 0..n {
                        let w_ij = w[i * n + j];
                        for (a, g) in row.iter_mut().enumerate() {
                            *g += w_ij * out[j * o + a];
                        }
                    }
                }),
            _ => in_grad
                .data_mut()
                .par_chunks_mut(n * o)
                .enumerate()
                .for_each(|(i, block)| {
                    let x_i = x[i];
                    for (g, &v) in block.iter_mut().zip(&out[..n * o]) {
                        *g += x_i * v;
                    }
                }),
        }
        Ok(())
    }
}

/// `[M, N] · [N] → [M]`
#[derive(Debug, Default)]
struct MatVecmulGrad {
    m: usize,
    n: usize,
}

impl GradKernel for MatVecmulGrad {
    fn reset(&mut self, inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
        let a = input(inputs, 0)?;
        self.m = a.dims()[0];
        self.n = a.dims().get(1).copied().unwrap_or(1);
        Ok(())
    }

    fn update_grad(
        &self,
        inputs: &[&Tensor],
        index: usize,
        out_grad: &Tensor,
        in_grad: &mut Tensor,
    ) -> Result<()> {
        if nothing_to_update(out_grad, in_grad) {
            return Ok(());
        }
        let (m, n) = (self.m, self.n);
        let a_mat = input(inputs, 0)?.data();
        let x = input(inputs, 1)?.data();
        let o = widths(input(inputs, index)?, m, out_grad, in_grad)?;
        let out = out_grad.data();
        match index {
            0 => in_grad
                .data_mut()
                .par_chunks_mut(n * o)
                .enumerate()
                .for_each(|(i, block)| {
                    let out_row = &out[i * o..(i + 1) * o];
                    for (j, row) in block.chunks_mut(o).enumerate() {
                        for (g, &v) in row.iter_mut().zip(out_row) {
                            *g += v * x[j];
                        }
                    }
                }),
            _ => in_grad
                .data_mut()
                .par_chunks_mut(o)
                .enumerate()
                .for_each(|(j, row)| {
                    for i in 0..m {
                        let a_ij = a_mat[i * n + j];
                        for (a, g) in row.iter_mut().enumerate() {
                            *g += a_ij * out[i * o + a];
                        }
                    }
                }),
        }
        Ok(())
    }
}

/// `[M, K] · [K, N] → [M, N]`
#[derive(Debug, Default)]
struct MatmulGrad {
    m: usize,
    k: usize,
    n: usize,
}

impl GradKernel for MatmulGrad {
    fn reset(&mut self, inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
        let a = input(inputs, 0)?;
        let b = input(inputs, 1)?;
        if a.dims().len() != 2 || b.dims().len() != 2 {
            return Err(Error::msg("matmul gradient needs rank-2 operands"));
        }
        self.m = a.dims()[0];
        self.k = a.dims()[1];
        self.n = b.dims()[1];
        Ok(())
    }

    fn update_grad(
        &self,
        inputs: &[&Tensor],
        index: usize,
        out_grad: &Tensor,
        in_grad: &mut Tensor,
    ) -> Result<()> {
        if nothing_to_update(out_grad, in_grad) {
            return Ok(());
        }
        let (m, k, n) = (self.m, self.k, self.n);
        let a_mat = input(inputs, 0)?.data();
        let b_mat = input(inputs, 1)?.data();
        let o = widths(input(inputs, index)?, m * n, out_grad, in_grad)?;
        let out = out_grad.data();
        match index {
            // dA(i, l, a) = Σ_j out(i, j, a) · B(l, j)
            0 => in_grad
                .data_mut()
                .par_chunks_mut(k * o)
                .enumerate()
                .for_each(|(i, block)| {
                    for (l, row) in block.chunks_mut(o).enumerate() {
                        for j in 0..n {
                            let b_lj = b_mat[l * n + j];
                            let src = &out[(i * n + j) * o..(i * n + j + 1) * o];
                            for (g, &v) in row.iter_mut().zip(src) {
                                *g += v * b_lj;
                            }
                        }
                    }
                }),
            // dB(l, j, a) = Σ_i out(i, j, a) · A(i, l)
            _ => in_grad
                .data_mut()
                .par_chunks_mut(n * o)
                .enumerate()
                .for_each(|(l, block)| {
                    for (j, row) in block.chunks_mut(o).enumerate() {
                        for i in 0..m {
                            let a_il = a_mat[i * k + l];
                            let src = &out[(i * n + j) * o..(i * n + j + 1) * o];
                            for (g, &v) in row.iter_mut().zip(src) {
                                *g += v * a_il;
                            }
                        }
                    }
                }),
        }
        Ok(())
    }
}

// Reductions

#[derive(Debug)]
struct ReduceGrad {
    op: Operation,
    mean: bool,
    split: (usize, usize, usize),
}

impl ReduceGrad {
    fn new(op: Operation, mean: bool) -> Self {
        ReduceGrad {
            op,
            mean,
            split: (0, 0, 0),
        }
    }
}

impl GradKernel for ReduceGrad {
    fn reset(&mut self, inputs: &[&Tensor], _output: &Tensor) -> Result<()> {
        let x = input(inputs, 0)?;
        let axis = self.op.axis(x.shape())?;
        self.split = x.shape().split_at_axis(axis);
        Ok(())
    }

    fn update_grad(
        &self,
        inputs: &[&Tensor],
        index: usize,
        out_grad: &Tensor,
        in_grad: &mut Tensor,
    ) -> Result<()> {
        if nothing_to_update(out_grad, in_grad) {
            return Ok(());
        }
        let (outer, len, inner) = self.split;
        let o = widths(input(inputs, index)?, outer * inner, out_grad, in_grad)?;
        let scale = if self.mean { 1.0 / len as f32 } else { 1.0 };
        let out = out_grad.data();
        let dst = in_grad.data_mut();
        for m in 0..outer {
            for k in 0..len {
                for n in 0..inner {
                    let src = (m * inner + n) * o;
                    let dst_row = ((m * len + k) * inner + n) * o;
                    for a in 0..o {
                        dst[dst_row + a] += scale * out[src + a];
                    }
                }
            }
        }
        Ok(())
    }
}
