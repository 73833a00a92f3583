// Forward kernels — one function per operation kind
//
// Every kernel overwrites its output buffer. Shapes are checked against the
// operation's shape rule before any arithmetic, so a kernel body can index
// freely.
//
// The matmul family splits the output into rows and fills them in parallel
// with rayon; element-wise kernels and reductions are sequential.

use rayon::prelude::*;

use jacobi_core::{Error, OpKind, Operation, Result, Tensor};

/// Execute `op` on `inputs`, writing `output`.
pub fn exec(op: &Operation, inputs: &[&Tensor], output: &mut Tensor) -> Result<()> {
    check_shapes(op, inputs, output)?;
    match op.kind {
        OpKind::Noop => {}
        OpKind::Identity => output.data_mut().copy_from_slice(inputs[0].data()),
        OpKind::Matmul => matmul(inputs[0], inputs[1], output),
        OpKind::VecMatmul => vecmatmul(inputs[0], inputs[1], output),
        OpKind::MatVecmul => matvecmul(inputs[0], inputs[1], output),
        OpKind::DotProduct => {
            output.data_mut()[0] = dot(inputs[0].data(), inputs[1].data());
        }
        OpKind::Add => zip_with(inputs, output, |a, b| a + b),
        OpKind::Sub => zip_with(inputs, output, |a, b| a - b),
        OpKind::Mult => zip_with(inputs, output, |a, b| a * b),
        OpKind::Square => {
            for (o, &x) in output.data_mut().iter_mut().zip(inputs[0].data()) {
                *o = x * x;
            }
        }
        OpKind::ReduceSum => reduce(op, inputs[0], output, false)?,
        OpKind::ReduceMean => reduce(op, inputs[0], output, true)?,
    }
    Ok(())
}

fn check_shapes(op: &Operation, inputs: &[&Tensor], output: &Tensor) -> Result<()> {
    let shapes: Vec<_> = inputs.iter().map(|t| t.shape()).collect();
    if let Some(expected) = op.infer_shape(&shapes)? {
        if &expected != output.shape() {
            return Err(Error::ShapeMismatch {
                expected,
                got: output.shape().clone(),
            });
        }
    }
    Ok(())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn zip_with(inputs: &[&Tensor], output: &mut Tensor, f: impl Fn(f32, f32) -> f32) {
    let (a, b) = (inputs[0].data(), inputs[1].data());
    for (i, o) in output.data_mut().iter_mut().enumerate() {
        *o = f(a[i], b[i]);
    }
}

/// `out[i, j] = Σ_l a[i, l] · b[l, j]`
fn matmul(a: &Tensor, b: &Tensor, output: &mut Tensor) {
    let (k, n) = (a.dims()[1], b.dims()[1]);
    if n == 0 {
        return;
    }
    let (a, b) = (a.data(), b.data());
    output
        .data_mut()
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, row)| {
            row.fill(0.0);
            for l in 0..k {
                let a_il = a[i * k + l];
                for (j, o) in row.iter_mut().enumerate() {
                    *o += a_il * b[l * n + j];
                }
            }
        });
}

/// `out[n] = Σ_m x[m] · w[m, n]`
fn vecmatmul(x: &Tensor, w: &Tensor, output: &mut Tensor) {
    let (m, n) = (w.dims()[0], w.dims()[1]);
    let (x, w) = (x.data(), w.data());
    output.data_mut().par_iter_mut().enumerate().for_each(|(j, o)| {
        *o = (0..m).map(|i| x[i] * w[i * n + j]).sum();
    });
}

/// `out[m] = Σ_n a[m, n] · x[n]`
fn matvecmul(a: &Tensor, x: &Tensor, output: &mut Tensor) {
    let n = a.dims()[1];
    let (a, x) = (a.data(), x.data());
    output.data_mut().par_iter_mut().enumerate().for_each(|(i, o)| {
        *o = dot(&a[i * n..(i + 1) * n], x);
    });
}

fn reduce(op: &Operation, input: &Tensor, output: &mut Tensor, mean: bool) -> Result<()> {
    let axis = op.axis(input.shape())?;
    let (outer, len, inner) = input.shape().split_at_axis(axis);
    let scale = if mean { 1.0 / len as f32 } else { 1.0 };
    let src = input.data();
    let dst = output.data_mut();
    for m in 0..outer {
        for n in 0..inner {
            let sum: f32 = (0..len).map(|k| src[(m * len + k) * inner + n]).sum();
            dst[m * inner + n] = sum * scale;
        }
    }
    Ok(())
}
