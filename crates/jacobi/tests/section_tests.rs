// Section Tests — End-to-end forward and gradient runs on the CPU backend

use jacobi::prelude::*;

// Helpers

fn t(data: &[f32], shape: impl Into<Shape>) -> Tensor {
    Tensor::from_vec(data.to_vec(), shape).unwrap()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(
        a.len(),
        b.len(),
        "length mismatch: {} vs {}",
        a.len(),
        b.len()
    );
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "elem {}: {} vs {} (tol={})",
            i,
            x,
            y,
            tol
        );
    }
}

fn differentiating() -> SectionConfig {
    SectionConfig::default().with_differentiate(true)
}

/// Central-difference d(output)/d(var) by perturbing a bound data node,
/// laid out [var.size(), output.size()].
fn numeric_grad(
    section: &mut Section<'_, CpuBackend>,
    inputs: &[(NodeId, &Tensor)],
    var: NodeId,
    output: NodeId,
) -> Vec<f32> {
    let eps = 1e-2f32;
    let original = section.value(var).unwrap().clone();
    let n_in = original.len();
    let mut jac = Vec::new();
    let mut rows = Vec::with_capacity(n_in);
    for p in 0..n_in {
        let mut eval = |delta: f32| {
            let mut moved = original.clone();
            moved.data_mut()[p] += delta;
            section.set_data(var, moved).unwrap();
            let r = section.execute(inputs, false).unwrap();
            r.output(output).unwrap().to_vec()
        };
        let hi = eval(eps);
        let lo = eval(-eps);
        rows.push(
            hi.iter()
                .zip(&lo)
                .map(|(h, l)| (h - l) / (2.0 * eps))
                .collect::<Vec<f32>>(),
        );
    }
    section.set_data(var, original).unwrap();
    for row in rows {
        jac.extend(row);
    }
    jac
}

// Reference scenarios

#[test]
fn test_two_layer_vecmatmul() {
    // vecmatmul(vecmatmul(input[2], A[2x3]), B[3x1]) -> [1]
    let mut b = GraphBuilder::new();
    let x = b.add_input_node(2);
    let a = b.add_data_node((2, 3));
    let w = b.add_data_node((3, 1));
    let h = b.apply(Operation::vecmatmul(), &[x, a]).unwrap();
    let y = b.apply(Operation::vecmatmul(), &[h, w]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(a, t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)))
        .bind_data(w, t(&[1.0, 2.0, 3.0], (3, 1)))
        .build()
        .unwrap();

    let input = t(&[1.0, 2.0], 2);
    let result = section.execute(&[(x, &input)], true).unwrap();
    assert_eq!(result.output(y).unwrap().data(), &[78.0]);
    assert_eq!(
        result.grad(a, y).unwrap().data(),
        &[1.0, 2.0, 3.0, 2.0, 4.0, 6.0]
    );
    assert_eq!(result.grad(w, y).unwrap().data(), &[9.0, 12.0, 15.0]);
    assert_eq!(result.grad(a, y).unwrap().dims(), &[2, 3, 1]);
    // the input is not a variable
    assert!(result.grad(x, y).is_none());
}

#[test]
fn test_square_of_difference_jacobian() {
    let mut b = GraphBuilder::new();
    let x = b.add_input_node(3);
    let v = b.add_data_node(3);
    let d = b.apply(Operation::sub(), &[x, v]).unwrap();
    let y = b.apply(Operation::square(), &[d]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(v, t(&[1.0, 2.0, 3.0], 3))
        .build()
        .unwrap();
    let input = t(&[2.0, 4.0, 6.0], 3);
    let result = section.execute(&[(x, &input)], true).unwrap();

    assert_eq!(result.output(y).unwrap().data(), &[1.0, 4.0, 9.0]);
    let jac = result.grad(v, y).unwrap();
    assert_eq!(jac.dims(), &[3, 3]);
    assert_eq!(
        jac.data(),
        &[-2.0, 0.0, 0.0, 0.0, -4.0, 0.0, 0.0, 0.0, -6.0]
    );
}

#[test]
fn test_reduced_square_of_difference() {
    let mut b = GraphBuilder::new();
    let x = b.add_input_node(3);
    let v = b.add_data_node(3);
    let d = b.apply(Operation::sub(), &[x, v]).unwrap();
    let s = b.apply(Operation::square(), &[d]).unwrap();
    let y = b.apply(Operation::reduce_sum(0), &[s]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(v, t(&[1.0, 2.0, 3.0], 3))
        .build()
        .unwrap();
    let input = t(&[2.0, 4.0, 6.0], 3);
    let result = section.execute(&[(x, &input)], true).unwrap();

    assert_eq!(result.output(y).unwrap().data(), &[14.0]);
    assert_eq!(result.grad(v, y).unwrap().data(), &[-2.0, -4.0, -6.0]);
}

// Chain-rule properties

#[test]
fn test_diamond_paths_add_up() {
    // y = square(w) + mult(w, w) = 2 w^2, dy/dw = diag(4 w)
    let mut b = GraphBuilder::new();
    let w = b.add_data_node(2);
    let p = b.apply(Operation::square(), &[w]).unwrap();
    let q = b.apply(Operation::mult(), &[w, w]).unwrap();
    let y = b.apply(Operation::add(), &[p, q]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(w, t(&[1.0, 3.0], 2))
        .build()
        .unwrap();
    let result = section.execute(&[], true).unwrap();
    assert_eq!(result.output(y).unwrap().data(), &[2.0, 18.0]);
    assert_eq!(result.grad(w, y).unwrap().data(), &[4.0, 0.0, 0.0, 12.0]);
    // each path alone contributes diag(2 w)
    assert_eq!(result.grad(p, y).unwrap().data(), &[1.0, 0.0, 0.0, 1.0]);
    assert_eq!(result.grad(q, y).unwrap().data(), &[1.0, 0.0, 0.0, 1.0]);
}

#[test]
fn test_reexecution_is_bitwise_identical() {
    let mut b = GraphBuilder::new();
    let x = b.add_input_node(3);
    let a = b.add_data_node((2, 3));
    let m = b.apply(Operation::matvecmul(), &[a, x]).unwrap();
    let s = b.apply(Operation::square(), &[m]).unwrap();
    let y = b.apply(Operation::reduce_mean(0), &[s]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(a, t(&[0.1, -0.7, 1.3, 2.2, 0.05, -1.9], (2, 3)))
        .build()
        .unwrap();
    let input = t(&[0.3, 1.7, -0.4], 3);

    let snapshot = |section: &mut Section<'_, CpuBackend>| {
        let r = section.execute(&[(x, &input)], true).unwrap();
        (
            r.output(y).unwrap().to_vec(),
            r.grad(a, y).unwrap().to_vec(),
            r.grad(m, y).unwrap().to_vec(),
        )
    };
    let first = snapshot(&mut section);
    let second = snapshot(&mut section);
    let bits = |v: &[f32]| v.iter().map(|f| f.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&first.0), bits(&second.0));
    assert_eq!(bits(&first.1), bits(&second.1));
    assert_eq!(bits(&first.2), bits(&second.2));
}

#[test]
fn test_matmul_chain_matches_finite_differences() {
    // y = reduce_sum(square(matmul(A, B)), 1) -> [2]
    let mut b = GraphBuilder::new();
    let a = b.add_data_node((2, 3));
    let w = b.add_data_node((3, 2));
    let m = b.apply(Operation::matmul(), &[a, w]).unwrap();
    let s = b.apply(Operation::square(), &[m]).unwrap();
    let y = b.apply(Operation::reduce_sum(1), &[s]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(a, t(&[0.5, -1.0, 0.25, 1.5, 0.75, -0.5], (2, 3)))
        .bind_data(w, t(&[1.0, 0.5, -0.5, 2.0, 0.25, -1.0], (3, 2)))
        .build()
        .unwrap();

    let (ga, gw) = {
        let r = section.execute(&[], true).unwrap();
        (r.grad(a, y).unwrap().to_vec(), r.grad(w, y).unwrap().to_vec())
    };
    assert_close(&ga, &numeric_grad(&mut section, &[], a, y), 1e-2);
    assert_close(&gw, &numeric_grad(&mut section, &[], w, y), 1e-2);
}

#[test]
fn test_dot_product_and_mean() {
    // y = dot(u, reduce_mean(M, 0)), M: [2, 3]
    let mut b = GraphBuilder::new();
    let u = b.add_input_node(3);
    let mat = b.add_data_node((2, 3));
    let mean = b.apply(Operation::reduce_mean(0), &[mat]).unwrap();
    let y = b.apply(Operation::dot_product(), &[u, mean]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(mat, t(&[1.0, 2.0, 3.0, 3.0, 4.0, 5.0], (2, 3)))
        .build()
        .unwrap();
    let input = t(&[1.0, 0.0, 2.0], 3);
    let result = section.execute(&[(u, &input)], true).unwrap();
    // mean = [2, 3, 4]
    assert_eq!(result.output(y).unwrap().data(), &[10.0]);
    assert_eq!(
        result.grad(mat, y).unwrap().data(),
        &[0.5, 0.0, 1.0, 0.5, 0.0, 1.0]
    );
}

#[test]
fn test_output_feeding_another_output() {
    // y1 = square(w), y2 = reduce_sum(y1); both observable
    let mut b = GraphBuilder::new();
    let w = b.add_data_node(2);
    let y1 = b.apply(Operation::square(), &[w]).unwrap();
    let y2 = b.apply(Operation::reduce_sum(0), &[y1]).unwrap();
    b.make_output(y1).unwrap();
    b.make_output(y2).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(w, t(&[1.0, 2.0], 2))
        .build()
        .unwrap();
    let result = section.execute(&[], true).unwrap();

    let outputs: Vec<NodeId> = result.outputs().map(|(id, _)| id).collect();
    assert_eq!(outputs, vec![y1, y2]);
    assert_eq!(result.grad(y1, y1).unwrap().data(), &[1.0, 0.0, 0.0, 1.0]);
    assert_eq!(result.grad(y1, y2).unwrap().data(), &[1.0, 1.0]);
    assert_eq!(result.grad(w, y1).unwrap().data(), &[2.0, 0.0, 0.0, 4.0]);
    assert_eq!(result.grad(w, y2).unwrap().data(), &[2.0, 4.0]);
    assert!(result.grad(y2, y1).is_none());
}

#[test]
fn test_gradient_with_respect_to_input() {
    let mut b = GraphBuilder::new();
    let x = b.add_input_node(2);
    let w = b.add_data_node(2);
    let y = b.apply(Operation::mult(), &[x, w]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating().with_variables(vec![x]))
        .bind_data(w, t(&[3.0, 5.0], 2))
        .build()
        .unwrap();
    let input = t(&[1.0, 1.0], 2);
    let result = section.execute(&[(x, &input)], true).unwrap();
    assert_eq!(result.grad(x, y).unwrap().data(), &[3.0, 0.0, 0.0, 5.0]);
    assert!(result.grad(w, y).is_none());
}

// Storage and lifecycle

#[test]
fn test_dead_branch_gets_no_gradient_storage() {
    let mut b = GraphBuilder::new();
    let w = b.add_data_node(4);
    let y = b.apply(Operation::square(), &[w]).unwrap();
    let dead = b.apply(Operation::square(), &[w]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(w, t(&[1.0, 2.0, 3.0, 4.0], 4))
        .build()
        .unwrap();
    let grads = section.grads().unwrap();
    assert!(grads.grad_map(dead).unwrap().is_empty());
    // identity for y, one block for w
    assert_eq!(grads.num_blocks(), 2);

    let result = section.execute(&[], true).unwrap();
    assert!(result.grad(dead, y).is_none());
    // the dead op still ran forward
    assert_eq!(section.value(dead).unwrap().data(), &[1.0, 4.0, 9.0, 16.0]);
}

#[test]
fn test_forward_only_run_skips_gradients() {
    let mut b = GraphBuilder::new();
    let w = b.add_data_node(2);
    let y = b.apply(Operation::square(), &[w]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(w, t(&[1.0, 2.0], 2))
        .build()
        .unwrap();
    let result = section.execute(&[], false).unwrap();
    assert_eq!(result.output(y).unwrap().data(), &[1.0, 4.0]);
    assert!(result.grads().is_none());
}

#[test]
fn test_rebinding_data_changes_results() {
    let mut b = GraphBuilder::new();
    let x = b.add_input_node(2);
    let w = b.add_data_node(2);
    let y = b.apply(Operation::dot_product(), &[x, w]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .bind_data(w, t(&[1.0, 1.0], 2))
        .build()
        .unwrap();
    let input = t(&[2.0, 3.0], 2);
    let first = section.execute(&[(x, &input)], false).unwrap().output(y).unwrap().to_vec();
    section.set_data(w, t(&[2.0, 0.0], 2)).unwrap();
    let second = section.execute(&[(x, &input)], false).unwrap().output(y).unwrap().to_vec();
    assert_eq!(first, vec![5.0]);
    assert_eq!(second, vec![4.0]);
}

#[test]
fn test_two_sections_share_one_graph() {
    let mut b = GraphBuilder::new();
    let w = b.add_data_node(2);
    let y = b.apply(Operation::square(), &[w]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut s1 = SectionBuilder::new(&graph, CpuBackend::new())
        .bind_data(w, t(&[1.0, 2.0], 2))
        .build()
        .unwrap();
    let mut s2 = SectionBuilder::new(&graph, CpuBackend::new())
        .bind_data(w, t(&[3.0, 4.0], 2))
        .build()
        .unwrap();
    let r1 = s1.execute(&[], false).unwrap().output(y).unwrap().to_vec();
    let r2 = s2.execute(&[], false).unwrap().output(y).unwrap().to_vec();
    assert_eq!(r1, vec![1.0, 4.0]);
    assert_eq!(r2, vec![9.0, 16.0]);
}

// Zero-size dimensions

#[test]
fn test_zero_inner_dimension_differentiates() {
    // matmul(A[2, 0], W[0, 3]) -> [2, 3] of zeros, with empty gradients
    let mut b = GraphBuilder::new();
    let a = b.add_data_node((2, 0));
    let w = b.add_data_node((0, 3));
    let y = b.apply(Operation::matmul(), &[a, w]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(a, t(&[], (2, 0)))
        .bind_data(w, t(&[], (0, 3)))
        .build()
        .unwrap();
    let result = section.execute(&[], true).unwrap();
    assert_eq!(result.output(y).unwrap().data(), &[0.0; 6]);
    assert_eq!(result.grad(a, y).unwrap().dims(), &[2, 0, 2, 3]);
    assert!(result.grad(a, y).unwrap().data().is_empty());
    assert!(result.grad(w, y).unwrap().data().is_empty());
}

#[test]
fn test_empty_output_differentiates() {
    // s = square(v) with v empty, next to an ordinary output y
    let mut b = GraphBuilder::new();
    let v = b.add_data_node(0);
    let s = b.apply(Operation::square(), &[v]).unwrap();
    let w = b.add_data_node(2);
    let y = b.apply(Operation::square(), &[w]).unwrap();
    b.make_output(s).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating())
        .bind_data(v, t(&[], 0))
        .bind_data(w, t(&[1.0, 2.0], 2))
        .build()
        .unwrap();
    let result = section.execute(&[], true).unwrap();
    assert!(result.output(s).unwrap().data().is_empty());
    assert!(result.grad(v, s).unwrap().data().is_empty());
    assert_eq!(result.grad(w, y).unwrap().data(), &[2.0, 0.0, 0.0, 4.0]);
}

// Errors

#[test]
fn test_execution_errors() {
    let mut b = GraphBuilder::new();
    let x = b.add_input_node(2);
    let w = b.add_data_node(2);
    let y = b.apply(Operation::add(), &[x, w]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let mut section = SectionBuilder::new(&graph, CpuBackend::new()).build().unwrap();
    let input = t(&[1.0, 2.0], 2);

    assert!(matches!(section.execute(&[], false), Err(Error::MissingInput(_))));
    assert!(matches!(
        section.execute(&[(x, &input)], false),
        Err(Error::UnboundData(_))
    ));
    section.set_data(w, t(&[0.0, 0.0], 2)).unwrap();
    assert!(matches!(
        section.execute(&[(x, &input)], true),
        Err(Error::DifferentiationDisabled)
    ));
    let wrong = t(&[1.0, 2.0, 3.0], 3);
    assert!(matches!(
        section.execute(&[(x, &wrong)], false),
        Err(Error::ShapeMismatch { .. })
    ));
    // a failed call leaves the section usable
    let r = section.execute(&[(x, &input)], false).unwrap();
    assert_eq!(r.output(y).unwrap().data(), &[1.0, 2.0]);
}

#[test]
fn test_repeated_variable_rejected_at_build() {
    let mut b = GraphBuilder::new();
    let w = b.add_data_node(2);
    let y = b.apply(Operation::square(), &[w]).unwrap();
    b.make_output(y).unwrap();
    let graph = b.build();

    let built = SectionBuilder::new(&graph, CpuBackend::new())
        .config(differentiating().with_variables(vec![w, w]))
        .bind_data(w, t(&[1.0, 2.0], 2))
        .build();
    assert!(built.is_err());
}
