use mind_grad::autodiff::{compute_broadcast_backward_axes, BroadcastError};
use mind_grad::types::ShapeDim;

fn known(dims: &[usize]) -> Vec<ShapeDim> {
    dims.iter().map(|&d| ShapeDim::Known(d)).collect()
}

/// Every shape of rank <= 3 with extents drawn from {1, 2, 3}.
fn small_shapes() -> Vec<Vec<usize>> {
    let mut shapes = vec![Vec::new()];
    let mut frontier = vec![Vec::new()];
    for _ in 0..3 {
        let mut next = Vec::new();
        for shape in &frontier {
            for extent in 1..=3 {
                let mut grown: Vec<usize> = shape.clone();
                grown.push(extent);
                next.push(grown);
            }
        }
        shapes.extend(next.iter().cloned());
        frontier = next;
    }
    shapes
}

fn broadcast(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    (0..rank)
        .map(|k| {
            let x = (k + a.len()).checked_sub(rank).map_or(1, |i| a[i]);
            let y = (k + b.len()).checked_sub(rank).map_or(1, |i| b[i]);
            match (x, y) {
                _ if x == y => Some(x),
                (1, _) => Some(y),
                (_, 1) => Some(x),
                _ => None,
            }
        })
        .collect()
}

/// Summing the broadcast result over `axes` and dropping leading unit axes
/// must give back `operand`.
fn assert_axes_restore(operand: &[usize], out: &[usize], axes: &[i64]) {
    let offset = out.len() - operand.len();
    for (k, &extent) in out.iter().enumerate() {
        let reduced = axes.contains(&(k as i64));
        if k < offset {
            assert!(reduced, "leading axis {k} of {out:?} kept for {operand:?}");
        } else if reduced {
            assert_eq!(operand[k - offset], 1, "axis {k} reduced for {operand:?}");
            assert_ne!(extent, 1, "unit axis {k} reduced for {operand:?}");
        } else {
            assert_eq!(operand[k - offset], extent);
        }
    }
    assert!(axes.windows(2).all(|w| w[0] < w[1]), "axes not ascending: {axes:?}");
}

#[test]
fn axes_undo_broadcasting_for_all_small_shapes() {
    let shapes = small_shapes();
    assert_eq!(shapes.len(), 40);
    for a in &shapes {
        for b in &shapes {
            let result = compute_broadcast_backward_axes(&known(a), &known(b), "n");
            match broadcast(a, b) {
                Some(out) => {
                    let axes = result.unwrap_or_else(|e| panic!("{a:?} vs {b:?}: {e}"));
                    assert_axes_restore(a, &out, &axes.a_axes);
                    assert_axes_restore(b, &out, &axes.b_axes);
                }
                None => assert!(
                    matches!(result, Err(BroadcastError::Incompatible { .. })),
                    "{a:?} vs {b:?} should not broadcast"
                ),
            }
        }
    }
}

#[test]
fn identical_shapes_need_no_reduction() {
    let shape = vec![ShapeDim::sym("batch"), ShapeDim::Known(7)];
    let axes = compute_broadcast_backward_axes(&shape, &shape, "n").unwrap();
    assert!(axes.a_axes.is_empty());
    assert!(axes.b_axes.is_empty());
}

#[test]
fn scalar_operand_reduces_every_axis() {
    let axes =
        compute_broadcast_backward_axes(&[], &[ShapeDim::sym("N"), ShapeDim::Known(5)], "n")
            .unwrap();
    assert_eq!(axes.a_axes, vec![0, 1]);
    assert!(axes.b_axes.is_empty());
}

#[test]
fn unit_extent_against_symbol_is_reduced() {
    let axes = compute_broadcast_backward_axes(
        &[ShapeDim::Known(1), ShapeDim::Known(4)],
        &[ShapeDim::sym("N"), ShapeDim::Known(4)],
        "n",
    )
    .unwrap();
    assert_eq!(axes.a_axes, vec![0]);
    assert!(axes.b_axes.is_empty());
}

#[test]
fn distinct_symbols_are_unresolved() {
    let err = compute_broadcast_backward_axes(&[ShapeDim::sym("N")], &[ShapeDim::sym("M")], "mul")
        .unwrap_err();
    match err {
        BroadcastError::Unresolved { node, axis, .. } => {
            assert_eq!(node, "mul");
            assert_eq!(axis, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
}
