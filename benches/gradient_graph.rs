use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mind_grad::autodiff::compute_broadcast_backward_axes;
use mind_grad::ir::{Graph, Node, NodeArg, ONNX_DOMAIN};
use mind_grad::types::{DType, ShapeDim, TensorType};
use mind_grad::{build_gradient_graph, GradientGraphConfiguration, GradientRegistry};

fn tensor(name: &str, shape: &[ShapeDim]) -> NodeArg {
    NodeArg::new(name, Some(TensorType::new(DType::F32, shape.to_vec())))
}

/// `layers` blocks of `relu(h * w_i + b_i)` with a broadcast bias.
fn mlp(layers: usize, batch: ShapeDim) -> Graph {
    let hidden = [batch, ShapeDim::Known(256)];
    let bias = [ShapeDim::Known(256)];
    let mut graph = Graph::new();
    graph.set_opset_version(ONNX_DOMAIN, 13);
    graph.add_input(tensor("h0", &hidden));

    for i in 0..layers {
        let h = format!("h{i}");
        let (w, b) = (format!("w{i}"), format!("b{i}"));
        let (mul, add, next) = (format!("mul{i}"), format!("add{i}"), format!("h{}", i + 1));
        graph
            .add_node(Node::new(
                mul.clone(),
                "Mul",
                vec![tensor(&h, &hidden), tensor(&w, &bias)],
                vec![tensor(&mul, &hidden)],
            ))
            .expect("mul");
        graph
            .add_node(Node::new(
                add.clone(),
                "Add",
                vec![tensor(&mul, &hidden), tensor(&b, &bias)],
                vec![tensor(&add, &hidden)],
            ))
            .expect("add");
        graph
            .add_node(Node::new(
                format!("relu{i}"),
                "Relu",
                vec![tensor(&add, &hidden)],
                vec![tensor(&next, &hidden)],
            ))
            .expect("relu");
    }
    graph
}

fn weights(layers: usize) -> Vec<String> {
    (0..layers)
        .flat_map(|i| [format!("w{i}"), format!("b{i}")])
        .collect()
}

fn bench_gradient_graph(c: &mut Criterion) {
    let registry = GradientRegistry::with_default_rules();
    let config = GradientGraphConfiguration {
        seed_with_one: true,
        ..Default::default()
    };
    let mut group = c.benchmark_group("gradient_graph");

    for (name, batch) in [
        ("static", ShapeDim::Known(128)),
        ("symbolic", ShapeDim::sym("batch")),
    ] {
        for layers in [2usize, 16] {
            let graph = mlp(layers, batch.clone());
            let loss = format!("h{layers}");
            let params = weights(layers);
            let x: Vec<&str> = params.iter().map(String::as_str).collect();

            group.bench_with_input(BenchmarkId::new(name, layers), &graph, |b, graph| {
                b.iter(|| {
                    let mut graph = graph.clone();
                    build_gradient_graph(
                        black_box(&mut graph),
                        &[loss.as_str()],
                        &x,
                        &registry,
                        &config,
                    )
                    .expect("gradient graph failed")
                });
            });
        }
    }

    group.finish();
}

fn bench_broadcast_axes(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_axes");
    let known = |dims: &[usize]| dims.iter().map(|&d| ShapeDim::Known(d)).collect::<Vec<_>>();

    let cases = [
        ("bias", known(&[128, 256]), known(&[256])),
        ("outer", known(&[64, 1, 32]), known(&[1, 16, 32])),
        (
            "symbolic",
            vec![ShapeDim::sym("batch"), ShapeDim::sym("seq"), ShapeDim::Known(768)],
            vec![ShapeDim::Known(1), ShapeDim::sym("seq"), ShapeDim::Known(768)],
        ),
    ];
    for (name, a, b) in &cases {
        group.bench_with_input(BenchmarkId::new("static", name), &(a, b), |bench, (a, b)| {
            bench.iter(|| {
                compute_broadcast_backward_axes(black_box(a), black_box(b), "bench")
                    .expect("broadcast axes failed")
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_gradient_graph, bench_broadcast_axes);
criterion_main!(benches);
