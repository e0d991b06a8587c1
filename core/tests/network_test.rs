//! Integration tests for the compiled-in network: layout, end-to-end
//! inference, determinism, concurrency and the graph table.

mod common;

use approx::assert_abs_diff_eq;
use nano_cnn_core::*;

fn setup() -> (Graph, Vec<f32>) {
    common::init_logging();
    let graph = network::build().unwrap();
    let weights = common::weights_blob(&graph, 0x5EED);
    (graph, weights)
}

// =============================================================================
// Static layout
// =============================================================================

#[test]
fn test_weights_offsets_match_blob_layout() {
    let (graph, _) = setup();
    let offsets: Vec<usize> = graph
        .tensors()
        .iter()
        .filter(|t| t.buffer.is_const())
        .map(|t| t.offset())
        .collect();
    // conv0 w/b, conv1 w/b, conv2 w/b, dense LUT4, dense bias
    assert_eq!(offsets, [0, 576, 640, 19072, 19200, 92928, 93184, 93344]);
    assert_eq!(graph.weights_size(), network::WEIGHTS_SIZE);

    let scratch: Vec<usize> = graph
        .nodes()
        .flat_map(|(_, node)| node.scratch.as_slice().to_vec())
        .map(|id| graph.tensor(id).unwrap().element_count())
        .collect();
    assert_eq!(scratch, [9, 2048, 144, 2048, 288, 2048]);
}

#[test]
fn test_every_tensor_lies_within_its_arena() {
    let (graph, _) = setup();
    for t in graph.tensors() {
        let limit = match t.buffer.arena {
            ArenaKind::Weights => graph.weights_size(),
            ArenaKind::Activations => graph.activations_size(),
        };
        assert!(t.offset() + t.byte_size() <= limit, "{:?}", t);
    }
}

#[test]
fn test_activation_lifetimes_share_bytes() {
    let (graph, _) = setup();
    let total: usize = graph
        .tensors()
        .iter()
        .filter(|t| !t.buffer.is_const())
        .map(|t| t.byte_size())
        .sum();
    // the peak (conv2d_2: its input, output, patch and tile) is a lower bound
    assert!(graph.activations_size() >= 65536 + 32768 + 576 + 8192);
    assert!(graph.activations_size() < total);
}

#[test]
fn test_pool_shapes_follow_formula() {
    let (graph, _) = setup();
    let mut checked = 0;
    for (_, node) in graph.nodes() {
        let input = graph.tensor(node.inputs.get(0).unwrap()).unwrap().shape;
        let output = graph.tensor(node.output).unwrap().shape;
        let (pool, conv_hw) = match node.layer {
            LayerKind::Pool(p) => (p.geometry, (input.height, input.width)),
            LayerKind::Conv2d(c) => match c.pool {
                Some(pool) => {
                    let (kh, kw) = c.kernel;
                    let (sh, sw) = c.stride;
                    let h = conv_output_dim(input.height, kh, sh, c.padding.0, c.dilation.0);
                    let w = conv_output_dim(input.width, kw, sw, c.padding.1, c.dilation.1);
                    (pool, (h.unwrap(), w.unwrap()))
                }
                None => continue,
            },
            _ => continue,
        };
        let expect = |dim: usize, k: usize, s: usize, p: usize| (dim + 2 * p - k) / s + 1;
        assert_eq!(output.height, expect(conv_hw.0, pool.size.0, pool.stride.0, pool.pad.0));
        assert_eq!(output.width, expect(conv_hw.1, pool.size.1, pool.stride.1, pool.pad.1));
        checked += 1;
    }
    assert_eq!(checked, 4);
}

// =============================================================================
// Inference
// =============================================================================

#[test]
fn test_uniform_image_gives_probabilities() {
    let (graph, weights) = setup();
    let mut activations = common::aligned_buffer(graph.activations_size());
    let mut ctx = NetworkContext::create(graph);
    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();

    let image = vec![0.5f32; 64 * 64];
    let probs = ctx.run_forward(&image).unwrap();
    assert_eq!(probs.len(), network::OUTPUT_CLASSES);
    for &p in probs {
        assert!((0.0..=1.0).contains(&p));
    }
    assert_abs_diff_eq!(probs.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
    assert_eq!(ctx.state(), NetworkState::Ready);
}

#[test]
fn test_run_forward_is_deterministic() {
    let (graph, weights) = setup();
    let mut activations = common::aligned_buffer(graph.activations_size());
    let mut ctx = NetworkContext::create(graph);
    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();

    let image = common::test_image(1);
    let first = common::bits(ctx.run_forward(&image).unwrap());
    // something different in between
    ctx.run_forward(&common::test_image(2)).unwrap();
    let second = common::bits(ctx.run_forward(&image).unwrap());
    assert_eq!(first, second);
}

#[test]
fn test_copy_and_alias_inputs_agree() {
    let (graph, weights) = setup();
    let mut activations = common::aligned_buffer(graph.activations_size());
    let mut ctx = NetworkContext::create(graph);
    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();

    let image = common::test_image(3);
    let copied = common::bits(ctx.run_forward(&image).unwrap());

    ctx.input_mut().unwrap().copy_from_slice(&image);
    let aliased = common::bits(ctx.run_forward_in_place().unwrap());
    assert_eq!(copied, aliased);
}

#[test]
fn test_predict_is_argmax_of_output() {
    let (graph, weights) = setup();
    let mut activations = common::aligned_buffer(graph.activations_size());
    let mut ctx = NetworkContext::create(graph);
    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();

    let image = common::test_image(4);
    let class = ctx.predict(&image).unwrap();
    let probs = ctx.output().unwrap();
    assert!(class < network::OUTPUT_CLASSES);
    assert!(probs.iter().all(|&p| p <= probs[class]));
}

#[test]
fn test_independent_contexts_run_in_parallel() {
    let (graph, weights) = setup();
    let images = [common::test_image(10), common::test_image(11)];

    // sequential reference
    let mut expected = Vec::new();
    {
        let mut activations = common::aligned_buffer(graph.activations_size());
        let mut ctx = NetworkContext::create(graph.clone());
        ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
            .unwrap();
        for image in &images {
            expected.push(common::bits(ctx.run_forward(image).unwrap()));
        }
    }

    let results: Vec<Vec<u32>> = std::thread::scope(|s| {
        let handles: Vec<_> = images
            .iter()
            .map(|image| {
                let graph = graph.clone();
                let weights = &weights;
                s.spawn(move || {
                    let mut activations = common::aligned_buffer(graph.activations_size());
                    let mut ctx = NetworkContext::create(graph);
                    ctx.init(common::params(network::MODEL_SIGNATURE, weights, &mut activations))
                        .unwrap();
                    let mut last = Vec::new();
                    for _ in 0..4 {
                        last = common::bits(ctx.run_forward(image).unwrap());
                    }
                    last
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results, expected);
}

#[test]
fn test_check_numerics_reports_first_bad_node() {
    let (graph, weights) = setup();
    let mut activations = common::aligned_buffer(graph.activations_size());
    let config = NetworkConfig { check_numerics: true };
    let mut ctx = NetworkContext::with_config(graph, config);
    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();

    ctx.run_forward(&common::test_image(5)).unwrap();

    let poisoned = vec![f32::NAN; 64 * 64];
    let err = ctx.run_forward(&poisoned).unwrap_err();
    assert_eq!(
        err,
        NanoError::Node {
            node: 0,
            kind: "conv2d",
            fault: Fault::NonFinite { index: 0 },
        }
    );
    assert_eq!(ctx.state(), NetworkState::Faulted);
}

// =============================================================================
// Graph table
// =============================================================================

#[test]
fn test_table_round_trip_runs_identically() {
    let (graph, weights) = setup();
    let mut table = vec![0u8; graph.table_len()];
    let written = graph.write_table(&mut table).unwrap();
    assert_eq!(written, table.len());

    let decoded = Graph::from_table(&table, network::MODEL_NAME).unwrap();
    assert_eq!(decoded, graph);

    let image = common::test_image(6);
    let mut outputs = Vec::new();
    for g in [graph, decoded] {
        let mut activations = common::aligned_buffer(g.activations_size());
        let mut ctx = NetworkContext::create(g);
        ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
            .unwrap();
        outputs.push(common::bits(ctx.run_forward(&image).unwrap()));
    }
    assert_eq!(outputs[0], outputs[1]);
}
