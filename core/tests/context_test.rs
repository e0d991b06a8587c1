//! NetworkContext lifecycle: binding, configuration faults, the sticky
//! Faulted state, and small hand-built graphs.

mod common;

use nano_cnn_core::*;

fn fused_conv_graph() -> (Graph, TensorId) {
    let mut b = GraphBuilder::new("fused", 1);
    let x = b.input(Shape::chw(1, 4, 4)).unwrap();
    let conv = Conv2d::new(2, (3, 3))
        .with_padding((1, 1))
        .with_activation(Activation::Relu)
        .with_pool(PoolGeometry::new(PoolKind::Max, (2, 2), (2, 2)));
    let w = b.weights(Format::F32, conv.weight_shape(1)).unwrap();
    let bias = b.weights(Format::F32, Shape::vector(2)).unwrap();
    b.conv2d(x, conv, w, Some(bias)).unwrap();
    (b.build().unwrap(), bias)
}

// =============================================================================
// Binding
// =============================================================================

#[test]
fn test_init_is_idempotent() {
    common::init_logging();
    let graph = network::build().unwrap();
    let weights = common::weights_blob(&graph, 9);
    let mut activations = common::aligned_buffer(graph.activations_size());
    let mut ctx = NetworkContext::create(graph);

    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();
    let first = addresses(&ctx);
    assert!(first.iter().all(Option::is_some));

    let params = ctx.release().unwrap();
    assert_eq!(ctx.state(), NetworkState::Uninitialized);
    assert!(ctx.graph().tensors().iter().all(|t| !t.is_bound()));

    ctx.init(params).unwrap();
    let second = addresses(&ctx);
    assert_eq!(first, second);
    assert!(ctx.graph().nodes().all(|(_, n)| n.state() == NodeState::Ready));
}

#[test]
fn test_resolved_address_is_base_plus_offset() {
    let graph = network::build().unwrap();
    let weights = common::weights_blob(&graph, 9);
    let mut activations = common::aligned_buffer(graph.activations_size());
    let weights_base = weights.as_ptr() as usize;
    let activations_base = activations.as_ptr() as usize;

    let mut ctx = NetworkContext::create(graph);
    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();
    for t in ctx.graph().tensors() {
        let base = if t.buffer.is_const() {
            weights_base
        } else {
            activations_base
        };
        assert_eq!(t.resolved_address(), Some(base + t.offset()));
    }
}

fn addresses(ctx: &NetworkContext<'_, '_>) -> Vec<Option<usize>> {
    ctx.graph().tensors().iter().map(|t| t.resolved_address()).collect()
}

/// Init on a fresh context; the error and the state it leaves behind.
fn init_failure(graph: &Graph, params: NetworkParams<'_, '_>) -> (NanoError, NetworkState) {
    let mut ctx = NetworkContext::create(graph.clone());
    let err = ctx.init(params).unwrap_err();
    (err, ctx.state())
}

#[test]
fn test_init_rejects_bad_arenas() {
    common::init_logging();
    let graph = network::build().unwrap();
    let weights = common::weights_blob(&graph, 9);
    let mut activations = common::aligned_buffer(graph.activations_size());
    let mut small = common::aligned_buffer(1024);

    assert_eq!(
        init_failure(&graph, common::params(0xDEAD_BEEF, &weights, &mut activations)),
        (
            NanoError::SignatureMismatch {
                expected: network::MODEL_SIGNATURE,
                actual: 0xDEAD_BEEF,
            },
            NetworkState::Uninitialized
        )
    );
    assert_eq!(
        init_failure(&graph, common::params(network::MODEL_SIGNATURE, &weights, &mut [])).0,
        NanoError::NullBase {
            arena: ArenaKind::Activations
        }
    );
    assert_eq!(
        init_failure(&graph, common::params(network::MODEL_SIGNATURE, &[], &mut activations)).0,
        NanoError::NullBase {
            arena: ArenaKind::Weights
        }
    );
    assert_eq!(
        init_failure(&graph, common::params(network::MODEL_SIGNATURE, &weights, &mut small)),
        (
            NanoError::ArenaTooSmall {
                arena: ArenaKind::Activations,
                required: graph.activations_size(),
                available: 1024,
            },
            NetworkState::Uninitialized
        )
    );

    let mut ctx = NetworkContext::create(graph);
    assert_eq!(ctx.run_forward(&[0.0; 4096]), Err(NanoError::NotInitialized));
    assert_eq!(ctx.output(), Err(NanoError::NotInitialized));
    assert!(ctx.release().is_err());
}

#[test]
fn test_misaligned_arena_is_rejected() {
    let graph = network::build().unwrap();
    let weights = common::weights_blob(&graph, 9);
    let mut activations = common::aligned_buffer(graph.activations_size() + 4);
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut activations);
    let mut ctx = NetworkContext::create(graph);
    let err = ctx
        .init(NetworkParams {
            signature: network::MODEL_SIGNATURE,
            weights: bytemuck::cast_slice(&weights),
            activations: &mut bytes[1..],
        })
        .unwrap_err();
    assert_eq!(
        err,
        NanoError::Misaligned {
            arena: ArenaKind::Activations,
            align: 4
        }
    );
}

#[test]
fn test_wrong_input_length_is_rejected_before_running() {
    let graph = network::build().unwrap();
    let weights = common::weights_blob(&graph, 9);
    let mut activations = common::aligned_buffer(graph.activations_size());
    let mut ctx = NetworkContext::create(graph);
    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();

    assert_eq!(ctx.output(), Err(NanoError::NoOutput));
    assert_eq!(
        ctx.run_forward(&[0.5; 100]),
        Err(NanoError::InvalidInputLength {
            expected: 4096,
            actual: 100
        })
    );
    assert_eq!(ctx.state(), NetworkState::Ready);
    assert!(ctx.graph().nodes().all(|(_, n)| n.state() == NodeState::Ready));
}

#[test]
fn test_destroy_returns_caller_memory() {
    let graph = network::build().unwrap();
    let weights = common::weights_blob(&graph, 9);
    let mut activations = common::aligned_buffer(graph.activations_size());
    let base = activations.as_ptr() as usize;

    let mut ctx = NetworkContext::create(graph.clone());
    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();
    let params = ctx.destroy().unwrap();
    assert_eq!(params.activations.as_ptr() as usize, base);
    assert_eq!(params.signature, network::MODEL_SIGNATURE);

    assert!(NetworkContext::create(graph).destroy().is_none());
}

// =============================================================================
// Faults
// =============================================================================

#[test]
fn test_faulted_state_is_sticky() {
    common::init_logging();
    let graph = network::build().unwrap();
    let weights = common::weights_blob(&graph, 9);
    let mut activations = common::aligned_buffer(graph.activations_size());
    let mut ctx = NetworkContext::create(graph);
    ctx.init(common::params(network::MODEL_SIGNATURE, &weights, &mut activations))
        .unwrap();
    let image = common::test_image(7);
    let good = common::bits(ctx.run_forward(&image).unwrap());

    // corrupt the global-average-pool output shape
    let (_, pool) = ctx.graph().nodes().nth(3).unwrap();
    let pooled = pool.output;
    ctx.graph_mut().tensor_mut(pooled).unwrap().shape = Shape::chw(32, 1, 1);

    let err = ctx.run_forward(&image).unwrap_err();
    assert_eq!(
        err,
        NanoError::Node {
            node: 3,
            kind: "pool2d",
            fault: Fault::ShapeMismatch {
                expected: Shape::chw(64, 1, 1),
                actual: Shape::chw(32, 1, 1),
            },
        }
    );
    assert_eq!(ctx.state(), NetworkState::Faulted);
    let states: Vec<NodeState> = ctx.graph().nodes().map(|(_, n)| n.state()).collect();
    assert_eq!(states[..3], [NodeState::Executed; 3]);
    assert_eq!(states[3..], [NodeState::Ready; 3]);

    // later calls fail without computing, even after the shape is repaired
    ctx.graph_mut().tensor_mut(pooled).unwrap().shape = Shape::chw(64, 1, 1);
    assert_eq!(ctx.run_forward(&image), Err(NanoError::Faulted));
    assert_eq!(ctx.run_forward_in_place(), Err(NanoError::Faulted));
    assert_eq!(ctx.output(), Err(NanoError::Faulted));
    assert_eq!(ctx.input_mut().unwrap_err(), NanoError::Faulted);

    let params = ctx.release().unwrap();
    ctx.init(params).unwrap();
    assert_eq!(common::bits(ctx.run_forward(&image).unwrap()), good);
}

#[test]
fn test_zero_input_conv_outputs_rectified_bias() {
    common::init_logging();
    let (graph, bias) = fused_conv_graph();
    let mut weights = common::weights_blob(&graph, 3);
    let bias_offset = graph.tensor(bias).unwrap().offset();
    let mut activations = common::aligned_buffer(graph.activations_size());

    common::write_f32(&mut weights, bias_offset, &[0.5, -0.25]);
    {
        let mut ctx = NetworkContext::create(graph.clone());
        ctx.init(common::params(1, &weights, &mut activations)).unwrap();
        let out = ctx.run_forward(&[0.0; 16]).unwrap();
        // 2×2 positions, channel-last
        assert_eq!(out, [0.5, 0.0, 0.5, 0.0, 0.5, 0.0, 0.5, 0.0]);
    }

    common::write_f32(&mut weights, bias_offset, &[0.0, 0.0]);
    let mut ctx = NetworkContext::create(graph);
    ctx.init(common::params(1, &weights, &mut activations)).unwrap();
    let out = ctx.run_forward(&[0.0; 16]).unwrap();
    assert!(out.iter().all(|&v| v == 0.0));
}

// =============================================================================
// Weight formats
// =============================================================================

#[test]
fn test_lut4_dense_matches_decoded_f32() {
    let table: Vec<f32> = (0..16).map(|i| i as f32 * 0.25 - 1.0).collect();
    let indices = [3u8, 7, 0, 15, 1, 2, 9, 4];
    let decoded: Vec<f32> = indices.iter().map(|&i| table[i as usize]).collect();
    let packed: Vec<u8> = indices.chunks(2).map(|p| (p[0] << 4) | p[1]).collect();

    let build = |format: Format| {
        let mut b = GraphBuilder::new("dense", 2);
        let x = b.input(Shape::vector(4)).unwrap();
        let w = b.weights(format, Shape::new(2, 4, 1, 1)).unwrap();
        b.dense(x, Dense::new(2), w, None).unwrap();
        (b.build().unwrap(), w)
    };
    let input = [1.0, -2.0, 0.5, 3.0];

    let (lut_graph, w) = build(Format::Lut4F32);
    let mut lut_weights = common::aligned_buffer(lut_graph.weights_size());
    let offset = lut_graph.tensor(w).unwrap().offset();
    common::write_f32(&mut lut_weights, offset, &table);
    common::write_bytes(&mut lut_weights, offset + 64, &packed);

    let (f32_graph, w) = build(Format::F32);
    let mut f32_weights = common::aligned_buffer(f32_graph.weights_size());
    common::write_f32(&mut f32_weights, f32_graph.tensor(w).unwrap().offset(), &decoded);

    let mut outputs = Vec::new();
    for (graph, weights) in [(lut_graph, &lut_weights), (f32_graph, &f32_weights)] {
        let mut activations = common::aligned_buffer(graph.activations_size());
        let mut ctx = NetworkContext::create(graph);
        ctx.init(common::params(2, weights, &mut activations)).unwrap();
        outputs.push(ctx.run_forward(&input).unwrap().to_vec());
    }
    assert_eq!(outputs[0], outputs[1]);
    // row 0: -0.25, 0.75, -1.0, 2.75
    assert_eq!(outputs[0][0], -0.25 - 1.5 - 0.5 + 8.25);
}
