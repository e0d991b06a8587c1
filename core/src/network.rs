//! The compiled-in network: a 64×64 grayscale image in, 3 class
//! probabilities out.
//!
//! ```text
//! input 1×64×64
//!   → conv2d_0  3×3/1 pad 1, ReLU, max 2×2/2   → 16×32×32
//!   → conv2d_2  3×3/1 pad 1, ReLU, max 2×2/2   → 32×16×16
//!   → conv2d_4  3×3/1 pad 1, ReLU, max 2×2/2   → 64×8×8
//!   → pool_6    avg 8×8/8                       → 64×1×1
//!   → gemm_7    dense, LUT4 weights + f32 bias  → 3
//!   → nl_8      softmax                         → 3
//! ```
//!
//! Weights are declared in blob order, so the bump layout lands every
//! tensor at the offset the trained weights file expects.

use crate::error::NanoResult;
use crate::graph::{Graph, GraphBuilder};
use crate::layers::{Activation, Conv2d, Dense, Nonlinearity, PoolGeometry, PoolKind};
use crate::tensor::{Format, Shape, TensorId};

pub const MODEL_NAME: &str = "network";
pub const MODEL_SIGNATURE: u32 = 0x2771_5892;

pub const INPUT_SHAPE: Shape = Shape::chw(1, 64, 64);
pub const OUTPUT_CLASSES: usize = 3;

/// Size of the weights blob.
pub const WEIGHTS_SIZE: usize = 93_356;

const CONV_CHANNELS: [usize; 3] = [16, 32, 64];

fn conv_stage(
    b: &mut GraphBuilder,
    input: TensorId,
    in_channels: usize,
    out_channels: usize,
) -> NanoResult<TensorId> {
    let conv = Conv2d::new(out_channels, (3, 3))
        .with_padding((1, 1))
        .with_activation(Activation::Relu)
        .with_pool(PoolGeometry::new(PoolKind::Max, (2, 2), (2, 2)));
    let weights = b.weights(Format::F32, conv.weight_shape(in_channels))?;
    let bias = b.weights(Format::F32, Shape::vector(out_channels))?;
    b.conv2d(input, conv, weights, Some(bias))
}

/// Build and validate the network graph.
pub fn build() -> NanoResult<Graph> {
    let mut b = GraphBuilder::new(MODEL_NAME, MODEL_SIGNATURE);
    let mut x = b.input(INPUT_SHAPE)?;

    let mut channels = INPUT_SHAPE.channels;
    for out_channels in CONV_CHANNELS {
        x = conv_stage(&mut b, x, channels, out_channels)?;
        channels = out_channels;
    }

    x = b.pool(x, PoolGeometry::new(PoolKind::Avg, (8, 8), (8, 8)))?;

    let dense = Dense::new(OUTPUT_CLASSES);
    let weights = b.weights(Format::Lut4F32, dense.weight_shape(channels))?;
    let bias = b.weights(Format::F32, Shape::vector(OUTPUT_CLASSES))?;
    x = b.dense(x, dense, weights, Some(bias))?;

    b.nonlinearity(x, Nonlinearity::Softmax)?;
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_metadata() {
        let graph = build().unwrap();
        let info = graph.info();
        assert_eq!(info.name, "network");
        assert_eq!(info.signature, MODEL_SIGNATURE);
        assert_eq!(info.node_count, 6);
        assert_eq!(info.weights_size, WEIGHTS_SIZE);
        assert_eq!(info.input, INPUT_SHAPE);
        assert_eq!(info.output, Shape::vector(OUTPUT_CLASSES));
        // conv: 589824 + 4718592 + 4718592, avg pool 4096, dense 192, softmax 3
        assert_eq!(info.macc, 10_031_299);
    }
}
