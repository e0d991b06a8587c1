//! # nano-cnn-core: static CNN inference for microcontrollers
//!
//! A `no_std` engine that runs a fixed, pre-trained convolutional network
//! out of two caller-supplied arenas, with no heap and no graph
//! interpretation at run time.
//!
//! ## Architecture
//!
//! - **Tensors**: shape/stride/format metadata pointing at fixed arena offsets
//! - **Arenas**: a read-only weights region and a read-write activations
//!   region; activation offsets come from a liveness planner, so tensors
//!   that are never alive together share bytes
//! - **Layer nodes**: fused conv (+bias, activation, pooling), pooling, dense
//!   (f32 or LUT4 weights), nonlinearity, linked into one execution chain
//! - **Executor**: walks the chain once per inference, stopping at the first
//!   failing node
//! - **Kernels**: f32 routines in [`math`]
//!
//! ## Usage
//!
//! ```ignore
//! use nano_cnn_core::*;
//!
//! let graph = network::build()?;
//! let info = graph.info();
//!
//! static WEIGHTS: &[u8] = include_bytes!("network_data.bin");
//! let mut activations = [0f32; 32 * 1024];
//!
//! let mut ctx = NetworkContext::create(graph);
//! ctx.init(NetworkParams {
//!     signature: network::MODEL_SIGNATURE,
//!     weights: WEIGHTS,
//!     activations: bytemuck::cast_slice_mut(&mut activations),
//! })?;
//! let probabilities = ctx.run_forward(&image)?;
//! ```

#![no_std]

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod arena;
pub mod codec;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod layers;
pub mod math;
pub mod network;
pub mod planner;
pub mod table;
pub mod tensor;

// Re-export primary types
pub use arena::{ActivationsArena, ArenaLayout, Handle, WeightsArena, ARENA_ALIGN};
pub use codec::{F32Weights, Lut4Weights, WeightCodec};
pub use context::{NetworkConfig, NetworkContext, NetworkParams, NetworkState};
pub use error::{Fault, NanoError, NanoResult};
pub use graph::{Graph, GraphBuilder, ModelInfo, MAX_NODES, MAX_TENSORS};
pub use layers::{
    Activation, Conv2d, Dense, Layer, LayerKind, LayerNode, Nonlinearity, NodeId, NodeState,
    Pool2d, PoolGeometry, PoolKind,
};
pub use math::{
    argmax_f32, conv2d_f32, conv2d_pool_f32, conv_output_dim, dense_f32, pool2d_f32,
    pool_output_dim, relu_f32, softmax_f32,
};
pub use planner::{plan_offsets, LiveInterval};
pub use tensor::{ArenaKind, DataBuffer, Format, Shape, Strides, TensorDescriptor, TensorId};
