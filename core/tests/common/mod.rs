//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use nano_cnn_core::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `len` values uniform in `[-scale, scale)`.
pub fn random_vec(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-scale..scale)).collect()
}

/// Zeroed, f32-aligned storage for at least `bytes` bytes.
pub fn aligned_buffer(bytes: usize) -> Vec<f32> {
    vec![0.0; bytes.div_ceil(4)]
}

/// Overwrite `bytes.len()` bytes of an arena at byte `offset`.
pub fn write_bytes(arena: &mut [f32], offset: usize, bytes: &[u8]) {
    let view: &mut [u8] = bytemuck::cast_slice_mut(arena);
    view[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Overwrite floats of an arena starting at byte `offset`.
pub fn write_f32(arena: &mut [f32], offset: usize, values: &[f32]) {
    write_bytes(arena, offset, bytemuck::cast_slice(values));
}

/// Weights blob for `graph` filled with reproducible values.
///
/// F32 tensors get uniform values scaled by `1/sqrt(fan_in)`; LUT4 tensors
/// get an evenly spaced table and random indices.
pub fn weights_blob(graph: &Graph, seed: u64) -> Vec<f32> {
    let mut words = aligned_buffer(graph.weights_size());
    let mut rng = seeded_rng(seed);
    for t in graph.tensors().iter().filter(|t| t.buffer.is_const()) {
        match t.format {
            Format::F32 => {
                let fan_in = t.shape.channels * t.shape.height * t.shape.width;
                let scale = 1.0 / (fan_in as f32).sqrt();
                let values = random_vec(&mut rng, t.element_count(), scale);
                write_f32(&mut words, t.offset(), &values);
            }
            Format::Lut4F32 => {
                let table: Vec<f32> = (0..16).map(|i| (i as f32 - 7.5) / 16.0).collect();
                write_f32(&mut words, t.offset(), &table);
                let packed: Vec<u8> = (0..t.element_count().div_ceil(2))
                    .map(|_| rng.gen::<u8>())
                    .collect();
                write_bytes(&mut words, t.offset() + 64, &packed);
            }
        }
    }
    words
}

pub fn params<'w, 'a>(
    signature: u32,
    weights: &'w [f32],
    activations: &'a mut [f32],
) -> NetworkParams<'w, 'a> {
    NetworkParams {
        signature,
        weights: bytemuck::cast_slice(weights),
        activations: bytemuck::cast_slice_mut(activations),
    }
}

/// A deterministic 64×64 test image in `[0, 1)`.
pub fn test_image(seed: u64) -> Vec<f32> {
    let mut rng = seeded_rng(seed);
    (0..network::INPUT_SHAPE.element_count())
        .map(|_| rng.gen_range(0.0..1.0))
        .collect()
}

pub fn bits(values: &[f32]) -> Vec<u32> {
    values.iter().map(|v| v.to_bits()).collect()
}
