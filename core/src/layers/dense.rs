//! Dense (fully-connected) layer over the flattened input.
//!
//! Weights `[out][in]` are either plain f32 or LUT4-packed. The codec is
//! chosen once per forward pass from the tensor format; the kernel itself
//! is generic over it.

use crate::arena::{ActivationsArena, WeightsArena};
use crate::codec::{F32Weights, Lut4Weights};
use crate::error::Fault;
use crate::math;
use crate::tensor::{ArenaKind, Format, Shape};
use super::{expect_activation, expect_shape, expect_tensor, Layer, NodeIo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dense {
    pub out_features: usize,
}

impl Dense {
    pub const fn new(out_features: usize) -> Self {
        Self { out_features }
    }

    pub fn weight_shape(&self, in_features: usize) -> Shape {
        Shape::new(self.out_features, in_features, 1, 1)
    }
}

impl Layer for Dense {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape, Fault> {
        if self.out_features == 0 || input.element_count() == 0 {
            return Err(Fault::InvalidParameter("dense needs non-empty input and output"));
        }
        Ok(Shape::vector(self.out_features))
    }

    fn macc(&self, input: &Shape, _output: &Shape) -> u64 {
        (input.element_count() as u64).saturating_mul(self.out_features as u64)
    }

    fn validate(&self, io: &NodeIo<'_>) -> Result<(), Fault> {
        let input = io.input(0)?;
        expect_activation(input)?;
        let output = io.output()?;
        expect_activation(output)?;
        expect_shape(output, self.output_shape(&input.shape)?)?;

        let weights = io.weight(0)?;
        // either format decodes
        expect_tensor(weights, weights.format, ArenaKind::Weights)?;
        expect_shape(weights, self.weight_shape(input.element_count()))?;
        if let Some(bias) = io.optional_weight(1)? {
            expect_tensor(bias, Format::F32, ArenaKind::Weights)?;
            expect_shape(bias, Shape::vector(self.out_features))?;
        }
        Ok(())
    }

    fn forward(
        &self,
        io: &NodeIo<'_>,
        weights: &WeightsArena<'_>,
        activations: &mut ActivationsArena<'_>,
    ) -> Result<(), Fault> {
        self.validate(io)?;
        let matrix = io.weight(0)?;
        let bias = match io.optional_weight(1)? {
            Some(bias) => Some(weights.f32(bias.data_handle())?),
            None => None,
        };
        let (src, [dst]) =
            activations.views(io.input(0)?.data_handle(), [io.output()?.data_handle()])?;

        match matrix.format {
            Format::F32 => {
                let values = weights.f32(matrix.data_handle())?;
                math::dense_f32(src, &F32Weights::new(values), bias, dst)
            }
            Format::Lut4F32 => {
                let (table, packed) = weights.lut4(matrix.data_handle())?;
                let codec = Lut4Weights::new(table, packed, matrix.element_count()).ok_or(
                    Fault::BufferTooSmall {
                        required: matrix.byte_size(),
                        available: matrix.buffer.handle.len(),
                    },
                )?;
                math::dense_f32(src, &codec, bias, dst)
            }
        }
    }
}
