//! Standalone pooling: max or average over strided windows.
//!
//! No weights, no scratch. Reduces `C×H×W` to `C×H'×W'` with
//! `H' = floor((H + 2*pad - pool) / stride) + 1`.

use crate::arena::{ActivationsArena, WeightsArena};
use crate::error::Fault;
use crate::math::{self, PoolGeometry};
use crate::tensor::Shape;
use super::{expect_activation, expect_shape, expect_single_batch, Layer, NodeIo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool2d {
    pub geometry: PoolGeometry,
}

impl Pool2d {
    pub const fn new(geometry: PoolGeometry) -> Self {
        Self { geometry }
    }
}

impl Layer for Pool2d {
    fn name(&self) -> &'static str {
        "pool2d"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape, Fault> {
        expect_single_batch(input)?;
        let (h, w) = self
            .geometry
            .output_hw(input.height, input.width)
            .ok_or(Fault::InvalidParameter("pool window larger than padded input"))?;
        Ok(Shape::chw(input.channels, h, w))
    }

    fn macc(&self, _input: &Shape, output: &Shape) -> u64 {
        (output.element_count() as u64).saturating_mul(self.geometry.window_len() as u64)
    }

    fn validate(&self, io: &NodeIo<'_>) -> Result<(), Fault> {
        let input = io.input(0)?;
        expect_activation(input)?;
        let output = io.output()?;
        expect_activation(output)?;
        expect_shape(output, self.output_shape(&input.shape)?)
    }

    fn forward(
        &self,
        io: &NodeIo<'_>,
        _weights: &WeightsArena<'_>,
        activations: &mut ActivationsArena<'_>,
    ) -> Result<(), Fault> {
        self.validate(io)?;
        let input = io.input(0)?;
        let (src, [dst]) = activations.views(input.data_handle(), [io.output()?.data_handle()])?;
        let shape = &input.shape;
        math::pool2d_f32(src, dst, shape.height, shape.width, shape.channels, &self.geometry)
    }
}
