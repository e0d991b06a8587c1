//! Standalone nonlinearities: softmax over the channel axis, ReLU.

use crate::arena::{ActivationsArena, WeightsArena};
use crate::error::Fault;
use crate::math;
use crate::tensor::Shape;
use super::{expect_activation, expect_shape, Layer, NodeIo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nonlinearity {
    /// Normalized exponentials over the channels at each position.
    Softmax,
    Relu,
}

impl Layer for Nonlinearity {
    fn name(&self) -> &'static str {
        match self {
            Nonlinearity::Softmax => "softmax",
            Nonlinearity::Relu => "relu",
        }
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape, Fault> {
        Ok(*input)
    }

    fn macc(&self, input: &Shape, _output: &Shape) -> u64 {
        input.element_count() as u64
    }

    fn validate(&self, io: &NodeIo<'_>) -> Result<(), Fault> {
        let input = io.input(0)?;
        expect_activation(input)?;
        let output = io.output()?;
        expect_activation(output)?;
        expect_shape(output, input.shape)
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
        match self {
            Nonlinearity::Softmax => math::softmax_f32(src, dst, input.shape.channels),
            Nonlinearity::Relu => {
                dst.copy_from_slice(src);
                math::relu_f32(dst);
                Ok(())
            }
        }
    }
}
