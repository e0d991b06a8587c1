//! Fused Conv2D: convolution → bias → activation → optional pooling.
//!
//! Weights `[out_c][kh][kw][in_c / groups]` and an optional bias live in the
//! weights arena. Scratch 0 is the receptive-field patch; scratch 1 is the
//! pooling tile, present only when a pool stage is fused.

use crate::arena::{ActivationsArena, WeightsArena};
use crate::error::Fault;
use crate::math::{self, Activation, ConvGeometry, PoolGeometry};
use crate::tensor::{ArenaKind, Format, Shape};
use super::{
    expect_activation, expect_scratch, expect_shape, expect_single_batch, expect_tensor, Layer,
    NodeIo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2d {
    pub out_channels: usize,
    /// (kh, kw)
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    pub padding: (usize, usize),
    pub groups: usize,
    pub activation: Activation,
    pub pool: Option<PoolGeometry>,
}

impl Conv2d {
    /// Stride 1, no padding, no dilation, one group, identity, no pooling.
    pub const fn new(out_channels: usize, kernel: (usize, usize)) -> Self {
        Self {
            out_channels,
            kernel,
            stride: (1, 1),
            dilation: (1, 1),
            padding: (0, 0),
            groups: 1,
            activation: Activation::Identity,
            pool: None,
        }
    }

    pub const fn with_stride(self, stride: (usize, usize)) -> Self {
        Self { stride, ..self }
    }

    pub const fn with_padding(self, padding: (usize, usize)) -> Self {
        Self { padding, ..self }
    }

    pub const fn with_dilation(self, dilation: (usize, usize)) -> Self {
        Self { dilation, ..self }
    }

    pub const fn with_groups(self, groups: usize) -> Self {
        Self { groups, ..self }
    }

    pub const fn with_activation(self, activation: Activation) -> Self {
        Self { activation, ..self }
    }

    pub const fn with_pool(self, pool: PoolGeometry) -> Self {
        Self {
            pool: Some(pool),
            ..self
        }
    }

    pub fn geometry(&self, input: &Shape) -> ConvGeometry {
        ConvGeometry {
            in_h: input.height,
            in_w: input.width,
            in_c: input.channels,
            out_c: self.out_channels,
            kernel: self.kernel,
            stride: self.stride,
            dilation: self.dilation,
            pad: self.padding,
            groups: self.groups,
        }
    }

    /// Shape of the filter tensor for an input with `in_channels` channels.
    pub fn weight_shape(&self, in_channels: usize) -> Shape {
        let per_group = if self.groups == 0 { 0 } else { in_channels / self.groups };
        Shape::new(self.out_channels, per_group, self.kernel.0, self.kernel.1)
    }

    /// Convolution output (before pooling).
    fn conv_hw(&self, input: &Shape) -> Result<(usize, usize), Fault> {
        expect_single_batch(input)?;
        if self.out_channels == 0 {
            return Err(Fault::InvalidParameter("conv2d needs at least one output channel"));
        }
        let groups = self.groups;
        if groups == 0 || input.channels % groups != 0 || self.out_channels % groups != 0 {
            return Err(Fault::InvalidParameter("groups must divide input and output channels"));
        }
        self.geometry(input)
            .output_hw()
            .ok_or(Fault::InvalidParameter("conv2d window larger than padded input"))
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn output_shape(&self, input: &Shape) -> Result<Shape, Fault> {
        let (h, w) = self.conv_hw(input)?;
        let (h, w) = match &self.pool {
            Some(pool) => pool
                .output_hw(h, w)
                .ok_or(Fault::InvalidParameter("pool window larger than conv output"))?,
            None => (h, w),
        };
        Ok(Shape::chw(self.out_channels, h, w))
    }

    fn scratch_elements(&self, input: &Shape) -> [usize; 2] {
        let Ok((_, conv_w)) = self.conv_hw(input) else {
            return [0, 0];
        };
        let patch = self.geometry(input).patch_len();
        let tile = match &self.pool {
            Some(pool) => pool.size.0.saturating_mul(conv_w).saturating_mul(self.out_channels),
            None => 0,
        };
        [patch, tile]
    }

    fn macc(&self, input: &Shape, _output: &Shape) -> u64 {
        match self.conv_hw(input) {
            Ok((h, w)) => (h as u64)
                .saturating_mul(w as u64)
                .saturating_mul(self.out_channels as u64)
                .saturating_mul(self.geometry(input).patch_len() as u64),
            Err(_) => 0,
        }
    }

    fn validate(&self, io: &NodeIo<'_>) -> Result<(), Fault> {
        let input = io.input(0)?;
        expect_activation(input)?;
        let output = io.output()?;
        expect_activation(output)?;
        expect_shape(output, self.output_shape(&input.shape)?)?;

        let filters = io.weight(0)?;
        expect_tensor(filters, Format::F32, ArenaKind::Weights)?;
        expect_shape(filters, self.weight_shape(input.shape.channels))?;
        if let Some(bias) = io.optional_weight(1)? {
            expect_tensor(bias, Format::F32, ArenaKind::Weights)?;
            expect_shape(bias, Shape::vector(self.out_channels))?;
        }

        let [patch, tile] = self.scratch_elements(&input.shape);
        expect_scratch(io.scratch(0)?, patch)?;
        if tile > 0 {
            expect_scratch(io.scratch(1)?, tile)?;
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
        let input = io.input(0)?;
        let output = io.output()?;
        let filters = weights.f32(io.weight(0)?.data_handle())?;
        let bias = match io.optional_weight(1)? {
            Some(bias) => Some(weights.f32(bias.data_handle())?),
            None => None,
        };
        let geometry = self.geometry(&input.shape);
        let patch = io.scratch(0)?.data_handle();

        match &self.pool {
            None => {
                let (src, [dst, patch]) =
                    activations.views(input.data_handle(), [output.data_handle(), patch])?;
                math::conv2d_f32(src, filters, bias, dst, patch, &geometry, self.activation)
            }
            Some(pool) => {
                let tile = io.scratch(1)?.data_handle();
                let (src, [dst, patch, tile]) =
                    activations.views(input.data_handle(), [output.data_handle(), patch, tile])?;
                let act = self.activation;
                math::conv2d_pool_f32(src, filters, bias, dst, patch, tile, &geometry, act, pool)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::PoolKind;

    fn fused() -> Conv2d {
        Conv2d::new(16, (3, 3))
            .with_padding((1, 1))
            .with_activation(Activation::Relu)
            .with_pool(PoolGeometry::new(PoolKind::Max, (2, 2), (2, 2)))
    }

    #[test]
    fn test_fused_output_shape_and_scratch() {
        let conv = fused();
        let input = Shape::chw(1, 64, 64);
        assert_eq!(conv.output_shape(&input).unwrap(), Shape::chw(16, 32, 32));
        assert_eq!(conv.scratch_elements(&input), [9, 2048]);
        assert_eq!(conv.weight_shape(1), Shape::new(16, 1, 3, 3));
        assert_eq!(conv.macc(&input, &Shape::chw(16, 32, 32)), 64 * 64 * 16 * 9);
    }

    #[test]
    fn test_plain_conv_has_no_tile() {
        let conv = Conv2d::new(8, (3, 3)).with_stride((2, 2));
        let input = Shape::chw(4, 9, 9);
        assert_eq!(conv.output_shape(&input).unwrap(), Shape::chw(8, 4, 4));
        assert_eq!(conv.scratch_elements(&input), [36, 0]);
    }

    #[test]
    fn test_rejects_bad_groups_and_batch() {
        let conv = Conv2d::new(6, (1, 1)).with_groups(4);
        assert!(matches!(
            conv.output_shape(&Shape::chw(8, 4, 4)),
            Err(Fault::InvalidParameter(_))
        ));
        assert!(matches!(
            fused().output_shape(&Shape::new(2, 1, 64, 64)),
            Err(Fault::InvalidParameter(_))
        ));
        assert!(matches!(
            Conv2d::new(1, (5, 5)).output_shape(&Shape::chw(1, 3, 3)),
            Err(Fault::InvalidParameter(_))
        ));
    }
}
