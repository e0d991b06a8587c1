//! f32 kernel library: convolution (plain and fused with pooling), pooling,
//! dense, and the nonlinearities.
//!
//! All tensors are channel-last and packed: element `(y, x, c)` of an
//! `H×W×C` map lives at `(y * W + x) * C + c`. Filters are stored
//! `[out_c][kh][kw][in_c / groups]`, dense weights `[out][in]`.
//!
//! Kernels write only into the slices they are given and check every
//! length up front. Scratch slices are caller-provided: the patch scratch
//! holds one receptive field (im2col for a single output position), the
//! tile scratch holds the handful of convolution rows one pooling window
//! needs. No kernel allocates.

use crate::codec::WeightCodec;
use crate::error::Fault;

/// Pointwise nonlinearity applied by the fused convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Identity,
    Relu,
}

impl Activation {
    #[inline(always)]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Relu => {
                if x < 0.0 {
                    0.0
                } else {
                    x
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolKind {
    #[default]
    Max,
    Avg,
}

/// Output length of a sliding window over one dimension:
/// `floor((input + 2*pad - dilation*(kernel-1) - 1) / stride) + 1`.
///
/// `None` for a zero kernel or stride, a window wider than the padded
/// input, or sizes that overflow `usize`.
pub const fn conv_output_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
    dilation: usize,
) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let span = match dilation.checked_mul(kernel - 1) {
        Some(reach) if reach < usize::MAX => reach + 1,
        _ => return None,
    };
    let padded = match pad.checked_mul(2) {
        Some(both) => match input.checked_add(both) {
            Some(padded) => padded,
            None => return None,
        },
        None => return None,
    };
    if padded < span {
        return None;
    }
    Some((padded - span) / stride + 1)
}

/// `floor((input + 2*pad - pool) / stride) + 1`.
pub const fn pool_output_dim(
    input: usize,
    pool: usize,
    stride: usize,
    pad: usize,
) -> Option<usize> {
    conv_output_dim(input, pool, stride, pad, 1)
}

/// Everything a convolution kernel needs to know about its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_h: usize,
    pub in_w: usize,
    pub in_c: usize,
    pub out_c: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub dilation: (usize, usize),
    pub pad: (usize, usize),
    pub groups: usize,
}

impl ConvGeometry {
    /// Spatial size of the convolution output (before any fused pooling).
    pub const fn output_hw(&self) -> Option<(usize, usize)> {
        let (kh, kw) = self.kernel;
        let h = conv_output_dim(self.in_h, kh, self.stride.0, self.pad.0, self.dilation.0);
        let w = conv_output_dim(self.in_w, kw, self.stride.1, self.pad.1, self.dilation.1);
        match (h, w) {
            (Some(h), Some(w)) => Some((h, w)),
            _ => None,
        }
    }

    /// Elements in one receptive field of one group, saturating.
    pub const fn patch_len(&self) -> usize {
        let per_group = if self.groups == 0 { 0 } else { self.in_c / self.groups };
        self.kernel.0.saturating_mul(self.kernel.1).saturating_mul(per_group)
    }

    pub const fn filter_count(&self) -> usize {
        self.out_c.saturating_mul(self.patch_len())
    }
}

/// Pooling window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub kind: PoolKind,
    pub size: (usize, usize),
    pub stride: (usize, usize),
    pub pad: (usize, usize),
}

impl PoolGeometry {
    /// Unpadded window.
    pub const fn new(kind: PoolKind, size: (usize, usize), stride: (usize, usize)) -> Self {
        Self {
            kind,
            size,
            stride,
            pad: (0, 0),
        }
    }

    pub const fn with_padding(self, pad: (usize, usize)) -> Self {
        Self { pad, ..self }
    }

    pub const fn window_len(&self) -> usize {
        self.size.0.saturating_mul(self.size.1)
    }

    pub const fn output_hw(&self, in_h: usize, in_w: usize) -> Option<(usize, usize)> {
        let h = pool_output_dim(in_h, self.size.0, self.stride.0, self.pad.0);
        let w = pool_output_dim(in_w, self.size.1, self.stride.1, self.pad.1);
        match (h, w) {
            (Some(h), Some(w)) => Some((h, w)),
            _ => None,
        }
    }
}

#[inline(always)]
fn need(len: usize, required: usize) -> Result<(), Fault> {
    if len < required {
        return Err(Fault::BufferTooSmall {
            required: required.saturating_mul(4),
            available: len.saturating_mul(4),
        });
    }
    Ok(())
}

#[inline(always)]
fn window_start(pos: usize, stride: usize, pad: usize) -> isize {
    (pos * stride) as isize - pad as isize
}

fn check_conv_operands(
    input: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    patch: &[f32],
    g: &ConvGeometry,
) -> Result<(usize, usize), Fault> {
    if g.in_c == 0 || g.out_c == 0 {
        return Err(Fault::InvalidParameter("convolution needs input and output channels"));
    }
    if g.groups == 0 || g.in_c % g.groups != 0 || g.out_c % g.groups != 0 {
        return Err(Fault::UnsupportedFormat);
    }
    let (out_h, out_w) = g.output_hw().ok_or(Fault::UnsupportedFormat)?;
    need(input.len(), g.in_h.saturating_mul(g.in_w).saturating_mul(g.in_c))?;
    need(weights.len(), g.filter_count())?;
    if let Some(bias) = bias {
        need(bias.len(), g.out_c)?;
    }
    need(patch.len(), g.patch_len())?;
    Ok((out_h, out_w))
}

/// One row `oy` of the convolution output, bias and activation included.
///
/// `row` receives `out_w * out_c` values.
#[allow(clippy::too_many_arguments)]
fn conv2d_row(
    input: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    row: &mut [f32],
    patch: &mut [f32],
    g: &ConvGeometry,
    out_w: usize,
    oy: usize,
    act: Activation,
) {
    let icpg = g.in_c / g.groups;
    let ocpg = g.out_c / g.groups;
    let flen = g.patch_len();
    let (kh, kw) = g.kernel;
    let iy0 = window_start(oy, g.stride.0, g.pad.0);

    for ox in 0..out_w {
        let ix0 = window_start(ox, g.stride.1, g.pad.1);
        for group in 0..g.groups {
            // Gather the receptive field; zero-fill outside the input.
            let mut p = 0;
            for ky in 0..kh {
                let iy = iy0 + (ky * g.dilation.0) as isize;
                for kx in 0..kw {
                    let ix = ix0 + (kx * g.dilation.1) as isize;
                    let dst = &mut patch[p..p + icpg];
                    if iy >= 0 && iy < g.in_h as isize && ix >= 0 && ix < g.in_w as isize {
                        let base = (iy as usize * g.in_w + ix as usize) * g.in_c + group * icpg;
                        dst.copy_from_slice(&input[base..base + icpg]);
                    } else {
                        dst.fill(0.0);
                    }
                    p += icpg;
                }
            }

            let field = &patch[..flen];
            for oc in group * ocpg..(group + 1) * ocpg {
                let filter = &weights[oc * flen..(oc + 1) * flen];
                let mut acc = 0.0f32;
                for (w, x) in filter.iter().zip(field) {
                    acc += w * x;
                }
                if let Some(bias) = bias {
                    acc += bias[oc];
                }
                row[ox * g.out_c + oc] = act.apply(acc);
            }
        }
    }
}

/// Direct convolution with zero padding, stride, dilation and groups,
/// followed by bias-add and `act`.
pub fn conv2d_f32(
    input: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    output: &mut [f32],
    patch: &mut [f32],
    g: &ConvGeometry,
    act: Activation,
) -> Result<(), Fault> {
    let (out_h, out_w) = check_conv_operands(input, weights, bias, patch, g)?;
    let row_len = out_w * g.out_c;
    need(output.len(), out_h * row_len)?;

    for (oy, row) in output.chunks_exact_mut(row_len).take(out_h).enumerate() {
        conv2d_row(input, weights, bias, row, patch, g, out_w, oy, act);
    }
    Ok(())
}

/// Reduce one pooled output row.
///
/// `row_base(k)` gives the start of source row `k` of the window inside
/// `src`, or `None` when that row falls in the padding. Callers reject
/// `channels == 0` before getting here.
fn pool_row<F>(
    src: &[f32],
    row_base: F,
    src_w: usize,
    channels: usize,
    pool: &PoolGeometry,
    out_row: &mut [f32],
) where
    F: Fn(usize) -> Option<usize>,
{
    let out_w = out_row.len() / channels;
    for px in 0..out_w {
        let acc = &mut out_row[px * channels..(px + 1) * channels];
        let init = match pool.kind {
            PoolKind::Max => f32::NEG_INFINITY,
            PoolKind::Avg => 0.0,
        };
        acc.fill(init);

        let x0 = window_start(px, pool.stride.1, pool.pad.1);
        let mut count = 0usize;
        for k in 0..pool.size.0 {
            let Some(base) = row_base(k) else { continue };
            for j in 0..pool.size.1 {
                let x = x0 + j as isize;
                if x < 0 || x >= src_w as isize {
                    continue;
                }
                let start = base + x as usize * channels;
                let pixel = &src[start..start + channels];
                match pool.kind {
                    PoolKind::Max => {
                        for (a, &v) in acc.iter_mut().zip(pixel) {
                            if v > *a {
                                *a = v;
                            }
                        }
                    }
                    PoolKind::Avg => {
                        for (a, &v) in acc.iter_mut().zip(pixel) {
                            *a += v;
                        }
                    }
                }
                count += 1;
            }
        }

        if count == 0 {
            acc.fill(0.0);
        } else if pool.kind == PoolKind::Avg {
            let n = count as f32;
            for a in acc.iter_mut() {
                *a /= n;
            }
        }
    }
}

/// Fused convolution → bias → activation → pooling.
///
/// The full-resolution activation is never materialized: for each pooled
/// row, the convolution rows its window covers are computed into `tile`
/// (`pool.size.0` rows of `conv_w * out_c`) and reduced straight into
/// `output`. Overlapping windows recompute their shared rows.
#[allow(clippy::too_many_arguments)]
pub fn conv2d_pool_f32(
    input: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    output: &mut [f32],
    patch: &mut [f32],
    tile: &mut [f32],
    g: &ConvGeometry,
    act: Activation,
    pool: &PoolGeometry,
) -> Result<(), Fault> {
    let (conv_h, conv_w) = check_conv_operands(input, weights, bias, patch, g)?;
    let (out_h, out_w) = pool.output_hw(conv_h, conv_w).ok_or(Fault::UnsupportedFormat)?;
    let row_len = conv_w * g.out_c;
    need(tile.len(), pool.size.0 * row_len)?;
    let out_row_len = out_w * g.out_c;
    need(output.len(), out_h * out_row_len)?;

    for py in 0..out_h {
        let y0 = window_start(py, pool.stride.0, pool.pad.0);
        let valid = |k: usize| {
            let y = y0 + k as isize;
            y >= 0 && y < conv_h as isize
        };

        for k in 0..pool.size.0 {
            if valid(k) {
                let row = &mut tile[k * row_len..(k + 1) * row_len];
                let y = (y0 + k as isize) as usize;
                conv2d_row(input, weights, bias, row, patch, g, conv_w, y, act);
            }
        }

        let out_row = &mut output[py * out_row_len..(py + 1) * out_row_len];
        pool_row(
            tile,
            |k| if valid(k) { Some(k * row_len) } else { None },
            conv_w,
            g.out_c,
            pool,
            out_row,
        );
    }
    Ok(())
}

/// Standalone max/avg pooling over an `in_h × in_w × channels` map.
pub fn pool2d_f32(
    input: &[f32],
    output: &mut [f32],
    in_h: usize,
    in_w: usize,
    channels: usize,
    pool: &PoolGeometry,
) -> Result<(), Fault> {
    if channels == 0 {
        return Err(Fault::InvalidParameter("pooling needs at least one channel"));
    }
    let (out_h, out_w) = pool.output_hw(in_h, in_w).ok_or(Fault::UnsupportedFormat)?;
    need(input.len(), in_h.saturating_mul(in_w).saturating_mul(channels))?;
    let out_row_len = out_w * channels;
    need(output.len(), out_h * out_row_len)?;

    let row_len = in_w * channels;
    for py in 0..out_h {
        let y0 = window_start(py, pool.stride.0, pool.pad.0);
        let out_row = &mut output[py * out_row_len..(py + 1) * out_row_len];
        pool_row(
            input,
            |k| {
                let y = y0 + k as isize;
                if y >= 0 && y < in_h as isize {
                    Some(y as usize * row_len)
                } else {
                    None
                }
            },
            in_w,
            channels,
            pool,
            out_row,
        );
    }
    Ok(())
}

/// `output = weights · input + bias`, weights decoded per access by `W`.
pub fn dense_f32<W: WeightCodec>(
    input: &[f32],
    weights: &W,
    bias: Option<&[f32]>,
    output: &mut [f32],
) -> Result<(), Fault> {
    let in_features = input.len();
    need(weights.len(), in_features * output.len())?;
    if let Some(bias) = bias {
        need(bias.len(), output.len())?;
    }
    for (o, out) in output.iter_mut().enumerate() {
        let mut acc = weights.dot(o * in_features, input);
        if let Some(bias) = bias {
            acc += bias[o];
        }
        *out = acc;
    }
    Ok(())
}

/// ReLU in place.
pub fn relu_f32(data: &mut [f32]) {
    for val in data.iter_mut() {
        *val = Activation::Relu.apply(*val);
    }
}

/// Softmax over consecutive groups of `axis_len` values (the channel axis
/// in a channel-last layout). Each group is shifted by its max before
/// exponentiation.
pub fn softmax_f32(input: &[f32], output: &mut [f32], axis_len: usize) -> Result<(), Fault> {
    if axis_len == 0 || input.len() % axis_len != 0 {
        return Err(Fault::UnsupportedFormat);
    }
    need(output.len(), input.len())?;

    for (src, dst) in input.chunks_exact(axis_len).zip(output.chunks_exact_mut(axis_len)) {
        let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = libm::expf(s - max);
            sum += *d;
        }
        for d in dst.iter_mut() {
            *d /= sum;
        }
    }
    Ok(())
}

/// Index of the largest value; first one wins on ties.
pub fn argmax_f32(data: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in data.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Position of the first NaN or infinity.
pub fn first_non_finite(data: &[f32]) -> Option<usize> {
    data.iter().position(|v| !v.is_finite())
}
