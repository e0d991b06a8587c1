//! Tensor descriptors: shape, stride and format metadata bound to an arena buffer.
//!
//! A descriptor owns no data. Its [`DataBuffer`] names an arena and a fixed
//! byte range inside it; the range is decided when the graph is built and
//! never changes. Binding only records the resolved address for
//! introspection. Kernels reach the bytes through the arena views in
//! [`crate::arena`], never through the raw address.
//!
//! Layout: activations are stored channel-last (for each pixel, all channels
//! are contiguous). Shapes and strides are nevertheless reported in
//! (batch, channel, height, width) order.
//!
//! Why: a convolution reads every input channel at one pixel per tap, so
//! channel-last keeps the inner gather loop a single contiguous copy.

use core::fmt;

use crate::arena::Handle;

/// Number of entries in a LUT4 decode table.
pub const LUT4_TABLE_LEN: usize = 16;

/// Bytes occupied by a LUT4 decode table (16 × f32).
pub const LUT4_TABLE_BYTES: usize = LUT4_TABLE_LEN * core::mem::size_of::<f32>();

/// Element storage format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Little-endian single-precision floats.
    #[default]
    F32,
    /// 16-entry f32 table followed by packed 4-bit indices (high nibble first).
    Lut4F32,
}

impl Format {
    /// Size in bytes of one addressable element (one index step for LUT4).
    pub const fn element_size(self) -> usize {
        match self {
            Format::F32 => 4,
            Format::Lut4F32 => 1,
        }
    }

    /// Bytes needed to store `count` elements in this format.
    ///
    /// Saturates at `usize::MAX`; see [`Format::checked_byte_size`].
    pub const fn byte_size(self, count: usize) -> usize {
        match self {
            Format::F32 => count.saturating_mul(4),
            Format::Lut4F32 => LUT4_TABLE_BYTES.saturating_add(count.div_ceil(2)),
        }
    }

    pub const fn checked_byte_size(self, count: usize) -> Option<usize> {
        match self {
            Format::F32 => count.checked_mul(4),
            Format::Lut4F32 => LUT4_TABLE_BYTES.checked_add(count.div_ceil(2)),
        }
    }

    pub(crate) const fn tag(self) -> u8 {
        match self {
            Format::F32 => 0,
            Format::Lut4F32 => 1,
        }
    }

    pub(crate) const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Format::F32),
            1 => Some(Format::Lut4F32),
            _ => None,
        }
    }
}

/// Up to four dimensions: batch, channel, height, width.
///
/// Unused trailing dimensions are 1, so `element_count` is always the
/// plain product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Shape {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub const fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self { batch, channels, height, width }
    }

    /// Single-batch feature map.
    pub const fn chw(channels: usize, height: usize, width: usize) -> Self {
        Self::new(1, channels, height, width)
    }

    /// Vector of `len` channels at a single position.
    pub const fn vector(len: usize) -> Self {
        Self::new(1, len, 1, 1)
    }

    /// Product of the four dimensions, saturating at `usize::MAX`.
    pub const fn element_count(&self) -> usize {
        self.batch
            .saturating_mul(self.channels)
            .saturating_mul(self.height)
            .saturating_mul(self.width)
    }

    /// `None` if the product of the dimensions overflows `usize`.
    pub fn checked_element_count(&self) -> Option<usize> {
        self.batch
            .checked_mul(self.channels)?
            .checked_mul(self.height)?
            .checked_mul(self.width)
    }

    pub const fn dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    pub const fn from_dims(dims: [usize; 4]) -> Self {
        Self::new(dims[0], dims[1], dims[2], dims[3])
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}x{}", self.batch, self.channels, self.height, self.width)
    }
}

/// Byte distance to advance one index step per dimension,
/// in (batch, channel, height, width) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Strides(pub [usize; 4]);

impl Strides {
    /// Packed channel-last strides for `shape` with `element_size`-byte elements.
    pub const fn packed(shape: &Shape, element_size: usize) -> Self {
        let channel = element_size;
        let width = channel.saturating_mul(shape.channels);
        let height = width.saturating_mul(shape.width);
        let batch = height.saturating_mul(shape.height);
        Self([batch, channel, height, width])
    }

    pub const fn batch(&self) -> usize {
        self.0[0]
    }
    pub const fn channel(&self) -> usize {
        self.0[1]
    }
    pub const fn height(&self) -> usize {
        self.0[2]
    }
    pub const fn width(&self) -> usize {
        self.0[3]
    }

    /// Every stride is at least as wide as the packed channel-last layout needs.
    pub fn covers(&self, shape: &Shape, element_size: usize) -> bool {
        self.channel() >= element_size
            && self.width() >= self.channel().saturating_mul(shape.channels)
            && self.height() >= self.width().saturating_mul(shape.width)
            && self.batch() >= self.height().saturating_mul(shape.height)
    }
}

/// Which of the two arenas a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArenaKind {
    /// Read-only constants: filters, biases, decode tables.
    Weights,
    /// Read-write: network input, intermediates, scratch, network output.
    #[default]
    Activations,
}

impl ArenaKind {
    pub(crate) const fn tag(self) -> u8 {
        match self {
            ArenaKind::Weights => 0,
            ArenaKind::Activations => 1,
        }
    }

    pub(crate) const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ArenaKind::Weights),
            1 => Some(ArenaKind::Activations),
            _ => None,
        }
    }
}

impl fmt::Display for ArenaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaKind::Weights => f.write_str("weights"),
            ArenaKind::Activations => f.write_str("activations"),
        }
    }
}

/// A fixed byte range inside one arena plus its resolved address, if bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataBuffer {
    pub arena: ArenaKind,
    pub handle: Handle,
    resolved: Option<usize>,
}

impl DataBuffer {
    pub const fn new(arena: ArenaKind, handle: Handle) -> Self {
        Self { arena, handle, resolved: None }
    }

    /// Weights-arena buffers are constant.
    pub const fn is_const(&self) -> bool {
        matches!(self.arena, ArenaKind::Weights)
    }

    pub const fn resolved(&self) -> Option<usize> {
        self.resolved
    }
}

/// Index of a tensor in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u16);

impl TensorId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Shape, stride and format metadata bound to one data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorDescriptor {
    pub format: Format,
    pub shape: Shape,
    pub strides: Strides,
    pub buffer: DataBuffer,
}

impl TensorDescriptor {
    /// Packed descriptor; the buffer range is filled in by the layout pass.
    pub const fn new(format: Format, shape: Shape, arena: ArenaKind) -> Self {
        let bytes = format.byte_size(shape.element_count());
        Self {
            format,
            shape,
            strides: Strides::packed(&shape, format.element_size()),
            buffer: DataBuffer::new(arena, Handle::new(0, bytes)),
        }
    }

    /// Bind to an arena whose first byte lives at `base`.
    pub fn resolve(&mut self, base: usize) {
        self.buffer.resolved = Some(self.buffer.handle.resolve(base));
    }

    pub(crate) fn unresolve(&mut self) {
        self.buffer.resolved = None;
    }

    pub const fn element_count(&self) -> usize {
        self.shape.element_count()
    }

    pub const fn byte_size(&self) -> usize {
        self.format.byte_size(self.element_count())
    }

    /// `None` when the element count or the byte size overflows `usize`.
    pub fn checked_byte_size(&self) -> Option<usize> {
        self.format.checked_byte_size(self.shape.checked_element_count()?)
    }

    pub const fn offset(&self) -> usize {
        self.buffer.handle.offset()
    }

    /// The bytes the elements occupy, starting at the buffer offset.
    pub const fn data_handle(&self) -> Handle {
        Handle::new(self.buffer.handle.offset(), self.byte_size())
    }

    pub const fn resolved_address(&self) -> Option<usize> {
        self.buffer.resolved()
    }

    pub const fn is_bound(&self) -> bool {
        self.buffer.resolved().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_strides_are_channel_last() {
        let shape = Shape::chw(16, 32, 32);
        let strides = Strides::packed(&shape, 4);
        // channel, width, height, batch
        assert_eq!(strides.channel(), 4);
        assert_eq!(strides.width(), 64);
        assert_eq!(strides.height(), 2048);
        assert_eq!(strides.batch(), 65536);
        assert!(strides.covers(&shape, 4));
        assert!(!Strides([0, 4, 64, 64]).covers(&shape, 4));
    }

    #[test]
    fn test_byte_size_per_format() {
        let dense =
            TensorDescriptor::new(Format::Lut4F32, Shape::new(3, 64, 1, 1), ArenaKind::Weights);
        // 64-byte table + 96 bytes of nibbles
        assert_eq!(dense.byte_size(), 160);
        let odd = Format::Lut4F32.byte_size(5);
        assert_eq!(odd, LUT4_TABLE_BYTES + 3);

        let input =
            TensorDescriptor::new(Format::F32, Shape::chw(1, 64, 64), ArenaKind::Activations);
        assert_eq!(input.element_count(), 4096);
        assert_eq!(input.byte_size(), 16384);
        assert_eq!(input.checked_byte_size(), Some(16384));
    }

    #[test]
    fn test_huge_shapes_do_not_overflow() {
        let huge = Shape::new(usize::MAX, usize::MAX, 2, 2);
        assert_eq!(huge.checked_element_count(), None);
        assert_eq!(huge.element_count(), usize::MAX);

        let t = TensorDescriptor::new(
            Format::F32,
            Shape::vector(usize::MAX / 2),
            ArenaKind::Activations,
        );
        assert_eq!(t.checked_byte_size(), None);
        assert_eq!(t.byte_size(), usize::MAX);
        assert_eq!(
            Format::Lut4F32.checked_byte_size(usize::MAX),
            Some(LUT4_TABLE_BYTES + usize::MAX / 2 + 1)
        );
    }

    #[test]
    fn test_resolve_records_base_plus_offset() {
        let mut t = TensorDescriptor::new(Format::F32, Shape::vector(3), ArenaKind::Activations);
        t.buffer.handle = Handle::new(256, 12);
        assert!(!t.is_bound());
        t.resolve(0x2000_0000);
        assert_eq!(t.resolved_address(), Some(0x2000_0100));
        assert!(!t.buffer.is_const());
    }
}
