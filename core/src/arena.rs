//! Arena handles, the build-time bump allocator, and the two bound arenas.
//!
//! Build time: [`ArenaLayout::allocate`] hands out [`Handle`]s (fixed byte
//! ranges). Weights are laid out with it directly. Activations go through the
//! liveness planner first, which only decides the offsets.
//!
//! Bind time: the caller owns the raw memory and lends it as `&[u8]` /
//! `&mut [u8]`. [`WeightsArena`] and [`ActivationsArena`] check it once
//! (non-empty, large enough, aligned) and then serve typed `f32` views for
//! the kernels. Lifetimes tie every view to the caller's buffer, so a view
//! can't outlive the memory it points into.

use core::ops::Range;

use crate::error::{Fault, NanoError, NanoResult};
use crate::tensor::{ArenaKind, LUT4_TABLE_BYTES, LUT4_TABLE_LEN};

/// Alignment of every arena base and every f32 buffer offset.
pub const ARENA_ALIGN: usize = core::mem::align_of::<f32>();

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A fixed byte range inside an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Handle {
    offset: usize,
    len: usize,
}

impl Handle {
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    #[inline(always)]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    /// `None` when `offset + len` wraps, which a decoded table can ask for.
    pub const fn checked_end(&self) -> Option<usize> {
        self.offset.checked_add(self.len)
    }

    pub const fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    /// Byte ranges intersect. Empty handles never overlap anything.
    pub const fn overlaps(&self, other: &Handle) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.offset < other.end()
            && other.offset < self.end()
    }

    /// Address of the first byte, given the arena's base address.
    pub const fn resolve(&self, base: usize) -> usize {
        base + self.offset
    }
}

/// Bump allocator over a not-yet-existing arena.
///
/// Only computes offsets; no memory is touched. O(1) per allocation and
/// no fragmentation, which is all a constant weights blob needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaLayout {
    offset: usize,
}

impl ArenaLayout {
    pub const fn new() -> Self {
        Self { offset: 0 }
    }

    /// Reserve `size` bytes at the next aligned offset.
    pub fn allocate(&mut self, size: usize) -> Handle {
        let start = align_up(self.offset, ARENA_ALIGN);
        self.offset = start + size;
        Handle::new(start, size)
    }

    /// Total bytes the arena must provide.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.offset
    }
}

/// An empty slice is the caller's "no buffer" and reports `NullBase`.
///
/// Why: a safe slice can't be null, so zero length is the only way a
/// missing region shows up at this boundary.
fn check_region(arena: ArenaKind, bytes: &[u8], required: usize) -> NanoResult<()> {
    if bytes.is_empty() {
        return Err(NanoError::NullBase { arena });
    }
    if bytes.len() < required {
        return Err(NanoError::ArenaTooSmall {
            arena,
            required,
            available: bytes.len(),
        });
    }
    if bytes.as_ptr() as usize % ARENA_ALIGN != 0 {
        return Err(NanoError::Misaligned {
            arena,
            align: ARENA_ALIGN,
        });
    }
    Ok(())
}

fn check_bounds(handle: Handle, len: usize) -> Result<(), Fault> {
    if handle.end() > len {
        return Err(Fault::BufferOutOfBounds {
            offset: handle.offset(),
            end: handle.end(),
        });
    }
    Ok(())
}

/// Word range (f32 indices) of a byte handle.
fn words(handle: Handle) -> Result<Range<usize>, Fault> {
    if handle.offset() % ARENA_ALIGN != 0 || handle.len() % ARENA_ALIGN != 0 {
        return Err(Fault::Misaligned {
            offset: handle.offset(),
        });
    }
    Ok(handle.offset() / ARENA_ALIGN..handle.end() / ARENA_ALIGN)
}

/// Read-only constants region, shared freely between contexts.
#[derive(Debug, Clone, Copy)]
pub struct WeightsArena<'w> {
    bytes: &'w [u8],
}

impl<'w> WeightsArena<'w> {
    /// Check `bytes` against the `required` size and take it as the weights arena.
    pub fn bind(bytes: &'w [u8], required: usize) -> NanoResult<Self> {
        check_region(ArenaKind::Weights, bytes, required)?;
        Ok(Self { bytes })
    }

    pub fn into_inner(self) -> &'w [u8] {
        self.bytes
    }

    pub fn base_addr(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self, handle: Handle) -> Result<&'w [u8], Fault> {
        check_bounds(handle, self.bytes.len())?;
        Ok(&self.bytes[handle.range()])
    }

    /// Packed f32 buffer.
    pub fn f32(&self, handle: Handle) -> Result<&'w [f32], Fault> {
        let bytes = self.bytes(handle)?;
        bytemuck::try_cast_slice(bytes).map_err(|_| Fault::Misaligned {
            offset: handle.offset(),
        })
    }

    /// LUT4 buffer split into its decode table and its packed indices.
    pub fn lut4(&self, handle: Handle) -> Result<(&'w [f32], &'w [u8]), Fault> {
        let bytes = self.bytes(handle)?;
        if bytes.len() < LUT4_TABLE_BYTES {
            return Err(Fault::BufferTooSmall {
                required: LUT4_TABLE_BYTES,
                available: bytes.len(),
            });
        }
        let (table, packed) = bytes.split_at(LUT4_TABLE_BYTES);
        let table: &[f32] = bytemuck::try_cast_slice(table).map_err(|_| Fault::Misaligned {
            offset: handle.offset(),
        })?;
        debug_assert_eq!(table.len(), LUT4_TABLE_LEN);
        Ok((table, packed))
    }
}

/// Read-write region for the input, intermediates, scratch and output.
///
/// Borrowed mutably for the whole time a context is bound to it: one
/// activations arena per in-flight forward pass.
#[derive(Debug)]
pub struct ActivationsArena<'a> {
    bytes: &'a mut [u8],
}

impl<'a> ActivationsArena<'a> {
    pub fn bind(bytes: &'a mut [u8], required: usize) -> NanoResult<Self> {
        check_region(ArenaKind::Activations, bytes, required)?;
        Ok(Self { bytes })
    }

    /// Give the borrowed memory back.
    pub fn into_inner(self) -> &'a mut [u8] {
        self.bytes
    }

    pub fn base_addr(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn words(&self) -> Result<&[f32], Fault> {
        let len = self.bytes.len() & !(ARENA_ALIGN - 1);
        bytemuck::try_cast_slice(&self.bytes[..len]).map_err(|_| Fault::Misaligned { offset: 0 })
    }

    fn words_mut(&mut self) -> Result<&mut [f32], Fault> {
        let len = self.bytes.len() & !(ARENA_ALIGN - 1);
        bytemuck::try_cast_slice_mut(&mut self.bytes[..len])
            .map_err(|_| Fault::Misaligned { offset: 0 })
    }

    pub fn f32(&self, handle: Handle) -> Result<&[f32], Fault> {
        check_bounds(handle, self.bytes.len())?;
        let range = words(handle)?;
        Ok(&self.words()?[range])
    }

    pub fn f32_mut(&mut self, handle: Handle) -> Result<&mut [f32], Fault> {
        check_bounds(handle, self.bytes.len())?;
        let range = words(handle)?;
        Ok(&mut self.words_mut()?[range])
    }

    /// One read view and `N` write views at once, as a kernel needs them.
    ///
    /// Fails with `BufferOverlap` unless all `N + 1` ranges are pairwise
    /// disjoint; the layout planner guarantees that for the tensors of a
    /// single node.
    ///
    /// Why: the borrow checker can't split one `&mut [f32]` at offsets known
    /// only at run time, so the disjointness is checked here once instead.
    pub fn views<const N: usize>(
        &mut self,
        read: Handle,
        writes: [Handle; N],
    ) -> Result<(&[f32], [&mut [f32]; N]), Fault> {
        let capacity = self.bytes.len();
        check_bounds(read, capacity)?;
        let read_words = words(read)?;
        let mut write_words: [Range<usize>; N] = core::array::from_fn(|_| 0..0);
        for (i, handle) in writes.iter().enumerate() {
            check_bounds(*handle, capacity)?;
            if handle.overlaps(&read) {
                return Err(Fault::BufferOverlap { offset: handle.offset() });
            }
            for other in &writes[..i] {
                if handle.overlaps(other) {
                    return Err(Fault::BufferOverlap { offset: handle.offset() });
                }
            }
            write_words[i] = words(*handle)?;
        }

        let all = self.words_mut()?;
        let base = all.as_mut_ptr();
        // SAFETY: every range was bounds-checked against the arena above and
        // the ranges are pairwise disjoint, so the slices never alias. All of
        // them borrow from `self` for the returned lifetime.
        let input =
            unsafe { core::slice::from_raw_parts(base.add(read_words.start), read_words.len()) };
        let outputs = core::array::from_fn(|i| {
            let range = &write_words[i];
            unsafe { core::slice::from_raw_parts_mut(base.add(range.start), range.len()) }
        });
        Ok((input, outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aligned(words: &mut [f32]) -> &mut [u8] {
        bytemuck::cast_slice_mut(words)
    }

    #[test]
    fn test_layout_aligns_and_accumulates() {
        let mut layout = ArenaLayout::new();
        let a = layout.allocate(576);
        let b = layout.allocate(6);
        let c = layout.allocate(4);
        assert_eq!(a, Handle::new(0, 576));
        assert_eq!(b, Handle::new(576, 6));
        assert_eq!(c.offset(), 584);
        assert_eq!(layout.size(), 588);
    }

    #[test]
    fn test_checked_end_catches_wrap() {
        assert_eq!(Handle::new(8, 4).checked_end(), Some(12));
        assert_eq!(Handle::new(usize::MAX - 3, 8).checked_end(), None);
        assert_eq!(Handle::new(16, 4).resolve(0x2000_0000), 0x2000_0010);
    }

    #[test]
    fn test_bind_rejects_empty_small_and_misaligned() {
        let mut backing = [0f32; 8];
        let bytes = aligned(&mut backing);
        assert_eq!(
            WeightsArena::bind(&[], 4).unwrap_err(),
            NanoError::NullBase { arena: ArenaKind::Weights }
        );
        assert!(matches!(
            WeightsArena::bind(bytes, 64),
            Err(NanoError::ArenaTooSmall { required: 64, available: 32, .. })
        ));
        assert!(matches!(
            WeightsArena::bind(&bytes[1..], 4),
            Err(NanoError::Misaligned { .. })
        ));
        assert!(WeightsArena::bind(bytes, 32).is_ok());
    }

    #[test]
    fn test_views_are_disjoint_and_checked() {
        let mut backing = [0f32; 16];
        let mut arena = ActivationsArena::bind(aligned(&mut backing), 64).unwrap();
        arena.f32_mut(Handle::new(0, 16)).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        let (input, [out, scratch]) = arena
            .views(Handle::new(0, 16), [Handle::new(16, 16), Handle::new(32, 8)])
            .unwrap();
        assert_eq!(input, &[1.0, 2.0, 3.0, 4.0]);
        out.copy_from_slice(input);
        scratch[0] = 9.0;
        assert_eq!(arena.f32(Handle::new(16, 16)).unwrap(), &[1.0, 2.0, 3.0, 4.0]);

        assert_eq!(
            arena.views(Handle::new(0, 16), [Handle::new(12, 8)]).unwrap_err(),
            Fault::BufferOverlap { offset: 12 }
        );
        assert!(matches!(
            arena.views(Handle::new(0, 16), [Handle::new(60, 8)]),
            Err(Fault::BufferOutOfBounds { .. })
        ));
    }
}
