//! Weight decoding strategies.
//!
//! The dense kernel is generic over [`WeightCodec`] and asks for weights one
//! element at a time, so LUT4 weights are expanded on the fly and never
//! materialized as floats. The layer picks the codec once per forward pass
//! from the weight tensor's [`Format`](crate::tensor::Format).

use crate::tensor::LUT4_TABLE_LEN;

/// Random access to a weight tensor's values as f32.
pub trait WeightCodec {
    /// Number of logical elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decoded value of element `index`.
    fn get(&self, index: usize) -> f32;

    /// `sum(weights[start + i] * input[i])`.
    fn dot(&self, start: usize, input: &[f32]) -> f32 {
        let mut acc = 0.0f32;
        for (i, &x) in input.iter().enumerate() {
            acc += self.get(start + i) * x;
        }
        acc
    }
}

/// Plain f32 weights.
#[derive(Debug, Clone, Copy)]
pub struct F32Weights<'w> {
    values: &'w [f32],
}

impl<'w> F32Weights<'w> {
    pub const fn new(values: &'w [f32]) -> Self {
        Self { values }
    }
}

impl WeightCodec for F32Weights<'_> {
    #[inline(always)]
    fn len(&self) -> usize {
        self.values.len()
    }

    #[inline(always)]
    fn get(&self, index: usize) -> f32 {
        self.values[index]
    }

    fn dot(&self, start: usize, input: &[f32]) -> f32 {
        let row = &self.values[start..start + input.len()];
        let mut acc = 0.0f32;
        for (w, x) in row.iter().zip(input) {
            acc += w * x;
        }
        acc
    }
}

/// 4-bit indices into a 16-entry f32 table.
///
/// Element `2k` is the high nibble of byte `k`, element `2k + 1` the low
/// nibble. `len` is the logical element count; an odd count leaves the last
/// low nibble unused.
#[derive(Debug, Clone, Copy)]
pub struct Lut4Weights<'w> {
    table: &'w [f32],
    packed: &'w [u8],
    len: usize,
}

impl<'w> Lut4Weights<'w> {
    /// `None` unless the table has 16 entries and `packed` holds `len` nibbles.
    pub fn new(table: &'w [f32], packed: &'w [u8], len: usize) -> Option<Self> {
        if table.len() != LUT4_TABLE_LEN || packed.len() < len.div_ceil(2) {
            return None;
        }
        Some(Self { table, packed, len })
    }
}

impl WeightCodec for Lut4Weights<'_> {
    #[inline(always)]
    fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    fn get(&self, index: usize) -> f32 {
        let byte = self.packed[index >> 1];
        let nibble = if index & 1 == 0 { byte >> 4 } else { byte & 0x0F };
        self.table[nibble as usize]
    }
}

/// Pack 4-bit indices (values `0..16`) high nibble first.
///
/// Returns the number of bytes written, or `None` if `out` is too short or
/// an index is out of range.
pub fn pack_lut4(indices: &[u8], out: &mut [u8]) -> Option<usize> {
    let needed = indices.len().div_ceil(2);
    if out.len() < needed || indices.iter().any(|&i| i as usize >= LUT4_TABLE_LEN) {
        return None;
    }
    for (byte, pair) in out.iter_mut().zip(indices.chunks(2)) {
        let hi = pair[0] << 4;
        let lo = pair.get(1).copied().unwrap_or(0);
        *byte = hi | lo;
    }
    Some(needed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> [f32; 16] {
        core::array::from_fn(|i| i as f32 * 0.5 - 4.0)
    }

    #[test]
    fn test_lut4_nibble_order() {
        let table = table();
        // indices 15, 0, 3
        let packed = [0xF0, 0x30];
        let w = Lut4Weights::new(&table, &packed, 3).unwrap();
        assert_eq!(w.len(), 3);
        assert_eq!(w.get(0), 3.5);
        assert_eq!(w.get(1), -4.0);
        assert_eq!(w.get(2), -2.5);
    }

    #[test]
    fn test_lut4_dot_matches_decoded() {
        let table = table();
        let indices = [1u8, 2, 3, 4, 5, 6];
        let mut packed = [0u8; 3];
        assert_eq!(pack_lut4(&indices, &mut packed), Some(3));
        assert_eq!(packed, [0x12, 0x34, 0x56]);

        let w = Lut4Weights::new(&table, &packed, 6).unwrap();
        let input = [1.0, 2.0, 3.0];
        // row 1 is indices 4, 5, 6 → -2.0, -1.5, -1.0
        assert_eq!(w.dot(3, &input), -2.0 - 3.0 - 3.0);
    }

    #[test]
    fn test_lut4_rejects_short_inputs() {
        let table = table();
        assert!(Lut4Weights::new(&table[..8], &[0; 4], 8).is_none());
        assert!(Lut4Weights::new(&table, &[0; 2], 5).is_none());
        assert_eq!(pack_lut4(&[16], &mut [0]), None);
    }

    #[test]
    fn test_f32_dot() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let w = F32Weights::new(&values);
        assert_eq!(w.dot(2, &[10.0, 100.0]), 430.0);
    }
}
