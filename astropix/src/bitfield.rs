/*!
Bit-level packing and unpacking.

This module provides the generic codec used by both the configuration encoder
and the readout decoder: integers and boolean grids are converted to and from
ordered bit sequences of a fixed width.
*/

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Owned bit sequence. Index 0 is the first bit on the wire.
pub type Bits = BitVec<u8, Msb0>;

/// Borrowed bit sequence
pub type BitsRef = BitSlice<u8, Msb0>;

/// Widest field the codec handles
pub const MAX_FIELD_WIDTH: usize = 64;

/// Bit significance order of a packed field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitOrder {
    /// Most significant bit at the lowest index (protocol convention)
    #[default]
    MsbFirst,
    /// Least significant bit at the lowest index
    LsbFirst,
}

/// A value does not fit into the requested number of bits
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("value {value} does not fit in {width} bits")]
pub struct OverflowError {
    pub value: u64,
    pub width: usize,
}

/// Errors that can occur while packing or unpacking fields
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitFieldError {
    #[error(transparent)]
    Overflow(#[from] OverflowError),

    #[error("field width {0} is outside 1..=64")]
    InvalidWidth(usize),

    #[error("bit range {offset}..{end} exceeds sequence of {len} bits")]
    OutOfBounds { offset: usize, end: usize, len: usize },
}

/// Largest value representable in `width` bits
pub fn max_value(width: usize) -> u64 {
    match width {
        0 => 0,
        w if w >= 64 => u64::MAX,
        w => (1u64 << w) - 1,
    }
}

/// Check whether `value` fits into `width` bits
pub fn fits(value: u64, width: usize) -> bool {
    value <= max_value(width)
}

fn check_width(width: usize) -> Result<(), BitFieldError> {
    if width == 0 || width > MAX_FIELD_WIDTH {
        return Err(BitFieldError::InvalidWidth(width));
    }
    Ok(())
}

/// Pack `value` into exactly `width` bits
pub fn pack(value: u64, width: usize, order: BitOrder) -> Result<Bits, BitFieldError> {
    let mut bits = Bits::repeat(false, width);
    write_field(&mut bits, 0, width, value, order)?;
    Ok(bits)
}

/// Unpack the first `width` bits of `bits`. Exact inverse of [`pack`].
pub fn unpack(bits: &BitsRef, width: usize, order: BitOrder) -> Result<u64, BitFieldError> {
    read_field(bits, 0, width, order)
}

/// Overwrite `width` bits of `dst` starting at `offset` with `value`
pub fn write_field(
    dst: &mut BitsRef,
    offset: usize,
    width: usize,
    value: u64,
    order: BitOrder,
) -> Result<(), BitFieldError> {
    check_width(width)?;
    if !fits(value, width) {
        return Err(OverflowError { value, width }.into());
    }
    let end = offset + width;
    if end > dst.len() {
        return Err(BitFieldError::OutOfBounds { offset, end, len: dst.len() });
    }

    for (i, mut bit) in dst[offset..end].iter_mut().enumerate() {
        let shift = match order {
            BitOrder::MsbFirst => width - 1 - i,
            BitOrder::LsbFirst => i,
        };
        *bit = (value >> shift) & 1 == 1;
    }
    Ok(())
}

/// Read `width` bits of `src` starting at `offset`
pub fn read_field(
    src: &BitsRef,
    offset: usize,
    width: usize,
    order: BitOrder,
) -> Result<u64, BitFieldError> {
    check_width(width)?;
    let end = offset + width;
    if end > src.len() {
        return Err(BitFieldError::OutOfBounds { offset, end, len: src.len() });
    }

    let field = &src[offset..end];
    let value = match order {
        BitOrder::MsbFirst => field.iter().fold(0u64, |acc, b| (acc << 1) | *b as u64),
        BitOrder::LsbFirst => field.iter().rev().fold(0u64, |acc, b| (acc << 1) | *b as u64),
    };
    Ok(value)
}

/// Pack a boolean grid one bit per cell, row-major
pub fn pack_grid<R: AsRef<[bool]>>(rows: &[R]) -> Bits {
    rows.iter().flat_map(|row| row.as_ref().iter().copied()).collect()
}

/// Reverse the bit order inside every byte
pub fn reverse_bits(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b.reverse_bits()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_small_widths() {
        for width in 1..=10 {
            for value in 0..(1u64 << width) {
                let bits = pack(value, width, BitOrder::MsbFirst).unwrap();
                assert_eq!(bits.len(), width);
                assert_eq!(unpack(&bits, width, BitOrder::MsbFirst).unwrap(), value);
            }
        }
    }

    #[test]
    fn test_roundtrip_wide_edges() {
        for width in [16, 32, 38, 63, 64] {
            for value in [0, 1, max_value(width) / 2, max_value(width)] {
                for order in [BitOrder::MsbFirst, BitOrder::LsbFirst] {
                    let bits = pack(value, width, order).unwrap();
                    assert_eq!(unpack(&bits, width, order).unwrap(), value);
                }
            }
        }
    }

    #[test]
    fn test_bit_ordering() {
        let msb = pack(0b110, 3, BitOrder::MsbFirst).unwrap();
        assert_eq!(msb.as_bitslice(), bits![u8, Msb0; 1, 1, 0]);

        let lsb = pack(0b110, 3, BitOrder::LsbFirst).unwrap();
        assert_eq!(lsb.as_bitslice(), bits![u8, Msb0; 0, 1, 1]);
    }

    #[test]
    fn test_overflow() {
        assert_eq!(
            pack(64, 6, BitOrder::MsbFirst),
            Err(BitFieldError::Overflow(OverflowError { value: 64, width: 6 }))
        );
        assert!(pack(63, 6, BitOrder::MsbFirst).is_ok());
    }

    #[test]
    fn test_invalid_width() {
        assert_eq!(pack(0, 0, BitOrder::MsbFirst), Err(BitFieldError::InvalidWidth(0)));
        assert_eq!(pack(0, 65, BitOrder::MsbFirst), Err(BitFieldError::InvalidWidth(65)));
    }

    #[test]
    fn test_field_access_within_sequence() {
        let mut bits = Bits::repeat(false, 24);
        write_field(&mut bits, 4, 12, 0xABC, BitOrder::MsbFirst).unwrap();

        assert_eq!(read_field(&bits, 4, 12, BitOrder::MsbFirst).unwrap(), 0xABC);
        assert_eq!(read_field(&bits, 0, 4, BitOrder::MsbFirst).unwrap(), 0);
        assert_eq!(bits.as_raw_slice(), &[0x0A, 0xBC, 0x00]);

        assert!(matches!(
            read_field(&bits, 20, 8, BitOrder::MsbFirst),
            Err(BitFieldError::OutOfBounds { offset: 20, end: 28, len: 24 })
        ));
    }

    #[test]
    fn test_pack_grid_row_major() {
        let grid = vec![vec![true, false], vec![false, true]];
        assert_eq!(pack_grid(&grid).as_bitslice(), bits![u8, Msb0; 1, 0, 0, 1]);
    }

    #[test]
    fn test_reverse_bits() {
        assert_eq!(reverse_bits(&[0xBC, 0x01, 0xFF]), vec![0x3D, 0x80, 0xFF]);
    }
}
