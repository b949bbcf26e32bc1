//! Serial-type decoding and payload arithmetic.
//!
//! Every column value in a record is preceded (in the record header) by a
//! serial-type code that fixes its storage class and exact byte width:
//!
//! | code        | content                          | width        |
//! |-------------|----------------------------------|--------------|
//! | 0           | NULL / INTEGER PRIMARY KEY alias | 0            |
//! | 1-6         | big-endian two's-complement int  | 1,2,3,4,6,8  |
//! | 7           | IEEE 754 double                  | 8            |
//! | 8, 9        | integer constants 0 and 1        | 0            |
//! | 10, 11      | reserved                         | error        |
//! | even >= 12  | BLOB                             | (n-12)/2     |
//! | odd  >= 13  | TEXT                             | (n-13)/2     |

use crate::error::{Error, Result};

/// Storage class of a decoded column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// NULL, also the placeholder slot of an aliased INTEGER PRIMARY KEY
    Null,
    /// Signed integer of 1-8 bytes
    Int,
    /// 8-byte IEEE 754 double
    Real,
    /// Zero-width integer constant (serial types 8 and 9)
    ConstInt,
    /// Binary payload
    Blob,
    /// UTF-8 text payload
    Text,
}

/// A decoded serial type: its code, storage class, and on-disk byte width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialType {
    /// The raw serial-type code
    pub code: u64,
    /// Storage class the code maps to
    pub class: StorageClass,
    /// Exact number of content bytes the column occupies
    pub len: usize,
}

impl SerialType {
    /// Map a serial-type code to its storage class and byte width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSerialType`] for the reserved codes 10 and 11.
    /// Callers discard the current record candidate on this error.
    pub fn from_code(code: u64) -> Result<Self> {
        let (class, len) = match code {
            0 => (StorageClass::Null, 0),
            1 => (StorageClass::Int, 1),
            2 => (StorageClass::Int, 2),
            3 => (StorageClass::Int, 3),
            4 => (StorageClass::Int, 4),
            5 => (StorageClass::Int, 6),
            6 => (StorageClass::Int, 8),
            7 => (StorageClass::Real, 8),
            8 | 9 => (StorageClass::ConstInt, 0),
            10 | 11 => return Err(Error::unknown_serial_type(code)),
            n if n % 2 == 0 => (StorageClass::Blob, ((n - 12) / 2) as usize),
            n => (StorageClass::Text, ((n - 13) / 2) as usize),
        };
        Ok(Self { code, class, len })
    }

    /// Map a whole header's worth of codes, failing on the first unknown one.
    pub fn from_codes(codes: &[u64]) -> Result<Vec<Self>> {
        codes.iter().map(|&code| Self::from_code(code)).collect()
    }
}

/// Reconstruct a record's payload length from its decoded header.
///
/// The payload of a record is the header (whose size `header_len` includes
/// the header-length varint itself) followed by the column content bytes.
/// Deleted cells usually lose their payload-length prefix to the freeblock
/// header that overwrites them, so the carver recomputes it from here.
pub fn payload_len_from_header(header_len: u64, types: &[SerialType]) -> u64 {
    header_len + types.iter().map(|t| t.len as u64).sum::<u64>()
}

/// Number of payload bytes stored inside the btree page itself.
///
/// With usable page size `U`, a payload of `P` bytes spills to overflow pages
/// when `P` exceeds `X = U - 35`. The spilled local portion is
/// `K = M + (P - M) mod (U - 4)` if that still fits, else the minimum
/// `M = ((U - 12) * 32 / 255) - 23`. The division is integer division; the
/// arithmetic must match the file format exactly or overflow chains are
/// stitched at the wrong byte.
pub fn local_payload_len(payload: u64, usable: usize) -> usize {
    let u = usable as u64;
    let x = u - 35;
    if payload <= x {
        return payload as usize;
    }
    let m = ((u - 12) * 32 / 255) - 23;
    let k = m + (payload - m) % (u - 4);
    if k <= x {
        k as usize
    } else {
        m as usize
    }
}

/// Decode a big-endian two's-complement integer of `width` bytes.
///
/// Returns `None` on buffer underflow. Width 0 is the NULL case and decodes
/// to nothing here; widths above 8 cannot occur for integer serial types.
pub fn decode_int(data: &[u8], width: usize) -> Option<i64> {
    if width == 0 || width > 8 || data.len() < width {
        return None;
    }
    let mut value: i64 = 0;
    for &byte in &data[..width] {
        value = (value << 8) | i64::from(byte);
    }
    // Sign-extend from the declared width
    let shift = 64 - width as u32 * 8;
    Some(value.wrapping_shl(shift).wrapping_shr(shift))
}

/// Decode an 8-byte big-endian IEEE 754 double.
pub fn decode_real(data: &[u8]) -> Option<f64> {
    let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
    Some(f64::from_be_bytes(bytes))
}
