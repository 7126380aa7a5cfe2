use crate::Result;
use crate::StorageError;

/// Converts a `u64` to an 8-byte array in big-endian byte order.
///
/// Big-endian keeps the lexicographic order of the encoded keys equal to the
/// numeric order.
pub const fn safe_kv(num: u64) -> [u8; 8] {
    num.to_be_bytes()
}

pub fn safe_vk<K: AsRef<[u8]>>(bytes: K) -> Result<u64> {
    let bytes = bytes.as_ref();
    let array: [u8; 8] = bytes.try_into().map_err(|_| StorageError::Corrupted {
        table: "-",
        reason: format!("expected 8 bytes, got {}", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(array))
}

/// Maps a signed timestamp onto `u64` so that byte order follows time order,
/// including for negative values.
pub const fn order_preserving_i64(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

pub const fn from_order_preserving_i64(v: u64) -> i64 {
    (v ^ (1 << 63)) as i64
}
