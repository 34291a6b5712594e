//! Payload masking (RFC 6455 section 5.3).
//!
//! Masking is an involution: applying the same key twice restores the input.

/// XOR each byte with `mask[i % 4]`, in place.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Generate a random masking key for client-to-server frames.
///
/// # Errors
///
/// Returns [`Error::Io`](crate::Error::Io) if the OS random source fails.
pub fn random_mask() -> crate::Result<[u8; 4]> {
    let mut mask = [0u8; 4];
    getrandom::getrandom(&mut mask).map_err(|e| crate::Error::Io(e.to_string()))?;
    Ok(mask)
}
