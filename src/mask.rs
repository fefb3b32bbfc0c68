//! WebSocket frame masking utilities
//!
//! Masking is a byte-wise XOR with a 4-byte key cycling by `index % 4`.
//! The operation is its own inverse, so the same routine masks on write
//! and unmasks on read.
//!
//! Supports multiple RNG backends via feature flags:
//! - `fastrand`: fast PRNG (default)
//! - `getrandom`: OS randomness

/// Apply a WebSocket mask in place, starting at key phase 0
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// Apply a WebSocket mask in place, starting at key phase `offset % 4`
///
/// Used when a payload is masked in several chunks: `offset` is the number
/// of payload bytes already processed.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    if data.is_empty() {
        return;
    }

    let rotated = [
        mask[offset & 3],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    let word = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2],
        rotated[3],
    ]);

    // 8 bytes at a time
    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        let value = u64::from_ne_bytes(bytes) ^ word;
        chunk.copy_from_slice(&value.to_ne_bytes());
    }

    // Every full chunk keeps the phase aligned, so the tail starts at 0
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i & 3];
    }
}

/// Generate a random mask key for client frames.
///
/// If both RNG features are enabled, `getrandom` wins.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    generate_mask_inner()
}

#[cfg(feature = "getrandom")]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        return fallback_mask();
    }
    buf
}

/// Key used when the OS RNG fails
#[cfg(all(feature = "getrandom", feature = "fastrand"))]
fn fallback_mask() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

/// Key used when the OS RNG fails: splitmix64 over a shared counter seeded
/// from the clock, so consecutive keys differ
#[cfg(all(feature = "getrandom", not(feature = "fastrand")))]
fn fallback_mask() -> [u8; 4] {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
        ^ u64::from(std::process::id());
    let mut z = COUNTER
        .fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed)
        .wrapping_add(seed);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z as u32).to_ne_bytes()
}

#[cfg(all(feature = "fastrand", not(feature = "getrandom")))]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom")))]
fn generate_mask_inner() -> [u8; 4] {
    compile_error!("At least one RNG feature must be enabled: fastrand or getrandom");
}
