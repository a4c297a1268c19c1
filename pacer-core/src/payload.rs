//! Process-wide payload buffer backing echo `size=` responses and the
//! default TCP/UDP probe payloads. Read-only after first use.

use lazy_static::lazy_static;
use std::sync::OnceLock;

pub const KILOBYTE: usize = 1024;
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 256 * KILOBYTE;

static MAX_PAYLOAD_SIZE: OnceLock<usize> = OnceLock::new();

lazy_static! {
    static ref PAYLOAD: Vec<u8> = build_payload(max_payload_size());
}

/// Sets the maximum payload size. Only effective before the buffer is
/// first read; later calls are ignored.
pub fn init_max_payload_size(bytes: usize) {
    let _ = MAX_PAYLOAD_SIZE.set(bytes.max(1));
}

pub fn max_payload_size() -> usize {
    *MAX_PAYLOAD_SIZE.get_or_init(|| DEFAULT_MAX_PAYLOAD_SIZE)
}

/// A payload slice of `size` bytes, clamped to the configured maximum.
pub fn payload(size: usize) -> &'static [u8] {
    &PAYLOAD[..size.min(PAYLOAD.len())]
}

fn build_payload(size: usize) -> Vec<u8> {
    // Printable repeating pattern, stable across runs.
    (0..size).map(|i| b'A' + (i % 26) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_maximum() {
        assert_eq!(payload(10).len(), 10);
        assert_eq!(payload(usize::MAX).len(), max_payload_size());
        assert_eq!(&payload(4)[..4], b"ABCD");
    }
}
