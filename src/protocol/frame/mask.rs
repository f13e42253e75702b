//! Payload masking.

/// Generates a random mask key for a client-to-server frame.
pub fn generate_mask() -> [u8; 4] {
    rand::random()
}

/// Masks or unmasks the payload in place by XOR-ing it with the key cycled
/// over the buffer. The operation is its own inverse.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}
