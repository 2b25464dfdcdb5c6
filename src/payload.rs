/// Capacity of a per-mode payload buffer.
pub const PAYLOAD_CAPACITY: usize = 256;

/// Cyclic test pattern buffer: every byte is its predecessor plus one, mod 256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBuffer {
    buf: [u8; PAYLOAD_CAPACITY],
    len: usize,
}

impl Default for PayloadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0; PAYLOAD_CAPACITY],
            len: 0,
        }
    }

    /// Regenerate the first `length` bytes, continuing from the byte that
    /// previously sat at `length - 1`. A zero length leaves the buffer as is.
    pub fn generate(&mut self, length: usize) {
        let length = length.min(PAYLOAD_CAPACITY);
        generate(&mut self.buf, length);
        if length > 0 {
            self.len = length;
        }
    }

    /// Bytes produced by the last `generate`.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

}

/// Fill `buffer[..length]` with the next run of the cyclic sequence.
///
/// `buffer[0]` picks up from `buffer[length - 1]`, so repeated calls with the
/// same length yield an unbroken sequence with period 256.
pub fn generate(buffer: &mut [u8], length: usize) {
    if length == 0 || length > buffer.len() {
        return;
    }
    buffer[0] = buffer[length - 1].wrapping_add(1);
    for i in 1..length {
        buffer[i] = buffer[i - 1].wrapping_add(1);
    }
}
