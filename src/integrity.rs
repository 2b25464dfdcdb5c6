/// Count bytes that break the successor relation `b[i] == b[i-1] + 1`.
///
/// Only continuity inside `data` is checked; byte 0 is not compared with the
/// tail of the previous delivery.
pub fn validate(data: &[u8]) -> u64 {
    data.windows(2)
        .filter(|w| w[1] != w[0].wrapping_add(1))
        .count() as u64
}
