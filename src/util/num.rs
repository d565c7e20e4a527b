/// Round up `n` to the nearest `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// Bytes to (floating) megabytes, the unit every report summary uses.
pub fn mib(bytes: usize) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

/// Bytes to (floating) kilobytes
pub fn kib(bytes: usize) -> f64 {
    bytes as f64 / 1024.0
}
