//! IPv4 address arithmetic over the lease pool.
//!
//! Addresses are treated as their big-endian 32-bit integer value. Adding past
//! `255.255.255.255` wraps around to `0.0.0.0`, the same as unsigned 32-bit
//! arithmetic; pools are validated at startup so this never happens for an
//! in-range offset.

use std::net::Ipv4Addr;

/// Returns `base + n`, carrying across octet boundaries.
///
/// `add_offset(192.168.1.1, 30)` is `192.168.1.31`.
pub fn add_offset(base: Ipv4Addr, n: usize) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).wrapping_add(n as u32))
}

/// Returns how many addresses lie between `start` and `stop`, inclusive.
///
/// The result is zero or negative when `stop` precedes `start`.
pub fn range_count(start: Ipv4Addr, stop: Ipv4Addr) -> i64 {
    i64::from(u32::from(stop)) - i64::from(u32::from(start)) + 1
}

/// Returns the pool offset of `address` for a pool beginning at `start`, or
/// `None` if it lies outside `[0, range_size)`.
pub fn offset_of(start: Ipv4Addr, address: Ipv4Addr, range_size: usize) -> Option<usize> {
    let offset = range_count(start, address) - 1;
    if offset < 0 || offset >= range_size as i64 {
        return None;
    }
    Some(offset as usize)
}
