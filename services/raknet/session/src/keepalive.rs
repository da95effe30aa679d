//! Connected ping/pong timestamps and RTT measurement.
//!
//! Timestamps on the wire are milliseconds on a process-wide monotonic clock,
//! so an echoed ping time can be turned back into an elapsed duration.

use bytes::Bytes;
use once_cell::sync::Lazy;
use raknet_wire::{ConnectedPing, ConnectedPong, Packet};
use std::time::{Duration, Instant};

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed on the process clock at `now`
pub fn millis_at(now: Instant) -> u64 {
    now.saturating_duration_since(*START).as_millis() as u64
}

/// Build a connected ping stamped with `now`
pub fn build_ping(now: Instant) -> Bytes {
    Packet::ConnectedPing(ConnectedPing {
        ping_time: millis_at(now) as i64,
    })
    .to_bytes()
}

/// Build the pong answering a ping sent at `ping_time`
pub fn build_pong(ping_time: i64, now: Instant) -> Bytes {
    Packet::ConnectedPong(ConnectedPong {
        ping_time,
        pong_time: millis_at(now) as i64,
    })
    .to_bytes()
}

/// Round-trip time from a pong echoing our ping time
pub fn rtt_from_pong(pong: &ConnectedPong, now: Instant) -> Option<Duration> {
    let sent = u64::try_from(pong.ping_time).ok()?;
    let elapsed = millis_at(now).checked_sub(sent)?;
    Some(Duration::from_millis(elapsed))
}
