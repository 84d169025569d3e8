//! Request and command id generation.
//!
//! Both schemes embed a nanosecond timestamp drawn from a process-wide
//! monotonically non-decreasing clock, so ids sort by issue order even when
//! the wall clock steps backwards.  Collisions are broken by random digits;
//! a collision reaching the correlator is a programmer error and is dropped
//! there with a warning.

use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};

static LAST_NANOS: AtomicI64 = AtomicI64::new(0);

/// Wall-clock nanoseconds, bumped to stay strictly increasing within this
/// process even when calls land inside one clock tick.
fn monotonic_nanos() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    let mut prev = LAST_NANOS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(prev + 1);
        match LAST_NANOS.compare_exchange_weak(
            prev,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(observed) => prev = observed,
        }
    }
}

/// A fresh server-side correlation key: `req_<nanoseconds><4 random digits>`.
pub fn request_id() -> String {
    let digits: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("req_{}{:04}", monotonic_nanos(), digits)
}

/// A client-assigned command id: `cmd_<nanoseconds>_<connection-suffix>`.
pub fn command_id(connection_id: &str) -> String {
    format!("cmd_{}_{}", monotonic_nanos(), connection_id)
}
