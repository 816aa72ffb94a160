//! Optimistic-lock tokens.

use nodeorm_core::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST: AtomicI64 = AtomicI64::new(0);

/// A fresh lock token.
///
/// Tokens are microseconds since the epoch, bumped past the previous token
/// when the clock stalls or steps back, so every call in this process
/// returns a strictly larger value.
pub fn next_token() -> Value {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX));
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev.saturating_add(1));
        match LAST.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return Value::BigInt(next),
            Err(actual) => prev = actual,
        }
    }
}
