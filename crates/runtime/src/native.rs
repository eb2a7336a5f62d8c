//! Built-in native functions
//!
//! A native is a plain host function `fn(&[Value]) -> Value` registered
//! into the globals table at VM construction. Natives run synchronously
//! and must not allocate managed objects unless they root them first;
//! none of the built-ins allocate.

use std::sync::OnceLock;
use std::time::Instant;

use lox_core::Value;

/// Process-local epoch, captured on first use.
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// `clock()`: monotonic seconds since an arbitrary epoch, as a double.
pub fn clock(_args: &[Value]) -> Value {
    let epoch = EPOCH.get_or_init(Instant::now);
    Value::from(epoch.elapsed().as_secs_f64())
}
