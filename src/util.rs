//! Timing helpers for the realtime audio threads

/// Debug log prefixed with wall-clock milliseconds and the current thread name.
///
/// Capture and render run on their own OS threads, so the thread name is what
/// tells the two audio clocks apart in a trace.
#[macro_export]
macro_rules! tdbg {
    ($($arg:tt)*) => {{
        use std::time::{SystemTime, UNIX_EPOCH};
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        tracing::debug!(
            "[{:>11} ms][{}] {}",
            ms,
            std::thread::current().name().unwrap_or("unnamed"),
            format_args!($($arg)*)
        );
    }};
}
