#![allow(unused_macros)]
//! Diagnostics emitted by the agent itself.
//!
//! **Note**: these macros (`sniffer_debug!`, `sniffer_info!`, `sniffer_warn!`
//! and `sniffer_error!`) are meant for code *inside* the agent and for custom
//! reporters or sinks. They are not an application logging facility.
//!
//! With the `internal-logs` feature the events are forwarded to `tracing`
//! using the calling crate name as target. Under `cfg(test)` they are also
//! printed, which helps when running tests with `--nocapture`. Without either,
//! the arguments are evaluated and discarded.

/// Shared expansion of the leveled macros below.
#[doc(hidden)]
#[macro_export]
macro_rules! __sniffer_log {
    ($level:ident, $label:literal, $name:expr $(, $key:ident = $value:expr)*) => {{
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::$level!(
                name: $name,
                target: env!("CARGO_PKG_NAME"),
                name = $name
                $(, $key = $value)*
            );
        }

        #[cfg(test)]
        {
            print!("{}: name={}", $label, $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )*
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name $(, $value)*);
        }
    }};
}

/// Logs an informational event.
///
/// # Example:
/// ```rust
/// use sniffer::sniffer_info;
/// sniffer_info!(name: "Agent.Started", service = "checkout");
/// ```
#[macro_export]
macro_rules! sniffer_info {
    (name: $name:expr $(,)?) => {
        $crate::__sniffer_log!(info, "sniffer_info", $name)
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        $crate::__sniffer_log!(info, "sniffer_info", $name $(, $key = $value)+)
    };
}

/// Logs a warning. Used for conditions that lose trace data.
///
/// # Example:
/// ```rust
/// use sniffer::sniffer_warn;
/// sniffer_warn!(name: "SegmentBuffer.Full", dropped = 1u64);
/// ```
#[macro_export]
macro_rules! sniffer_warn {
    (name: $name:expr $(,)?) => {
        $crate::__sniffer_log!(warn, "sniffer_warn", $name)
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        $crate::__sniffer_log!(warn, "sniffer_warn", $name $(, $key = $value)+)
    };
}

/// Logs a debug event.
///
/// # Example:
/// ```rust
/// use sniffer::sniffer_debug;
/// sniffer_debug!(name: "Dispatcher.BatchSent", size = 12u64);
/// ```
#[macro_export]
macro_rules! sniffer_debug {
    (name: $name:expr $(,)?) => {
        $crate::__sniffer_log!(debug, "sniffer_debug", $name)
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        $crate::__sniffer_log!(debug, "sniffer_debug", $name $(, $key = $value)+)
    };
}

/// Logs an error. Reserved for conditions an operator must act on.
///
/// # Example:
/// ```rust
/// use sniffer::sniffer_error;
/// sniffer_error!(name: "Dispatcher.WorkerSpawnFailed", error = "resource limit");
/// ```
#[macro_export]
macro_rules! sniffer_error {
    (name: $name:expr $(,)?) => {
        $crate::__sniffer_log!(error, "sniffer_error", $name)
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        $crate::__sniffer_log!(error, "sniffer_error", $name $(, $key = $value)+)
    };
}
