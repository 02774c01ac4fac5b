// src/macros.rs

//
// Logging macros
//
// logging feature enabled → tracing
// logging feature disabled → only log_error / log_critical print to stderr;
// the others still type-check their arguments and expand to a unit block
//
// Call sites use plain format strings only, so the same invocation works
// with either expansion.
//

#![allow(unused_macros)]

// --------------------
// CRITICAL
// --------------------

// tracing has no level above ERROR; critical entries are errors tagged with
// `critical = true` so subscribers and log scrapers can tell them apart.
#[cfg(feature = "logging")]
macro_rules! log_critical {
    ($($arg:tt)*) => {
        tracing::error!(critical = true, $($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_critical {
    ($($arg:tt)*) => {
        eprintln!("CRITICAL: {}", format_args!($($arg)*))
    };
}

// --------------------
// ERROR
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*)
    };
}

// --------------------
// WARN
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

// --------------------
// INFO
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

// --------------------
// DEBUG
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

pub(crate) use log_critical;
pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
