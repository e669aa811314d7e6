//! Fatal invariant assertions
//!
//! `check!` aborts the process when a runtime invariant is violated; it is
//! the last line of defense and always enabled. `debug_check!` compiles out
//! of release builds and guards hot paths.

/// Abort the process with a diagnostic when an invariant does not hold.
#[macro_export]
macro_rules! check {
    ($cond:expr) => {
        if !$cond {
            $crate::diagnostics::dump_debug_state();
            panic!("runtime invariant violated: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::diagnostics::dump_debug_state();
            panic!($($arg)+);
        }
    };
}

/// Abort the process unconditionally.
#[macro_export]
macro_rules! fail {
    ($($arg:tt)+) => {{
        $crate::diagnostics::dump_debug_state();
        panic!($($arg)+);
    }};
}

/// Debug-build-only invariant check.
#[macro_export]
macro_rules! debug_check {
    ($($arg:tt)+) => {
        debug_assert!($($arg)+)
    };
}
