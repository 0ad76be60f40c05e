#[cfg(feature = "trace")]
#[macro_export]
macro_rules! hub_trace {
    ($($arg:tt)*) => {
        ::tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "trace"))]
#[macro_export]
macro_rules! hub_trace {
    ($($arg:tt)*) => {};
}
