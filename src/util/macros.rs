/// Abort with a diagnostic line.
///
/// Every detected anomaly is treated as adversarial; nothing is recovered.
/// The message goes through the `log` facade first so embedders with a
/// configured logger capture it, then the process panics with the same
/// line.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        error!($($arg)*);
        panic!($($arg)*);
    }};
}
