//! This module provides a built-in logger implementation.
//!
//! The built-in logger implementation uses the `env_logger` crate. It is
//! enabled by the Cargo feature "builtin_env_logger" which is enabled by
//! default. When enabled, it is initialized in [`crate::api::init`] and
//! shows logs of level WARN or lower (the lower, the more important), so
//! the allocator stays quiet unless something is wrong. Embedders that
//! already configure the `log` crate can disable the feature and register
//! their own implementation.

/// Attempt to init an env_logger for the allocator.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show warnings and errors only.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"),
            );

            match result {
                Ok(()) => {
                    debug!("isoheap initialized the logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` only means a logger was already installed.
                    debug!("isoheap failed to initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("isoheap didn't initialize the built-in env_logger.  The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
