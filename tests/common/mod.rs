//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Once;

use loopbridge::prelude::*;

static INIT_LOGGING: Once = Once::new();

/// Installs a test-writer subscriber once per test binary.
///
/// Filtered by `RUST_LOG`, `loopbridge=debug` when unset.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("loopbridge=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .try_init();
    });
}

/// A session on the built-in reactor.
pub fn session() -> Session {
    init_test_logging();
    Session::start(SessionConfig::default()).unwrap()
}

/// A plain test body that does nothing.
pub fn noop() -> MarkedCallable {
    MarkedCallable::plain(|_request, _args| ())
}

/// A plain test body reading fixture `name` and comparing it with
/// `expected`.
pub fn expects(name: &'static str, expected: u32) -> MarkedCallable {
    MarkedCallable::plain(move |_request, args| {
        assert_eq!(args.cloned::<u32>(name)?, expected);
        Ok::<_, Failure>(())
    })
}
