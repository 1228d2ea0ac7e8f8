//! # loopbridge
//!
//! > Drive event-loop-bound tests and fixtures from a synchronous test harness
//!
//! **loopbridge** lets a synchronous test runner call test bodies and
//! fixtures whose execution belongs to a single-threaded event loop. The
//! loop runs on its own driving context; the caller hands control to it and
//! sleeps until the work it submitted has produced a value or a failure.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use loopbridge::prelude::*;
//! use std::time::Duration;
//!
//! #[loopbridge::test]
//! async fn test_answer(request: Request) {
//!     let answer = request.reactor().defer_later(Duration::from_millis(10), || Ok(42));
//!     assert_eq!(answer.await?, 42);
//! }
//! ```
//!
//! Or drive the lifecycle directly, the way a harness does:
//!
//! ```rust
//! use loopbridge::prelude::*;
//!
//! let mut session = Session::start(SessionConfig::from_env().unwrap()).unwrap();
//! let item = TestItem::new("test_plain", MarkedCallable::plain(|_request, _args| Ok::<_, Failure>(42))).unwrap();
//! session.run_item(&item).assert_passed();
//! session.finish();
//! ```
//!
//! ## Features
//!
//! - **Blocking bridge** - `block_on` any pending value from the caller
//! - **Deferreds** - callback chains, generator-style and `async` bodies
//! - **Fixture lifecycle** - async and async-yield fixtures with ordered teardown
//! - **Backends** - the built-in loop, tokio (`tokio` feature) or smol (`smol` feature)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod bridge;

pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod lifecycle;
pub mod reactor;
pub mod session;
pub mod value;

/// Prelude for convenient imports
///
/// ```rust
/// use loopbridge::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::context::{LoopContext, LoopHandle};
    pub use crate::deferred::{ensure_deferred, inline_callbacks, run_on_loop, Deferred, DeferredResult, Step};
    pub use crate::error::{Error, Failure, Result};
    pub use crate::lifecycle::{
        Args, FixtureDef, ItemOutcome, ItemReport, MarkedCallable, Request, Scope, Summary, TestItem,
    };
    pub use crate::reactor::{ReactorChoice, ReactorHandle};
    pub use crate::session::Session;
    pub use crate::value::Value;
}

// Re-exports
pub use deferred::Deferred;
pub use error::{Error, Failure, Result};
pub use session::Session;
pub use value::Value;

// Re-export the test macro when macros feature is enabled
#[cfg(feature = "macros")]
pub use loopbridge_macros::test;
