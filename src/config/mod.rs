//! Session configuration.
//!
//! The only setting is the reactor backend. It can be chosen in code with
//! [`SessionConfig::reactor`] or from the environment:
//!
//! ```text
//! LOOPBRIDGE_REACTOR=tokio cargo test --features tokio
//! ```

use std::str::FromStr;

use crate::error::Result;
use crate::reactor::ReactorChoice;

/// Environment variable read by [`SessionConfig::from_env`].
pub const REACTOR_ENV: &str = "LOOPBRIDGE_REACTOR";

/// Configuration for a [`Session`](crate::session::Session).
///
/// # Example
///
/// ```rust
/// use loopbridge::config::SessionConfig;
/// use loopbridge::reactor::ReactorChoice;
///
/// let config = SessionConfig::new().reactor(ReactorChoice::Default);
/// assert_eq!(config.reactor, ReactorChoice::Default);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Backend installed when the session starts.
    pub reactor: ReactorChoice,
}

impl SessionConfig {
    /// Create a new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the reactor backend.
    #[must_use]
    pub fn reactor(mut self, choice: ReactorChoice) -> Self {
        self.reactor = choice;
        self
    }

    /// Reads the backend from `LOOPBRIDGE_REACTOR`, falling back to the
    /// default backend when the variable is unset or empty.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownReactor`](crate::Error::UnknownReactor) if the
    /// variable names no known backend.
    pub fn from_env() -> Result<Self> {
        Self::from_env_value(std::env::var(REACTOR_ENV).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Result<Self> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(name) => {
                let choice = ReactorChoice::from_str(name)?;
                tracing::debug!(reactor = %choice, "reactor selected from {}", REACTOR_ENV);
                Ok(Self::new().reactor(choice))
            }
        }
    }
}
