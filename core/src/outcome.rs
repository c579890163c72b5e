//! Success-or-failure wrapper shared by stages and handlers.
//!
//! [`Outcome`] is the value every stage, validator, handler and processor hands back
//! to the pipeline. Expected failure paths (a rejected amount, a missing handler) travel
//! as [`Outcome::Failure`] with a human-readable message instead of as Rust errors, so
//! the executor can short-circuit and report without unwinding anything.
//!
//! # Example
//!
//! ```
//! use bks_pipeline_core::outcome::Outcome;
//!
//! let amount = -5;
//! let checked: Outcome<i64> = if amount > 0 {
//!     Outcome::Success(amount)
//! } else {
//!     Outcome::failure("amount must be positive")
//! };
//!
//! assert_eq!(checked.error(), Some("amount must be positive"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Either a success value or a failure message. Never both, never neither.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum Outcome<T> {
    /// The operation produced a value.
    Success(T),
    /// The operation failed with the given message.
    Failure(String),
}

impl<T> Outcome<T> {
    /// Build a failure from anything that renders as a message.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }

    /// Returns `true` for [`Outcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns `true` for [`Outcome::Failure`].
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Borrow the success value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    /// Borrow the failure message, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Failure(message) => Some(message),
        }
    }

    /// Transform the success value, leaving failures untouched.
    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Success(value) => Outcome::Success(f(value)),
            Self::Failure(message) => Outcome::Failure(message),
        }
    }

    /// Chain another fallible step onto a success.
    pub fn and_then<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> Outcome<U>,
    {
        match self {
            Self::Success(value) => f(value),
            Self::Failure(message) => Outcome::Failure(message),
        }
    }

    /// Rewrite the failure message, leaving successes untouched.
    #[must_use]
    pub fn map_failure<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        match self {
            Self::Success(value) => Self::Success(value),
            Self::Failure(message) => Self::Failure(f(message)),
        }
    }

    /// Convert into a standard [`Result`] with the message as the error.
    ///
    /// # Errors
    ///
    /// Returns the failure message when this is [`Outcome::Failure`].
    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(message) => Err(message),
        }
    }
}

impl<T, E: fmt::Display> From<Result<T, E>> for Outcome<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) => Self::Failure(e.to_string()),
        }
    }
}

impl<T: fmt::Debug> fmt::Display for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(value) => write!(f, "Success({value:?})"),
            Self::Failure(message) => write!(f, "Failure({message})"),
        }
    }
}
