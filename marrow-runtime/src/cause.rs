//! # Failure Causes
//!
//! Every effect ends in an [`Exit`]: either a success value or a [`Cause`]
//! describing why it did not succeed.
//!
//! ## Design
//!
//! Three kinds of non-success are kept apart:
//! - **Fail**: an expected, typed failure raised with `Effect::fail`
//! - **Die**: a [`Defect`], i.e. a panic in user code or a broken runtime
//!   invariant; never part of the typed error channel
//! - **Interrupt**: the fiber was asked to stop by another fiber
//!
//! Typed recovery (`catch_all`, `map_error`, `retry`) only ever sees `Fail`.

use std::fmt;

use thiserror::Error;

use crate::fiber::FiberId;

/// An unexpected error: a panic captured from user code or a violated
/// runtime invariant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("{message}")]
pub struct Defect {
    message: String,
}

impl Defect {
    /// Create a defect with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn type_mismatch(expected: &str) -> Self {
        Self::new(format!("runtime value is not a `{}`", expected))
    }
}

/// Why an effect did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// An expected failure from the typed error channel.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// The fiber was interrupted by the given fiber.
    Interrupt(FiberId),
}

impl<E> Cause<E> {
    /// Returns true if this is a typed failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Cause::Fail(_))
    }

    /// Returns true if this is a defect.
    pub fn is_defect(&self) -> bool {
        matches!(self, Cause::Die(_))
    }

    /// Returns true if this is an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Cause::Interrupt(_))
    }

    /// The typed failure, if any.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Cause::Fail(e) => Some(e),
            _ => None,
        }
    }

    /// The defect, if any.
    pub fn defect(&self) -> Option<&Defect> {
        match self {
            Cause::Die(d) => Some(d),
            _ => None,
        }
    }

    /// Transform the typed failure, leaving defects and interruptions alone.
    pub fn map<E2, F>(self, f: F) -> Cause<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
        }
    }

    /// Split off the typed failure; anything else is re-typed for `E2`.
    pub fn split<E2>(self) -> Result<E, Cause<E2>> {
        match self {
            Cause::Fail(e) => Ok(e),
            Cause::Die(d) => Err(Cause::Die(d)),
            Cause::Interrupt(id) => Err(Cause::Interrupt(id)),
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Fail(e) => write!(f, "failed: {:?}", e),
            Cause::Die(d) => write!(f, "died: {}", d),
            Cause::Interrupt(id) => write!(f, "interrupted by {}", id),
        }
    }
}

/// The final outcome of running an effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit<A, E> {
    /// The effect produced a value.
    Success(A),
    /// The effect did not produce a value.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// Returns true on success.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// Returns true if the effect failed with a typed error.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(Cause::Fail(_)))
    }

    /// Returns true if the effect died with a defect.
    pub fn is_defect(&self) -> bool {
        matches!(self, Exit::Failure(Cause::Die(_)))
    }

    /// Returns true if the effect was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Failure(Cause::Interrupt(_)))
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The cause, if the effect did not succeed.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(c) => Some(c),
        }
    }

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Exit<B, E>
    where
        F: FnOnce(A) -> B,
    {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(c) => Exit::Failure(c),
        }
    }

    /// Convert into a standard `Result`.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c) => Err(c),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::Failure(Cause::Fail(e)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_predicates() {
        let fail: Cause<&str> = Cause::Fail("boom");
        let die: Cause<&str> = Cause::Die(Defect::new("bug"));
        let interrupt: Cause<&str> = Cause::Interrupt(FiberId(7));

        assert!(fail.is_failure() && !fail.is_defect());
        assert!(die.is_defect() && !die.is_interrupted());
        assert!(interrupt.is_interrupted() && !interrupt.is_failure());
        assert_eq!(fail.failure(), Some(&"boom"));
        assert_eq!(die.defect().map(Defect::message), Some("bug"));
    }

    #[test]
    fn test_cause_map_leaves_defects() {
        let die: Cause<i32> = Cause::Die(Defect::new("bug"));
        assert_eq!(die.map(|n| n + 1), Cause::Die(Defect::new("bug")));
        assert_eq!(Cause::Fail(1).map(|n| n + 1), Cause::Fail(2));
    }

    #[test]
    fn test_cause_split() {
        assert_eq!(Cause::Fail(3).split::<String>(), Ok(3));
        let split: Result<i32, Cause<String>> = Cause::Interrupt(FiberId(2)).split();
        assert_eq!(split, Err(Cause::Interrupt(FiberId(2))));
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(Cause::Fail("x").to_string(), "failed: \"x\"");
        assert_eq!(
            Cause::<()>::Interrupt(FiberId(4)).to_string(),
            "interrupted by Fiber(4)"
        );
    }

    #[test]
    fn test_exit_conversions() {
        let ok: Exit<i32, String> = Ok(5).into();
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&5));
        assert_eq!(ok.map(|n| n * 2).into_result(), Ok(10));

        let err: Exit<i32, String> = Err("no".to_string()).into();
        assert!(err.is_failure());
        assert_eq!(err.cause().and_then(Cause::failure).map(String::as_str), Some("no"));
    }
}
