//! Error types for the pipeline engine.
//!
//! Mirrors the donor's `thiserror`-based hierarchy (see
//! `lex-processing::error::PreprocessingError`): typed variants for
//! anything a caller might match on, with a boxed-source variant for
//! wrapping arbitrary user errors raised from [`Step`](crate::step::Step)
//! implementations.

use std::fmt;
use thiserror::Error;

/// The error type a [`Step`](crate::step::Step) implementation's `prepare`
/// or `process` may return.
///
/// Step authors don't need to know about this type directly: any error
/// that implements `std::error::Error + Send + Sync + 'static` converts
/// into it via `?`, the way `anyhow::Error` is typically used at a
/// boundary.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct StepError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl StepError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Box::new(err))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self(Box::new(SimpleMessage(message.into())))
    }
}

impl<E> From<E> for StepError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        StepError::new(err)
    }
}

#[derive(Debug)]
struct SimpleMessage(String);

impl fmt::Display for SimpleMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SimpleMessage {}

/// Construction- and registration-time misuse of [`Run`](crate::run::Run).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RunError {
    /// `add_step` was called after `run_to_completion` started.
    #[error("cannot add steps to a Run that is already running")]
    AlreadyRunning,

    /// `run_to_completion` was called with no steps registered.
    #[error("Run has no steps")]
    NoSteps,
}
