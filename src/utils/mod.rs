//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `pricecast` application.
//!
//! It holds the crate-wide error type and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{PriceCastError, Result};

#[cfg(test)]
mod tests;
