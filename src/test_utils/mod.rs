//! Shared helpers for the unit tests.
mod common;

pub use common::*;
