//! Shared test support

pub mod utils;
