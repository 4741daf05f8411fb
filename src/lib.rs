//! Streamrelay - live media relay
//!
//! This library crate exposes the core functionality for integration testing.

pub mod config;
pub mod error;
pub mod server;
pub mod settings;
pub mod streaming;

pub use error::RelayError;
