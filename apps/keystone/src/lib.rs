//! # Keystone CLI Library
//!
//! Configuration loading and command implementations behind the `keystone`
//! binary, exposed as a library for integration tests.

pub mod cli;
pub mod config;

pub use config::{KeystoneConfig, RateLimitConfig, RemoteConfig};
