//! Storage infrastructure: configuration and key files.
//!
//! The `config` sub-module handles:
//!
//! - Reading the TOML configuration file named on the command line.
//! - Providing sensible defaults when the file, or any field in it, is absent.
//! - Loading the shared authentication key that clients must present.

pub mod config;
