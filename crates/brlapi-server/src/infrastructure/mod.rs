//! Infrastructure layer for the BrlAPI server.
//!
//! Contains OS-facing adapters: listening sockets and client sessions, the
//! braille driver and host console, and configuration files.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `brlapi_core`.  The application layer only reaches in here for the driver
//! and host-console traits it is parameterised over.

pub mod driver;
pub mod network;
pub mod storage;
