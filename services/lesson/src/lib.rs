//! Lesson runtime library crate
//!
//! Everything the `lesson` binary wires together: environment configuration,
//! the REST backend client, the frame producer and the lesson event loop. The
//! binary itself is a thin wrapper around this library.

pub mod api;
pub mod config;
pub mod frames;
pub mod models;
pub mod session;
pub mod state;
