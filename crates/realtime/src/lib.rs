//! Streaming client for the sign-inference backend.
//!
//! - `protocol`: the JSON messages exchanged over the socket.
//! - `machine`: the connection state machine, free of any I/O.
//! - `client`: the tokio driver that runs the machine against a real socket.

pub mod client;
pub mod error;
pub mod machine;
pub mod protocol;

pub use client::{ClientConfig, StreamingInferenceClient};
pub use error::ClientError;
pub use machine::{ClientEvent, ConnectionMachine, ConnectionState, Effect};
