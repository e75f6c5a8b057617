//! TCP transport: accept loop, per-connection framing and dispatch.

pub mod connection;
pub mod server;

pub use server::{serve, start_server, ServerContext};
