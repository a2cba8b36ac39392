//! Beach Pier: a WebSocket bridge between a browser terminal and an
//! interactive shell running inside a container.

pub mod bridge;
pub mod config;
pub mod remote;
pub mod server;
pub mod telemetry;
pub mod title;
