//! # fiscal-daemon
//!
//! HTTP surface of the authorization engine. The binary in `main.rs` wires
//! configuration, database, engine and scheduler; this library holds the
//! router so it can be exercised without a socket.

pub mod api;
pub mod error;

pub use api::{router, AppState};
pub use error::ApiError;
