//! Network transport for windows.
//!
//! Clients connect over WebSocket; see [`ws`] for the query format and
//! close codes.

mod ws;

pub use ws::{serve, ConnectRequest, RELOAD_CLOSE_CODE};
