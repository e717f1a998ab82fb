//! WebSocket support for real-time sync.
//!
//! Clients connect via WebSocket as an alternative to HTTP polling and get a
//! `changes_available` notice whenever another replica's push is accepted.

mod manager;

pub use manager::ConnectionManager;
