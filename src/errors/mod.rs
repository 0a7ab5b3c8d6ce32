//! Centralized error handling for Syng
//!
//! This module provides the error system shared by the relay service and
//! the playback client. Errors are grouped by the layer they originate in
//! and carry enough context to be logged or surfaced to a user.
//!
//! # Error Categories
//!
//! - **Transport Errors**: websocket connectivity, dropped sessions
//! - **Protocol Errors**: malformed events (logged and dropped)
//! - **Source Errors**: configuration, search and buffering failures of
//!   media sources, isolated to the song or request they concern
//! - **Player Errors**: launching the external player
//! - **Config Errors**: invalid or unreadable configuration files

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;
