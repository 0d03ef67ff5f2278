//! # HYPERDESK Core
//!
//! Domain model for the HYPERDESK daemon.
//!
//! This crate provides:
//! - Immutable value objects: devices, sessions, policies, transfer jobs,
//!   file requests
//! - The pairing manager (one-time codes promoted to authenticated sessions)
//! - The hyperbox directory layout and its filesystem watcher
//! - The app-state signal bus observed by front-ends

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hyperbox;
pub mod models;
pub mod pairing;
pub mod state;
pub mod watcher;

/// Default control-plane port.
pub const CONTROL_PORT: u16 = 8765;
