//! # HYPERDESK Daemon
//!
//! The orchestrator: binds discovery, pairing, the hyperbox watcher, the
//! transfer engine, persistence, and the control plane into one running
//! daemon, and converts events into protocol messages and state updates.
//!
//! Component graph (acyclic; the control server reaches back only through a
//! handler function value):
//!
//! ```text
//! Controller ──> PairingManager / Store / Discovery / Hyperbox / Watcher
//!      │
//!      ├──> ControlServer ──(handler fn)──> Controller (weak)
//!      └──> transfer workers (spawn_blocking) ──> AppState bus
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
pub mod requests;
pub mod settings;

pub use controller::{Controller, ControllerConfig, ControllerError};
pub use settings::TransferSettings;
