//! `LinkChat`: messaging client with dual-mode chunked image transfer.
//!
//! Text goes over a single persistent message bus connection; images are
//! split into integrity-checked chunks and uploaded over a separate asset
//! channel, either acknowledged chunk by chunk (Reliable) or fire-and-forget
//! (`BestEffort`).

pub mod bus;
pub mod client;
pub mod config;
pub mod conversation;
pub mod delivery;
pub mod directory;
pub mod runtime;
pub mod session;
