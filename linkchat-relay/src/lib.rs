//! `LinkChat` relay library.
//!
//! Exposes the message bus and asset service for embedding and tests.

pub mod assets;
pub mod bus;
pub mod config;
pub mod store;
