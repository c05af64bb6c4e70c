//! Reply Relay: human-in-the-loop email reply orchestrator.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod store;
pub mod workflow;
