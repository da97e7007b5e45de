//! Streaming chat relay: per-session query serialization, incremental output
//! streaming over one HTTP exchange, and live-data tools for the agent.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod relay;
pub mod router;
pub mod runtime;
pub mod session;
pub mod tools;
