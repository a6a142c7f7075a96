//! Courier — chat-driven download orchestration.

pub mod command;
pub mod config;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod orchestrator;
pub mod session;
