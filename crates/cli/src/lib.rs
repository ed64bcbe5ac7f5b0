//! The `tether` binary: runs the session supervisor and talks to a running one.

pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod sinks;
pub mod status;
