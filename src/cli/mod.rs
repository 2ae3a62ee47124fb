//! Command-line interface for priority_scheduler.
//!
//! Provides commands for running a scheduler node, registering and
//! deregistering agents, and inspecting queue state.

mod commands;

pub use commands::{
    collect_status, parse_cli, run, run_with_cli, AgentStatus, Cli, Commands, StatusReport,
};
