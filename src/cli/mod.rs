//! Command-line interface: argument parsing and output formatting.

pub mod commands;
pub mod output;
