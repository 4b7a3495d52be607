//! Subcommand implementations for the `shelf-enrich` binary.

pub mod doctor;
pub mod ip_cmd;
pub mod progress;
pub mod run_cmd;
