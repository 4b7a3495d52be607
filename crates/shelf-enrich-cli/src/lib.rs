//! shelf-enrich command-line front end.

pub mod cli;
pub mod config;
pub mod logging;
