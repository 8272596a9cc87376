//! CLI Module
//!
//! Exit codes shared by the command-line tool

pub mod exit_codes;

pub use exit_codes::{exit_code_description, CliResult, ExitCodes};
