//! relaydm CLI library
//!
//! Configuration, application wiring and command handlers for the `relaydm`
//! binary.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::RelaydmApp;
pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::AppConfig;
pub use error::{CliError, Result};
