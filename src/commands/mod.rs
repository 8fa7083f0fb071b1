//! CLI subcommand implementations for pm-hub.
//!
//! - [`serve`] - run the hub in the foreground until interrupted
//! - [`status`] - inspect a running hub through its state file
//!
//! # Usage
//!
//! ```ignore
//! use pm_hub::commands;
//!
//! commands::serve::run(options)?;
//! commands::status::run(&project_root)?;
//! ```

pub mod serve;
pub mod status;

/// The current version of pm-hub, derived from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
