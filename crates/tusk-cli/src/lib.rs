//! # Tusk CLI
//!
//! Drives the upload engine from the command line. Every invocation opens the
//! data root, runs one command and writes the tree snapshot back, so an upload
//! can be created, fed and finished across separate processes.

pub mod commands;
pub mod config;
pub mod state;

pub use commands::{run, Command};
pub use config::load_config;
pub use state::AppState;
