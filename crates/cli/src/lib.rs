//! Library side of the `rampart` binary: plan files, command-driven
//! adapters and the subcommand implementations.

pub mod adapters;
pub mod cmd;
pub mod logging;
pub mod plan;
pub mod prompt;
pub mod util;
