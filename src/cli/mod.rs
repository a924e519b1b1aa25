pub mod app;
pub mod commands;

pub use app::{echo_dispatcher, App, CallArgs};
pub use commands::{Cli, Commands, ConfigCommand};
