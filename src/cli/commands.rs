use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "floe")]
#[command(about = "Request/reply messaging over tcp and udp connections")]
pub struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an echo server
    ///
    /// The `echo` operation returns its parameters, `ping` returns nothing
    /// and `shutdown` stops the server.
    ///
    /// Example: floe serve --bind 127.0.0.1:10000
    Serve {
        /// Endpoint to listen on, e.g. `127.0.0.1:10000` or `udp://0.0.0.0:10000`.
        /// Defaults to the configured bind address.
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Invoke an operation on a remote object
    ///
    /// Examples:
    ///   floe call 127.0.0.1:10000 echo --payload 68656c6c6f
    ///   floe call 127.0.0.1:10000 shutdown --oneway
    Call {
        /// Endpoint of the server
        address: String,
        /// Operation name
        operation: String,
        /// Identity of the target object
        #[arg(short, long, default_value = "echo")]
        identity: String,
        /// Parameters as hex
        #[arg(short, long)]
        payload: Option<String>,
        /// Do not wait for a reply
        #[arg(long)]
        oneway: bool,
        /// Compress the request
        #[arg(long)]
        compress: bool,
        /// Mark the operation idempotent so it may be retried after a send
        #[arg(long)]
        idempotent: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the configuration file location
    Path,
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
