use anyhow::Result;
use clap::Parser;
use floe::cli::{App, CallArgs, Cli, Commands, ConfigCommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve { bind } => {
            let app = App::new(config_path)?;
            app.handle_serve(bind).await?;
        }
        Commands::Call {
            address,
            operation,
            identity,
            payload,
            oneway,
            compress,
            idempotent,
        } => {
            let app = App::new(config_path)?;
            let call = CallArgs {
                address,
                operation,
                identity,
                payload,
                oneway,
                compress,
                idempotent,
            };
            match app.handle_call(call).await {
                Ok(reply) if oneway => {
                    info!("One-way request sent");
                    debug_assert!(reply.is_empty());
                }
                Ok(reply) => println!("{}", hex::encode(reply)),
                Err(e) => {
                    error!("{:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Config { command } => match command {
            ConfigCommand::Path => {
                let path = App::config_path(config_path)?;
                println!("{}", path.display());
                if !path.exists() {
                    info!("Configuration file does not exist yet; run 'floe config init'");
                }
            }
            ConfigCommand::Show => {
                let app = App::new(config_path)?;
                info!("Configuration loaded from {}", app.config_path.display());
                print!("{}", app.show_config()?);
            }
            ConfigCommand::Init { force } => {
                let path = App::init_config(config_path, force)?;
                info!("Wrote default configuration to {}", path.display());
            }
        },
    }

    Ok(())
}
