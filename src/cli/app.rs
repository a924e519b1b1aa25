use crate::config::Config;
use crate::dispatch::{Adapter, DispatchOutcome, IncomingRequest};
use crate::error::Error;
use crate::instance::Instance;
use crate::network::{Endpoint, IncomingConnectionFactory, OutgoingConnectionFactory, Proxy};
use crate::protocol::{OperationMode, ReplyBody};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Command handlers sharing the loaded configuration.
pub struct App {
    /// Effective configuration
    pub config: Config,
    /// File the configuration came from
    pub config_path: PathBuf,
}

impl App {
    /// Load the configuration from `path`, or from the default location
    /// (created with defaults when missing).
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let (config, config_path) = match path {
            Some(path) => (Config::load_from(path)?, path.to_path_buf()),
            None => (
                Config::load_or_create_default().context("Failed to initialize configuration")?,
                Config::default_config_file()?,
            ),
        };
        Ok(Self {
            config,
            config_path,
        })
    }

    /// Configuration file location, without loading it.
    pub fn config_path(path: Option<&Path>) -> Result<PathBuf> {
        match path {
            Some(path) => Ok(path.to_path_buf()),
            None => Config::default_config_file(),
        }
    }

    /// Write a default configuration file.
    pub fn init_config(path: Option<&Path>, force: bool) -> Result<PathBuf> {
        let path = Self::config_path(path)?;
        if path.exists() && !force {
            anyhow::bail!(
                "Configuration already exists at {} (use --force to overwrite)",
                path.display()
            );
        }
        Config::default().save_to(&path)?;
        Ok(path)
    }

    pub fn show_config(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("Failed to serialize configuration")
    }

    /// Run the echo server until `shutdown` is invoked or Ctrl-C.
    pub async fn handle_serve(&self, bind: Option<String>) -> Result<()> {
        let bind = bind.unwrap_or_else(|| self.config.default_bind_addr.clone());
        let endpoint: Endpoint = bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", bind))?;
        let instance = Instance::with_config(self.config.clone())?;

        let shutdown = Arc::new(Notify::new());
        let adapter = Adapter::new("echo", Arc::new(echo_dispatcher(shutdown.clone())));
        let server = IncomingConnectionFactory::bind(instance, endpoint, adapter)
            .await
            .with_context(|| format!("Failed to bind server to address: {}", bind))?;
        server.activate();
        info!("Echo server listening on {}", server.endpoint());

        tokio::select! {
            _ = shutdown.notified() => info!("Shutdown requested by client"),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
            }
        }

        server.destroy();
        server.wait_until_finished().await;
        info!("Server stopped");
        Ok(())
    }

    /// Invoke `operation` and return the reply parameters (empty for one-way).
    pub async fn handle_call(&self, call: CallArgs) -> Result<Vec<u8>> {
        let endpoint: Endpoint = call
            .address
            .parse()
            .with_context(|| format!("Invalid address: {}", call.address))?;
        let endpoint = endpoint
            .with_compress(call.compress)
            .with_timeout(self.config.endpoint_timeout());
        let params = match &call.payload {
            Some(hex_str) => hex::decode(hex_str).context("Payload is not valid hex")?,
            None => Vec::new(),
        };
        let mode = if call.idempotent {
            OperationMode::Idempotent
        } else {
            OperationMode::Normal
        };

        let instance = Instance::with_config(self.config.clone())?;
        let factory = OutgoingConnectionFactory::new(instance);
        let proxy = Proxy::new(factory.clone(), endpoint, call.identity);

        debug!(operation = %call.operation, size = params.len(), oneway = call.oneway, "Invoking");
        let result = if call.oneway {
            proxy
                .invoke_oneway(&call.operation, mode, &params)
                .await
                .map(|_| Vec::new())
        } else {
            proxy.invoke(&call.operation, mode, &params).await
        };

        factory.destroy();
        factory.wait_until_finished().await;
        result.with_context(|| format!("Invocation of `{}` failed", call.operation))
    }
}

/// Arguments of `floe call`.
#[derive(Debug, Clone)]
pub struct CallArgs {
    pub address: String,
    pub operation: String,
    pub identity: String,
    pub payload: Option<String>,
    pub oneway: bool,
    pub compress: bool,
    pub idempotent: bool,
}

/// Dispatcher of the echo server.
pub fn echo_dispatcher(
    shutdown: Arc<Notify>,
) -> impl Fn(IncomingRequest) -> std::result::Result<DispatchOutcome, Error> + Send + Sync {
    move |request: IncomingRequest| {
        debug!(operation = %request.operation(), size = request.params.len(), "Dispatching");
        match request.operation() {
            "echo" => Ok(DispatchOutcome::Reply(ReplyBody::Ok(request.params))),
            "ping" => Ok(DispatchOutcome::Reply(ReplyBody::Ok(Vec::new()))),
            "shutdown" => {
                shutdown.notify_one();
                Ok(DispatchOutcome::Reply(ReplyBody::Ok(Vec::new())))
            }
            other => {
                warn!(operation = other, "Unknown operation");
                Err(Error::OperationNotExist {
                    identity: request.header.identity.clone(),
                    facet: request.header.facet.clone(),
                    operation: other.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::protocol::RequestHeader;
    use tempfile::TempDir;

    fn request(operation: &str, params: &[u8]) -> IncomingRequest {
        IncomingRequest {
            request_id: 1,
            header: RequestHeader::new("echo", operation),
            params: params.to_vec(),
            compress: false,
        }
    }

    #[test]
    fn test_echo_dispatcher() {
        let dispatcher = echo_dispatcher(Arc::new(Notify::new()));
        match dispatcher.dispatch(request("echo", b"abc")) {
            Ok(DispatchOutcome::Reply(ReplyBody::Ok(params))) => assert_eq!(params, b"abc"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(
            dispatcher.dispatch(request("frobnicate", b"")),
            Err(Error::OperationNotExist { .. })
        ));
    }

    #[test]
    fn test_init_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let written = App::init_config(Some(&path), false).unwrap();
        assert_eq!(written, path);
        assert!(App::init_config(Some(&path), false).is_err());
        assert!(App::init_config(Some(&path), true).is_ok());

        let app = App::new(Some(&path)).unwrap();
        assert_eq!(app.config.message_size_max, Config::default().message_size_max);
        assert!(app.show_config().unwrap().contains("message_size_max"));
    }
}
