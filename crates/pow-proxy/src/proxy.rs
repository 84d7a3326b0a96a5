// PoW Proxy - Ethereum JSON-RPC relay
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Proxy supervisor
//!
//! Resolves both upstream endpoints once, binds the HTTP relay (mandatory) and
//! the WebSocket relay (optional), runs them as two supervised tasks and joins
//! them. Configuration errors are fatal, with one exception: a provider that
//! has no websocket endpoint degrades the proxy to HTTP-only mode.

use crate::{
    config::{non_empty, ConfigError, ProviderMode, ProviderType, ProxyConfig, Transport},
    providers::{self, ResolvedEndpoint},
    rpc::HttpRelay,
    ws::WsRelay,
};
use eyre::Result;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

/// Default local HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 8545;
/// Default local WebSocket port
pub const DEFAULT_WS_PORT: u16 = 8546;
/// Default network for hosted providers
pub const DEFAULT_NETWORK: &str = "goerli";
/// Default per-request upstream timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// Default cap on HTTP request bodies (32 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Builder for configuring ProxyServer with fluent API and sensible defaults
#[derive(Debug, Clone)]
pub struct ProxyServerBuilder {
    provider_type: String,
    network: String,
    project_id: String,
    http_provider_url: Option<String>,
    ws_provider_url: Option<String>,
    host: IpAddr,
    http_port: u16,
    ws_port: u16,
    request_timeout: u64,
    max_body_size: usize,
}

impl Default for ProxyServerBuilder {
    fn default() -> Self {
        Self {
            // Provider Configuration
            provider_type: ProviderType::Infura.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            project_id: String::new(),
            http_provider_url: None,
            ws_provider_url: None,

            // Listener Configuration
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: DEFAULT_HTTP_PORT,
            ws_port: DEFAULT_WS_PORT,

            // Relay Configuration
            request_timeout: DEFAULT_TIMEOUT_SECS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ProxyServerBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hosted provider type (`infura` or `pocket`)
    pub fn provider_type<S: Into<String>>(mut self, provider_type: S) -> Self {
        self.provider_type = provider_type.into();
        self
    }

    /// Set the named network for hosted providers
    pub fn network<S: Into<String>>(mut self, network: S) -> Self {
        self.network = network.into();
        self
    }

    /// Set the hosted provider credential (Infura project ID or Pocket app ID)
    pub fn project_id<S: Into<String>>(mut self, project_id: S) -> Self {
        self.project_id = project_id.into();
        self
    }

    /// Set an explicit HTTP upstream; selects direct-URL mode
    pub fn http_provider_url<S: Into<String>>(mut self, url: S) -> Self {
        self.http_provider_url = Some(url.into());
        self
    }

    /// Set an explicit WebSocket upstream
    pub fn ws_provider_url<S: Into<String>>(mut self, url: S) -> Self {
        self.ws_provider_url = Some(url.into());
        self
    }

    /// Set the address both listeners bind to
    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Set the local HTTP port (0 picks a free port)
    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Set the local WebSocket port (0 picks a free port)
    pub fn ws_port(mut self, port: u16) -> Self {
        self.ws_port = port;
        self
    }

    /// Set the per-request upstream timeout in seconds
    pub fn request_timeout(mut self, seconds: u64) -> Self {
        self.request_timeout = seconds;
        self
    }

    /// Set the largest accepted HTTP request body in bytes
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Validate the settings into an immutable [`ProxyConfig`]
    ///
    /// An explicit HTTP URL selects direct-URL mode; otherwise the provider
    /// type decides how endpoints are composed.
    pub fn config(self) -> Result<ProxyConfig, ConfigError> {
        let http_provider_url = non_empty(self.http_provider_url);
        let ws_provider_url = non_empty(self.ws_provider_url);

        if self.request_timeout == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        let request_timeout = Duration::from_secs(self.request_timeout);

        let mode = if http_provider_url.is_some() {
            ProviderMode::DirectUrl
        } else {
            self.provider_type.parse::<ProviderType>()?.into()
        };

        Ok(ProxyConfig {
            mode,
            network: self.network.trim().to_string(),
            project_id: self.project_id.trim().to_string(),
            http_provider_url,
            ws_provider_url,
            host: self.host,
            http_port: self.http_port,
            ws_port: self.ws_port,
            request_timeout,
            max_body_size: self.max_body_size,
        })
    }

    /// Build the ProxyServer with the configured settings
    pub fn build(self) -> Result<ProxyServer, ConfigError> {
        ProxyServer::new(self.config()?)
    }
}

/// Supervisor for the HTTP and WebSocket relays
///
/// Use ProxyServerBuilder for easy configuration:
/// ```no_run
/// # use pow_proxy::proxy::ProxyServerBuilder;
/// # async fn example() -> eyre::Result<()> {
/// let proxy = ProxyServerBuilder::new()
///     .provider_type("infura")
///     .network("mainnet")
///     .project_id("0123456789abcdef")
///     .build()?;
/// proxy.serve().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    http_endpoint: ResolvedEndpoint,
    ws_endpoint: Option<ResolvedEndpoint>,
    /// Shutdown flag; late subscribers still observe an earlier shutdown
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ProxyServer {
    /// Resolve both endpoints for `config`
    ///
    /// HTTP resolution errors are returned as-is. A provider without a
    /// websocket endpoint (and no explicit WS URL) leaves the proxy in
    /// HTTP-only mode; any other websocket error is returned.
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        let http_endpoint = providers::resolve(&config, Transport::Http)?;

        let ws_endpoint = match providers::resolve(&config, Transport::Ws) {
            Ok(endpoint) => Some(endpoint),
            Err(e) if config.ws_provider_url.is_none() && e.is_degradable() => {
                warn!("No websocket URL provided, running in HTTP-only mode ({})", e);
                None
            }
            Err(e) => return Err(e),
        };

        info!(mode = %config.mode, "Upstream HTTP endpoint: {}", http_endpoint.redacted());
        if let Some(chain) = http_endpoint.chain() {
            info!(chain_id = chain.id(), "Serving chain {}", chain);
        }
        if let Some(ws) = &ws_endpoint {
            info!(mode = %config.mode, "Upstream WebSocket endpoint: {}", ws.redacted());
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            http_endpoint,
            ws_endpoint,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    /// The configuration this server was built from
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Resolved HTTP upstream
    pub fn http_endpoint(&self) -> &ResolvedEndpoint {
        &self.http_endpoint
    }

    /// Resolved WebSocket upstream, if the proxy is not HTTP-only
    pub fn ws_endpoint(&self) -> Option<&ResolvedEndpoint> {
        self.ws_endpoint.as_ref()
    }

    /// Ask both relays to stop accepting connections
    ///
    /// Relays spawned after this call stop immediately.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Bind both listeners and start both relays as supervised tasks
    ///
    /// Fails if the HTTP port cannot be bound. A WebSocket bind failure is
    /// logged and leaves the proxy serving HTTP only.
    pub async fn spawn(&self) -> Result<ProxyHandle> {
        let config = &self.config;

        let http_addr = SocketAddr::new(config.host, config.http_port);
        let http_relay = HttpRelay::bind(
            http_addr,
            self.http_endpoint.clone(),
            config.request_timeout,
            config.max_body_size,
        )
        .await?;
        let http_addr = http_relay.local_addr()?;

        let ws_relay = match &self.ws_endpoint {
            Some(endpoint) => {
                let ws_addr = SocketAddr::new(config.host, config.ws_port);
                match WsRelay::bind(ws_addr, endpoint.clone(), config.request_timeout).await {
                    Ok(relay) => Some(relay),
                    Err(e) => {
                        error!("{:#}; continuing in HTTP-only mode", e);
                        None
                    }
                }
            }
            None => None,
        };
        let ws_addr = ws_relay.as_ref().map(WsRelay::local_addr).transpose()?;

        let http_task = tokio::spawn(http_relay.serve(self.shutdown_signal()));
        let ws_task = ws_relay.map(|relay| tokio::spawn(relay.serve(self.shutdown_signal())));

        Ok(ProxyHandle { http_addr, ws_addr, http_task, ws_task })
    }

    /// Run both relays until they stop
    pub async fn serve(self) -> Result<()> {
        self.spawn().await?.wait().await
    }

    fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        async move {
            // A closed channel means the server is gone; stop as well
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
        }
    }
}

/// Running relays started by [`ProxyServer::spawn`]
#[derive(Debug)]
pub struct ProxyHandle {
    http_addr: SocketAddr,
    ws_addr: Option<SocketAddr>,
    http_task: JoinHandle<Result<()>>,
    ws_task: Option<JoinHandle<Result<()>>>,
}

impl ProxyHandle {
    /// Address the HTTP relay is listening on
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Address the WebSocket relay is listening on, if it is running
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    /// Wait for both relays to stop
    ///
    /// A WebSocket relay failure is logged; an HTTP relay failure is returned.
    pub async fn wait(self) -> Result<()> {
        let Self { http_task, ws_task, .. } = self;
        let ws_task = async move {
            match ws_task {
                Some(task) => Some(task.await),
                None => None,
            }
        };
        let (http_result, ws_result) = tokio::join!(http_task, ws_task);

        match ws_result {
            Some(Ok(Err(e))) => error!("WebSocket relay failed: {:#}", e),
            Some(Err(e)) => error!("WebSocket relay task panicked: {}", e),
            _ => {}
        }

        http_result.map_err(|e| eyre::eyre!("HTTP relay task panicked: {}", e))?
    }
}
