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

//! PoW Proxy Server
//!
//! Exposes local HTTP and WebSocket JSON-RPC endpoints and relays them to a
//! hosted Ethereum provider or an explicit upstream URL.

use clap::Parser;
use eyre::Result;
use pow_proxy::proxy::{
    ProxyServerBuilder, DEFAULT_HTTP_PORT, DEFAULT_MAX_BODY_SIZE, DEFAULT_NETWORK,
    DEFAULT_TIMEOUT_SECS, DEFAULT_WS_PORT,
};
use pow_proxy_common::init_logging;
use std::net::IpAddr;
use tracing::info;

/// Ethereum execution-layer JSON-RPC proxy
#[derive(Parser, Debug)]
#[command(name = "pow-proxy")]
#[command(about = "Eth 1.0 JSON-RPC proxy server")]
#[command(version)]
struct Args {
    // ========== Listener Configuration ==========
    /// Address to bind both listeners to
    #[arg(long, env = "POW_PROXY_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Local HTTP port to listen on
    #[arg(short = 'p', long, visible_alias = "httpPort", env = "POW_PROXY_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    http_port: u16,

    /// Local Websocket port to listen on
    #[arg(short = 'w', long, visible_alias = "wsPort", env = "POW_PROXY_WS_PORT", default_value_t = DEFAULT_WS_PORT)]
    ws_port: u16,

    // ========== Provider Configuration ==========
    /// External Eth 1.0 provider HTTP URL, including the remote port (takes precedence over --provider-type; needs --ws-provider-url too)
    #[arg(short = 'u', long, visible_alias = "httpProviderUrl", env = "POW_PROXY_HTTP_PROVIDER_URL")]
    http_provider_url: Option<String>,

    /// External Eth 1.0 provider Websocket URL, including the remote port
    #[arg(short = 'r', long, visible_alias = "wsProviderUrl", env = "POW_PROXY_WS_PROVIDER_URL")]
    ws_provider_url: Option<String>,

    /// Network to connect to via the hosted provider
    #[arg(short = 'n', long, env = "POW_PROXY_NETWORK", default_value = DEFAULT_NETWORK)]
    network: String,

    /// Infura project ID or Pocket App ID; for Pocket load balancers, prefix with "lb/"
    #[arg(short = 'i', long, visible_alias = "projectId", env = "POW_PROXY_PROJECT_ID", default_value = "", hide_env_values = true)]
    project_id: String,

    /// Eth 1.0 provider type if not using a URL: infura or pocket
    #[arg(short = 't', long, visible_alias = "providerType", env = "POW_PROXY_PROVIDER_TYPE", default_value = "infura")]
    provider_type: String,

    // ========== Relay Configuration ==========
    /// Per-request upstream timeout in seconds
    #[arg(long, env = "POW_PROXY_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Largest accepted HTTP request body in bytes
    #[arg(long, env = "POW_PROXY_MAX_BODY_SIZE", default_value_t = DEFAULT_MAX_BODY_SIZE)]
    max_body_size: usize,

    // ========== Logging Configuration ==========
    /// Verbosity level (repeat for more: -v, -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write logs to a daily rolling file in the temp directory
    #[arg(long)]
    log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenv::dotenv();

    let args = Args::parse();

    // Set RUST_LOG based on verbosity
    if std::env::var("RUST_LOG").is_err() {
        let level = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    if let Some(log_dir) = init_logging("pow-proxy", args.log_file)? {
        eprintln!("pow-proxy logs: {}", log_dir.display());
    }

    let mut builder = ProxyServerBuilder::new()
        .host(args.host)
        .http_port(args.http_port)
        .ws_port(args.ws_port)
        .network(args.network)
        .project_id(args.project_id)
        .provider_type(args.provider_type)
        .request_timeout(args.timeout)
        .max_body_size(args.max_body_size);

    if let Some(url) = args.http_provider_url {
        builder = builder.http_provider_url(url);
    }
    if let Some(url) = args.ws_provider_url {
        builder = builder.ws_provider_url(url);
    }

    let proxy = builder.build()?;

    // Set up shutdown signal handling
    let shutdown = proxy.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.shutdown();
        }
    });

    proxy.serve().await
}
