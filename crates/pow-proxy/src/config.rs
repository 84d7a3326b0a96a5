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

//! Startup configuration for the proxy
//!
//! A [`ProxyConfig`] is assembled once from the command line (or from
//! [`crate::proxy::ProxyServerBuilder`]) and is never mutated afterwards. All
//! validation failures surface as a [`ConfigError`], which is always fatal at
//! startup except for the single websocket degradation case handled by the
//! supervisor.

use std::{fmt, net::IpAddr, str::FromStr, time::Duration};
use thiserror::Error;

/// Transport family served by one of the two relays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Request/response JSON-RPC over HTTP
    Http,
    /// Long-lived JSON-RPC connections over WebSocket
    Ws,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "HTTP"),
            Self::Ws => write!(f, "WebSocket"),
        }
    }
}

/// Hosted provider selected with `--provider-type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderType {
    /// Infura, addressed by network name and project ID
    Infura,
    /// Pocket Network gateway, addressed by network name and application ID
    Pocket,
}

impl FromStr for ProviderType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "infura" => Ok(Self::Infura),
            "pocket" => Ok(Self::Pocket),
            _ => Err(ConfigError::UnsupportedProvider(s.to_string())),
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infura => write!(f, "infura"),
            Self::Pocket => write!(f, "pocket"),
        }
    }
}

/// How upstream endpoints are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderMode {
    /// Explicit provider URLs are used verbatim
    DirectUrl,
    /// Endpoints are composed from the Infura URL scheme
    Infura,
    /// Endpoints are composed from the Pocket gateway URL scheme
    Pocket,
}

impl From<ProviderType> for ProviderMode {
    fn from(provider: ProviderType) -> Self {
        match provider {
            ProviderType::Infura => Self::Infura,
            ProviderType::Pocket => Self::Pocket,
        }
    }
}

impl fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectUrl => write!(f, "direct-url"),
            Self::Infura => write!(f, "infura"),
            Self::Pocket => write!(f, "pocket"),
        }
    }
}

/// Errors raised while validating configuration or resolving endpoints
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Direct-URL mode without a URL for the requested transport
    #[error("no {0} provider URL was given")]
    MissingUrl(Transport),
    /// The named network is not served by the provider
    #[error("network '{network}' is not supported by {mode}")]
    UnsupportedNetwork {
        /// Resolution mode that rejected the network
        mode: ProviderMode,
        /// Network name as given on the command line
        network: String,
    },
    /// The provider has no endpoint for this transport
    #[error("{mode} does not provide a {transport} endpoint")]
    TransportUnsupported {
        /// Resolution mode without the transport
        mode: ProviderMode,
        /// The transport that cannot be resolved
        transport: Transport,
    },
    /// A hosted provider was selected without a network name
    #[error("a network name is required for {0}")]
    MissingNetwork(ProviderMode),
    /// A hosted provider was selected without a project/application ID
    #[error("a project ID is required for {0}")]
    MissingCredential(ProviderMode),
    /// The project/application ID cannot be placed in a URL path
    #[error("project ID '{0}' contains characters that are not allowed in a URL path segment")]
    InvalidCredential(String),
    /// The per-request upstream timeout is zero
    #[error("request timeout must be at least one second")]
    InvalidTimeout,
    /// Unknown `--provider-type` value
    #[error("unsupported provider type '{0}' (expected 'infura' or 'pocket')")]
    UnsupportedProvider(String),
    /// An explicit provider URL failed validation
    #[error("malformed {transport} provider URL '{url}': {reason}")]
    MalformedUrl {
        /// Transport the URL was given for
        transport: Transport,
        /// The offending URL
        url: String,
        /// Why the URL was rejected
        reason: String,
    },
}

impl ConfigError {
    /// Whether a websocket resolution failure only means "the provider has
    /// no websocket endpoint", as opposed to a broken configuration
    pub fn is_degradable(&self) -> bool {
        matches!(self, Self::TransportUnsupported { .. })
    }
}

/// Immutable proxy configuration, built once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// How endpoints are resolved
    pub mode: ProviderMode,
    /// Named chain for hosted providers (e.g. `mainnet`, `goerli`)
    pub network: String,
    /// Hosted provider credential; may carry an `lb/` prefix for Pocket
    pub project_id: String,
    /// Explicit HTTP upstream, used verbatim when present
    pub http_provider_url: Option<String>,
    /// Explicit WebSocket upstream, used verbatim when present
    pub ws_provider_url: Option<String>,
    /// Address both listeners bind to
    pub host: IpAddr,
    /// Local HTTP listen port
    pub http_port: u16,
    /// Local WebSocket listen port
    pub ws_port: u16,
    /// Upper bound for a single forwarded HTTP request
    pub request_timeout: Duration,
    /// Largest HTTP request body accepted from local callers
    pub max_body_size: usize,
}

impl ProxyConfig {
    /// Explicit upstream URL configured for `transport`, if any
    pub fn explicit_url(&self, transport: Transport) -> Option<&str> {
        match transport {
            Transport::Http => self.http_provider_url.as_deref(),
            Transport::Ws => self.ws_provider_url.as_deref(),
        }
    }
}

/// Treat empty or whitespace-only values as "not provided", the way unset CLI
/// flags with an empty default behave.
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
