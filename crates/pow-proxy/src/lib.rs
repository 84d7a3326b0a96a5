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

//! PoW Proxy Library
//!
//! A local JSON-RPC relay for Ethereum execution-layer tooling. Wallets and
//! node daemons talk plain HTTP and WebSocket JSON-RPC to the proxy, which
//! forwards everything to a single configured upstream (Infura, Pocket, or an
//! explicit URL) without inspecting the payloads.

pub mod config;
pub mod providers;
pub mod proxy;
pub mod rpc;
pub mod ws;

pub use config::{ConfigError, ProviderMode, ProviderType, ProxyConfig, Transport};
pub use providers::{resolve, ResolvedEndpoint};
pub use proxy::{ProxyHandle, ProxyServer, ProxyServerBuilder};
