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

//! WebSocket relay
//!
//! Each accepted client connection gets its own dedicated upstream connection
//! (JSON-RPC subscription IDs are per connection, so upstreams are never
//! shared). The two connections form a [`RelayPair`] that forwards frames in
//! both directions until either side goes away, then closes both.
//!
//! ```text
//! client <--WS--> RelayPair <--WS--> upstream
//!           client->upstream leg
//!           upstream->client leg
//! ```

use crate::providers::ResolvedEndpoint;
use eyre::{eyre, Result, WrapErr};
use futures::{Sink, SinkExt, Stream, StreamExt};
use reqwest::Url;
use socket2::{SockRef, TcpKeepalive};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_tungstenite::{
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

/// Upper bound on the closing handshake of a torn-down pair
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` so fd exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Close reason sent to a client whose upstream could not be dialed
pub const UPSTREAM_UNAVAILABLE: &str = "upstream unavailable";

/// Close reason sent to the survivor when its partner connection is lost
pub const PEER_LOST: &str = "peer connection lost";

/// Idle time before the OS starts probing a silent peer
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// WebSocket relay bound to a local port
pub struct WsRelay {
    listener: TcpListener,
    endpoint: Arc<ResolvedEndpoint>,
    dial_timeout: Duration,
}

impl WsRelay {
    /// Bind the local listener; failures here are fatal for the transport
    ///
    /// `dial_timeout` bounds both the client handshake and the upstream dial.
    pub async fn bind(
        addr: SocketAddr,
        endpoint: ResolvedEndpoint,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("failed to bind WebSocket relay on {addr}"))?;

        Ok(Self { listener, endpoint: Arc::new(endpoint), dial_timeout })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` completes
    ///
    /// Every connection is handled in its own task; established pairs keep
    /// running after shutdown until one of their sides closes.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(%addr, upstream = %self.endpoint.redacted(), "WebSocket relay listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let endpoint = Arc::clone(&self.endpoint);
                        tokio::spawn(handle_connection(stream, peer, endpoint, self.dial_timeout));
                    }
                    Err(e) => {
                        warn!("Failed to accept WebSocket connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!(%addr, "WebSocket relay stopped");
        Ok(())
    }
}

/// Complete the client handshake, dial the dedicated upstream, and relay
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: Arc<ResolvedEndpoint>,
    dial_timeout: Duration,
) {
    if let Err(e) = configure_socket(&stream) {
        debug!(%peer, "Failed to configure client socket: {}", e);
    }

    let mut client = match timeout(dial_timeout, tokio_tungstenite::accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(%peer, "WebSocket handshake failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(%peer, "WebSocket handshake timed out after {:?}", dial_timeout);
            return;
        }
    };

    let upstream = match timeout(dial_timeout, dial_upstream(&endpoint)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            warn!(%peer, upstream = %endpoint.redacted(), "Failed to dial upstream: {:#}", e);
            reject(&mut client).await;
            return;
        }
        Err(_) => {
            warn!(%peer, upstream = %endpoint.redacted(), "Timed out dialing upstream after {:?}", dial_timeout);
            reject(&mut client).await;
            return;
        }
    };

    info!(%peer, "WebSocket client connected");
    let end = RelayPair::new(peer, client, upstream).run().await;
    info!(%peer, "WebSocket client disconnected ({})", end);
}

/// Open the TCP connection ourselves so keepalive is set before the handshake
async fn dial_upstream(
    endpoint: &ResolvedEndpoint,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let url = Url::parse(endpoint.as_str())?;
    let host = url
        .host_str()
        .ok_or_else(|| eyre!("upstream URL has no host"))?
        .trim_start_matches('[')
        .trim_end_matches(']');
    let port = url.port_or_known_default().ok_or_else(|| eyre!("upstream URL has no port"))?;

    let stream = TcpStream::connect((host, port)).await.wrap_err("TCP connect failed")?;
    configure_socket(&stream)?;

    let (upstream, _) = tokio_tungstenite::client_async_tls(endpoint.as_str(), stream)
        .await
        .wrap_err("WebSocket handshake failed")?;
    Ok(upstream)
}

/// Disable Nagle and enable keepalive so a dead peer eventually errors out
fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))
}

/// Fail closed: tell the client why, then drain until it acknowledges
async fn reject<S>(client: &mut WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame { code: CloseCode::Error, reason: UPSTREAM_UNAVAILABLE.into() };
    if client.close(Some(frame)).await.is_err() {
        return;
    }
    let _ = timeout(CLOSE_TIMEOUT, async { while client.next().await.is_some() {} }).await;
}

/// Which leg of a pair stopped first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frames read from the client and written upstream
    ClientToUpstream,
    /// Frames read from the upstream and written to the client
    UpstreamToClient,
}

/// Why a forwarding leg stopped
#[derive(Debug)]
pub enum LegEnd {
    /// The reading side sent a close frame
    Closed(Option<CloseFrame>),
    /// The reading side's stream ended without a close frame
    Finished,
    /// Reading from the source failed
    ReadFailed(WsError),
    /// Writing to the destination failed
    WriteFailed(WsError),
}

/// How a pair ended
#[derive(Debug)]
pub struct PairEnd {
    /// The leg that stopped first
    pub direction: Direction,
    /// Why it stopped
    pub reason: LegEnd,
}

impl std::fmt::Display for PairEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match (&self.direction, &self.reason) {
            (Direction::ClientToUpstream, LegEnd::WriteFailed(_)) => "upstream",
            (Direction::UpstreamToClient, LegEnd::WriteFailed(_)) => "client",
            (Direction::ClientToUpstream, _) => "client",
            (Direction::UpstreamToClient, _) => "upstream",
        };
        match &self.reason {
            LegEnd::Closed(_) => write!(f, "{side} closed"),
            LegEnd::Finished => write!(f, "{side} disconnected"),
            LegEnd::ReadFailed(e) | LegEnd::WriteFailed(e) => write!(f, "{side} failed: {e}"),
        }
    }
}

/// A client connection and its dedicated upstream connection
///
/// The pair owns both sockets exclusively. Both legs run concurrently inside
/// [`RelayPair::run`]; the first leg to stop cancels the other, and the pair
/// then closes each connection exactly once.
pub struct RelayPair<C, U> {
    peer: SocketAddr,
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
}

impl<C, U> RelayPair<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    /// Pair an accepted client with its freshly dialed upstream
    pub fn new(peer: SocketAddr, client: WebSocketStream<C>, upstream: WebSocketStream<U>) -> Self {
        Self { peer, client, upstream }
    }

    /// Relay frames in both directions until either side stops, then close
    /// both connections
    pub async fn run(self) -> PairEnd {
        let peer = self.peer;
        let (mut client_tx, mut client_rx) = self.client.split();
        let (mut upstream_tx, mut upstream_rx) = self.upstream.split();

        let end = tokio::select! {
            reason = forward(&mut client_rx, &mut upstream_tx) => {
                PairEnd { direction: Direction::ClientToUpstream, reason }
            }
            reason = forward(&mut upstream_rx, &mut client_tx) => {
                PairEnd { direction: Direction::UpstreamToClient, reason }
            }
        };
        debug!(%peer, "Relay pair stopping: {}", end);

        // The side that stopped reading gets `source`, the other side `destination`
        let (source, destination) = match &end.reason {
            LegEnd::Closed(frame) => (None, frame.clone()),
            LegEnd::Finished | LegEnd::ReadFailed(_) => (None, Some(peer_lost())),
            LegEnd::WriteFailed(_) => (Some(peer_lost()), None),
        };
        let (for_client, for_upstream) = match end.direction {
            Direction::ClientToUpstream => (source, destination),
            Direction::UpstreamToClient => (destination, source),
        };

        let closing = async {
            tokio::join!(close_side(&mut client_tx, for_client), close_side(&mut upstream_tx, for_upstream))
        };
        if timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            debug!(%peer, "Closing handshake timed out, dropping connections");
        }

        end
    }
}

fn peer_lost() -> CloseFrame {
    CloseFrame { code: CloseCode::Away, reason: PEER_LOST.into() }
}

/// Copy whole data frames from `reader` to `writer`, in order and unmodified
///
/// Ping/pong are answered per hop by the websocket layer and are not relayed.
async fn forward<R, W>(reader: &mut R, writer: &mut W) -> LegEnd
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let msg = match reader.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return LegEnd::ReadFailed(e),
            None => return LegEnd::Finished,
        };

        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if let Err(e) = writer.send(msg).await {
                    return LegEnd::WriteFailed(e);
                }
            }
            Message::Close(frame) => return LegEnd::Closed(frame),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

/// Close one side of a pair; errors mean the side is already gone
async fn close_side<W>(writer: &mut W, frame: Option<CloseFrame>)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    if let Some(frame) = frame {
        let _ = writer.send(Message::Close(Some(frame))).await;
    }
    let _ = writer.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// Returns (peer end, relay end) of an in-memory websocket
    async fn ws_pipe(relay_role: Role) -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let peer_role = match relay_role {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        };
        let (peer_io, relay_io) = duplex(64 * 1024);
        let peer = WebSocketStream::from_raw_socket(peer_io, peer_role, None).await;
        let relay = WebSocketStream::from_raw_socket(relay_io, relay_role, None).await;
        (peer, relay)
    }

    fn test_peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_pair_relays_both_directions() {
        let (mut client, client_side) = ws_pipe(Role::Server).await;
        let (mut upstream, upstream_side) = ws_pipe(Role::Client).await;
        let pair = tokio::spawn(RelayPair::new(test_peer(), client_side, upstream_side).run());

        client.send(Message::text(r#"{"jsonrpc":"2.0","id":1,"method":"eth_subscribe"}"#)).await.unwrap();
        let received = upstream.next().await.unwrap().unwrap();
        assert_eq!(received, Message::text(r#"{"jsonrpc":"2.0","id":1,"method":"eth_subscribe"}"#));

        upstream.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        let received = client.next().await.unwrap().unwrap();
        assert_eq!(received, Message::binary(vec![1u8, 2, 3]));

        client.close(None).await.unwrap();
        let end = timeout(Duration::from_secs(5), pair).await.unwrap().unwrap();
        assert_eq!(end.direction, Direction::ClientToUpstream);
        assert!(matches!(end.reason, LegEnd::Closed(_)));
    }

    #[tokio::test]
    async fn test_client_close_is_forwarded_upstream() {
        let (mut client, client_side) = ws_pipe(Role::Server).await;
        let (mut upstream, upstream_side) = ws_pipe(Role::Client).await;
        let pair = tokio::spawn(RelayPair::new(test_peer(), client_side, upstream_side).run());

        let frame = CloseFrame { code: CloseCode::Normal, reason: "bye".into() };
        client.close(Some(frame)).await.unwrap();

        match timeout(Duration::from_secs(5), upstream.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("expected close frame upstream, got {other:?}"),
        }
        timeout(Duration::from_secs(5), pair).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_upstream_loss_closes_client() {
        let (mut client, client_side) = ws_pipe(Role::Server).await;
        let (upstream, upstream_side) = ws_pipe(Role::Client).await;
        let pair = tokio::spawn(RelayPair::new(test_peer(), client_side, upstream_side).run());

        // Dropping the upstream peer ends its stream without a close frame
        drop(upstream);

        match timeout(Duration::from_secs(5), client.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::Away);
                assert_eq!(frame.reason.as_str(), PEER_LOST);
            }
            other => panic!("expected close frame at client, got {other:?}"),
        }

        let end = timeout(Duration::from_secs(5), pair).await.unwrap().unwrap();
        assert_eq!(end.direction, Direction::UpstreamToClient);
    }

    #[tokio::test]
    async fn test_relayed_sockets_use_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (accepted, _) = accepted.unwrap();

        configure_socket(&accepted).unwrap();

        assert!(SockRef::from(&accepted).keepalive().unwrap());
        assert!(accepted.nodelay().unwrap());
        drop(dialed);
    }

    #[test]
    fn test_pair_end_display_names_the_failed_side() {
        let end = PairEnd { direction: Direction::UpstreamToClient, reason: LegEnd::Finished };
        assert_eq!(end.to_string(), "upstream disconnected");

        let end = PairEnd { direction: Direction::ClientToUpstream, reason: LegEnd::Closed(None) };
        assert_eq!(end.to_string(), "client closed");
    }
}
