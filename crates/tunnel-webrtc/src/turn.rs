//! Relay fallback: a credentialed dialer that tunnels TURN datagrams over
//! an authenticated WebSocket to the broker's relay endpoint, plus the
//! reachability probe applied to ordinary ICE servers before they are
//! handed to the agent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use webrtc::stun::agent::TransactionId;
use webrtc::stun::message::{Message as StunMessage, BINDING_REQUEST};
use webrtc::util::{self, Conn};

type ConnResult<T> = std::result::Result<T, util::Error>;

use broker_proto::IceServer;

use crate::ws::{self, BrokerSocket};
use crate::TunnelError;

/// Username marking the sentinel relay entry. A server carrying it is not a
/// real TURN deployment: both sides route its traffic through
/// [`TurnProxyDialer`] and skip reachability validation.
pub const TURN_PROXY_MAGIC_USERNAME: &str = "#turn-proxy#";

/// Address advertised by the sentinel relay entry. Never dialed directly;
/// the proxy tunnel terminates at the broker's relay endpoint instead.
const TURN_PROXY_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 3478);

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The ICE server entry that tells a peer to reach the relay through the
/// in-process proxy dialer rather than the OS network stack.
pub fn turn_proxy_ice_server() -> IceServer {
    IceServer {
        urls: vec!["turn:127.0.0.1:3478?transport=udp".to_string()],
        username: TURN_PROXY_MAGIC_USERNAME.to_string(),
        credential: TURN_PROXY_MAGIC_USERNAME.to_string(),
    }
}

pub(crate) fn is_turn_proxy(server: &IceServer) -> bool {
    server.username == TURN_PROXY_MAGIC_USERNAME
}

/// Dials the broker's relay endpoint and exposes the resulting stream as a
/// packet-oriented connection the ICE agent can treat as its socket.
pub struct TurnProxyDialer {
    base_url: Url,
    token: String,
}

impl TurnProxyDialer {
    pub fn new(base_url: Url, token: impl Into<String>) -> Self {
        Self {
            base_url,
            token: token.into(),
        }
    }

    /// Open the tunnel. Each TURN datagram travels as one binary frame.
    pub(crate) async fn dial(&self) -> Result<TurnProxyConn, TunnelError> {
        tracing::debug!(target = "tunnel", url = %self.base_url, "dialing relay tunnel");
        let socket = ws::connect(&self.base_url, Some(&self.token)).await?;
        Ok(TurnProxyConn::new(socket))
    }
}

// Synthetic source ports so concurrent tunnels stay distinguishable in the
// agent's bookkeeping; nothing binds them.
static NEXT_LOCAL_PORT: AtomicU16 = AtomicU16::new(49152);

/// A relay tunnel dressed as a UDP socket. Sends ignore the target address:
/// every frame is delivered to the relay endpoint, and received frames are
/// attributed to the sentinel relay address.
pub(crate) struct TurnProxyConn {
    send: Mutex<SplitSink<BrokerSocket, Message>>,
    recv: Mutex<SplitStream<BrokerSocket>>,
    local: SocketAddr,
}

impl TurnProxyConn {
    fn new(socket: BrokerSocket) -> Self {
        let (send, recv) = socket.split();
        let port = NEXT_LOCAL_PORT.fetch_add(1, Ordering::Relaxed);
        Self {
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            local: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    fn relay_addr() -> SocketAddr {
        SocketAddr::from(TURN_PROXY_ADDR)
    }
}

#[async_trait]
impl Conn for TurnProxyConn {
    async fn connect(&self, _addr: SocketAddr) -> ConnResult<()> {
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> ConnResult<usize> {
        Ok(self.recv_from(buf).await?.0)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> ConnResult<(usize, SocketAddr)> {
        let mut recv = self.recv.lock().await;
        loop {
            match recv.next().await {
                Some(Ok(Message::Binary(frame))) => {
                    if frame.len() > buf.len() {
                        return Err(util::Error::ErrBufferShort);
                    }
                    buf[..frame.len()].copy_from_slice(&frame);
                    return Ok((frame.len(), Self::relay_addr()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(util::Error::Other("relay tunnel closed".to_string()))
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(util::Error::Other(err.to_string())),
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> ConnResult<usize> {
        self.send_to(buf, Self::relay_addr()).await
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> ConnResult<usize> {
        let mut send = self.send.lock().await;
        send.send(Message::Binary(buf.to_vec()))
            .await
            .map_err(|err| util::Error::Other(err.to_string()))?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> ConnResult<SocketAddr> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(Self::relay_addr())
    }

    async fn close(&self) -> ConnResult<()> {
        let mut send = self.send.lock().await;
        let _ = send.send(Message::Close(None)).await;
        Ok(())
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
enum IceTransport {
    Udp,
    Tcp,
}

#[derive(Debug, PartialEq, Eq)]
struct IceUrl {
    host: String,
    port: u16,
    transport: IceTransport,
}

/// Parse `stun:`/`turn:`-style URLs. `url::Url` treats them as opaque
/// (cannot-be-a-base), so the authority is picked apart by hand.
fn parse_ice_url(raw: &str) -> Result<IceUrl, String> {
    let (scheme, rest) = raw
        .split_once(':')
        .ok_or_else(|| format!("{raw:?}: missing scheme"))?;
    let (default_port, default_transport) = match scheme {
        "stun" | "turn" => (3478, IceTransport::Udp),
        "stuns" | "turns" => (5349, IceTransport::Tcp),
        other => return Err(format!("{raw:?}: unknown scheme {other:?}")),
    };
    let (authority, query) = match rest.split_once('?') {
        Some((authority, query)) => (authority, Some(query)),
        None => (rest, None),
    };
    let transport = match query {
        Some("transport=tcp") => IceTransport::Tcp,
        Some("transport=udp") => IceTransport::Udp,
        Some(other) => return Err(format!("{raw:?}: unknown query {other:?}")),
        None => default_transport,
    };
    let (host, port) = match authority.rsplit_once(':') {
        // An IPv6 literal without a port also contains colons.
        Some((host, port)) if !port.contains(']') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("{raw:?}: invalid port {port:?}"))?;
            (host, port)
        }
        _ => (authority, default_port),
    };
    if host.is_empty() {
        return Err(format!("{raw:?}: missing host"));
    }
    Ok(IceUrl {
        host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
        port,
        transport,
    })
}

/// Probe an ICE server before handing it to the agent: TCP/TLS URLs get a
/// short-lived connect, UDP URLs a STUN binding round trip (a UDP connect
/// alone proves nothing). Sentinel relay entries must not be passed here.
pub(crate) async fn probe_ice_server(server: &IceServer) -> Result<(), TunnelError> {
    let raw = server
        .urls
        .first()
        .ok_or_else(|| TunnelError::IceProbe("server has no urls".to_string()))?;
    let url = parse_ice_url(raw).map_err(TunnelError::IceProbe)?;
    let probe = async {
        match url.transport {
            IceTransport::Tcp => {
                TcpStream::connect((url.host.as_str(), url.port)).await?;
                Ok::<_, std::io::Error>(())
            }
            IceTransport::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect((url.host.as_str(), url.port)).await?;
                let mut msg = StunMessage::new();
                msg.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
                socket.send(&msg.raw).await?;
                let mut buf = [0u8; 1500];
                socket.recv(&mut buf).await?;
                Ok(())
            }
        }
    };
    match timeout(PROBE_TIMEOUT, probe).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TunnelError::IceProbe(format!("{raw}: {err}"))),
        Err(_) => Err(TunnelError::IceProbe(format!("{raw}: probe timed out"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_server_is_recognized() {
        let sentinel = turn_proxy_ice_server();
        assert!(is_turn_proxy(&sentinel));
        assert!(!is_turn_proxy(&IceServer {
            urls: vec!["turn:relay.example.com:3478".into()],
            username: "alice".into(),
            credential: "secret".into(),
        }));
    }

    #[test]
    fn ice_urls_parse() {
        assert_eq!(
            parse_ice_url("stun:stun.example.com:19302").unwrap(),
            IceUrl {
                host: "stun.example.com".into(),
                port: 19302,
                transport: IceTransport::Udp,
            }
        );
        assert_eq!(
            parse_ice_url("turn:relay.example.com").unwrap(),
            IceUrl {
                host: "relay.example.com".into(),
                port: 3478,
                transport: IceTransport::Udp,
            }
        );
        assert_eq!(
            parse_ice_url("turn:relay.example.com:443?transport=tcp").unwrap(),
            IceUrl {
                host: "relay.example.com".into(),
                port: 443,
                transport: IceTransport::Tcp,
            }
        );
        assert_eq!(
            parse_ice_url("turns:relay.example.com").unwrap().transport,
            IceTransport::Tcp
        );
        assert_eq!(
            parse_ice_url("stun:[::1]:3478").unwrap().host,
            "::1".to_string()
        );
    }

    #[test]
    fn bad_ice_urls_are_rejected() {
        assert!(parse_ice_url("relay.example.com").is_err());
        assert!(parse_ice_url("udp:relay.example.com").is_err());
        assert!(parse_ice_url("turn:").is_err());
        assert!(parse_ice_url("turn:host:99999").is_err());
    }
}
