//! In-process test infrastructure: a dumb broker that pairs `/connect`
//! and `/listen` sockets, a TURN/STUN server, and disposable targets.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use url::Url;
use webrtc::turn::auth::{generate_auth_key, AuthHandler};
use webrtc::turn::relay::relay_static::RelayAddressGeneratorStatic;
use webrtc::turn::server::config::{ConnConfig, ServerConfig};
use webrtc::turn::server::Server;
use webrtc::util::vnet::net::Net;

use tunnel_webrtc::TURN_PROXY_MAGIC_USERNAME;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A byte stream over a server-side WebSocket's binary frames.
struct WsIo {
    inner: WebSocketStream<TcpStream>,
    recv: Bytes,
}

impl WsIo {
    fn new(inner: WebSocketStream<TcpStream>) -> Self {
        Self {
            inner,
            recv: Bytes::new(),
        }
    }
}

fn ws_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(err) => err,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl AsyncRead for WsIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.recv.is_empty() {
                let n = self.recv.len().min(buf.remaining());
                buf.put_slice(&self.recv[..n]);
                self.recv.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => self.recv = Bytes::from(data),
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Poll::Ready(Err(ws_io_error(err))),
            }
        }
    }
}

impl AsyncWrite for WsIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(ws_io_error)?;
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(ws_io_error)
    }
}

type OpenRequest = oneshot::Sender<yamux::Stream>;

struct SessionHandle {
    opens: mpsc::UnboundedSender<OpenRequest>,
    cancel: CancellationToken,
}

struct BrokerState {
    session: Mutex<Option<SessionHandle>>,
    turn_addr: Option<SocketAddr>,
}

/// Proxies substreams between `/listen` and `/connect` to emulate an
/// authenticated WebSocket pair; `/turn` forwards binary frames to a UDP
/// TURN server when one is configured.
pub struct Broker {
    pub connect_url: Url,
    pub listen_url: Url,
    pub turn_url: Url,
    state: Arc<BrokerState>,
}

impl Broker {
    pub async fn start() -> Broker {
        Self::start_inner(None).await
    }

    pub async fn start_with_turn(turn_addr: SocketAddr) -> Broker {
        Self::start_inner(Some(turn_addr)).await
    }

    async fn start_inner(turn_addr: Option<SocketAddr>) -> Broker {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind broker");
        let addr = listener.local_addr().expect("broker addr");
        let state = Arc::new(BrokerState {
            session: Mutex::new(None),
            turn_addr,
        });
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve_socket(socket, state).await;
                });
            }
        });
        Broker {
            connect_url: Url::parse(&format!("ws://{addr}/connect")).expect("connect url"),
            listen_url: Url::parse(&format!("ws://{addr}/listen")).expect("listen url"),
            turn_url: Url::parse(&format!("ws://{addr}/turn")).expect("turn url"),
            state,
        }
    }

    /// Sever the current listener session, as if the broker restarted.
    pub fn kill_listener_session(&self) {
        if let Some(session) = self.state.session.lock().take() {
            session.cancel.cancel();
        }
    }

    pub fn has_listener_session(&self) -> bool {
        self.state.session.lock().is_some()
    }
}

async fn serve_socket(socket: TcpStream, state: Arc<BrokerState>) -> io::Result<()> {
    let mut path = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(socket, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await
    .map_err(ws_io_error)?;
    match path.as_str() {
        "/listen" => serve_listen(ws, state).await,
        "/connect" => serve_connect(ws, state).await,
        "/turn" => serve_turn(ws, state).await,
        _ => Ok(()),
    }
}

async fn serve_listen(ws: WebSocketStream<TcpStream>, state: Arc<BrokerState>) -> io::Result<()> {
    let connection = yamux::Connection::new(
        WsIo::new(ws).compat(),
        yamux::Config::default(),
        yamux::Mode::Client,
    );
    let (opens, open_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    *state.session.lock() = Some(SessionHandle {
        opens,
        cancel: cancel.clone(),
    });
    tokio::select! {
        // Dropping the connection closes the socket.
        _ = cancel.cancelled() => {}
        _ = drive_session(connection, open_rx) => {}
    }
    Ok(())
}

/// Drive the yamux connection, serving substream-open requests from
/// `/connect` handlers and discarding anything inbound.
async fn drive_session<T>(
    mut connection: yamux::Connection<T>,
    mut open_rx: mpsc::UnboundedReceiver<OpenRequest>,
) where
    T: futures_util::AsyncRead + futures_util::AsyncWrite + Unpin,
{
    let mut queue: VecDeque<OpenRequest> = VecDeque::new();
    std::future::poll_fn(|cx| {
        while let Poll::Ready(next) = open_rx.poll_recv(cx) {
            match next {
                Some(request) => queue.push_back(request),
                None => return Poll::Ready(()),
            }
        }
        while !queue.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    if let Some(request) = queue.pop_front() {
                        let _ = request.send(stream);
                    }
                }
                Poll::Ready(Err(_)) => return Poll::Ready(()),
                Poll::Pending => break,
            }
        }
        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;
}

async fn serve_connect(ws: WebSocketStream<TcpStream>, state: Arc<BrokerState>) -> io::Result<()> {
    let mut io = WsIo::new(ws);
    let opened = {
        let session = state.session.lock();
        session.as_ref().map(|session| session.opens.clone())
    };
    let stream = match opened {
        Some(opens) => {
            let (tx, rx) = oneshot::channel();
            if opens.send(tx).is_err() {
                None
            } else {
                rx.await.ok()
            }
        }
        None => None,
    };
    match stream {
        Some(stream) => {
            let mut stream = stream.compat();
            let _ = tokio::io::copy_bidirectional(&mut io, &mut stream).await;
        }
        None => {
            // Emulate a pubsub where nobody may be listening: discard.
            let _ = tokio::io::copy(&mut io, &mut tokio::io::sink()).await;
        }
    }
    Ok(())
}

async fn serve_turn(ws: WebSocketStream<TcpStream>, state: Arc<BrokerState>) -> io::Result<()> {
    let Some(turn_addr) = state.turn_addr else {
        return Ok(());
    };
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(turn_addr).await?;
    let socket = Arc::new(socket);
    let (mut sink, mut stream) = ws.split();
    let inbound_socket = socket.clone();
    tokio::select! {
        _ = async {
            while let Some(Ok(message)) = stream.next().await {
                if let Message::Binary(frame) = message {
                    if inbound_socket.send(&frame).await.is_err() {
                        break;
                    }
                }
            }
        } => {}
        _ = async {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => {
                        if sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        } => {}
    }
    Ok(())
}

struct ProxyCredentials;

impl AuthHandler for ProxyCredentials {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        _src_addr: SocketAddr,
    ) -> Result<Vec<u8>, webrtc::turn::Error> {
        Ok(generate_auth_key(
            username,
            realm,
            TURN_PROXY_MAGIC_USERNAME,
        ))
    }
}

/// A UDP TURN server on an ephemeral loopback port. Doubles as the STUN
/// responder for ICE server probes.
pub async fn start_turn_server() -> (SocketAddr, Server) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind turn");
    let addr = socket.local_addr().expect("turn addr");
    let server = Server::new(ServerConfig {
        conn_configs: vec![ConnConfig {
            conn: Arc::new(socket),
            relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
                relay_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                address: "127.0.0.1".to_owned(),
                net: Arc::new(Net::new(None)),
            }),
        }],
        realm: "tunnel".to_owned(),
        auth_handler: Arc::new(ProxyCredentials),
        channel_bind_timeout: Duration::from_secs(0),
        alloc_close_notify: None,
    })
    .await
    .expect("start turn server");
    (addr, server)
}

/// A TCP echo server on an ephemeral loopback port.
pub async fn tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// A UDP echo server on an ephemeral loopback port.
pub async fn udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind udp echo");
    let addr = socket.local_addr().expect("udp echo addr");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// A port with nothing listening on it.
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let port = listener.local_addr().expect("probe addr").port();
    drop(listener);
    port
}

/// A TCP target whose accepted connections can be severed on demand.
pub struct ClosableTarget {
    pub addr: SocketAddr,
    cancel: CancellationToken,
}

impl ClosableTarget {
    pub async fn start() -> ClosableTarget {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind target");
        let addr = listener.local_addr().expect("target addr");
        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, _)) => socket,
                        Err(_) => return,
                    },
                };
                let conn_cancel = accept_cancel.clone();
                tokio::spawn(async move {
                    let mut socket = socket;
                    let (mut read, mut write) = socket.split();
                    tokio::select! {
                        _ = conn_cancel.cancelled() => {
                            let _ = write.shutdown().await;
                        }
                        _ = tokio::io::copy(&mut read, &mut write) => {}
                    }
                });
            }
        });
        ClosableTarget { addr, cancel }
    }

    /// Sever the listener and every accepted connection.
    pub fn kill(&self) {
        self.cancel.cancel();
    }
}
