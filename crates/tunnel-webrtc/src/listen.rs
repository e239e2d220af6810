//! The listener half of the tunnel: hold a multiplexed signaling session
//! against the broker, negotiate one peer per substream, and bridge each
//! application data channel to its local target.

use std::io;
use std::sync::Arc;

use broker_proto::{
    BrokerMessage, DialChannelResponse, SessionDescription, CODE_BAD_ADDRESS_ERR, CODE_DIAL_ERR,
    CODE_PERMISSION_ERR,
};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use url::Url;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::frame::{self, SharedFrameWriter};
use crate::peer;
use crate::policy::{parse_label, AddressPolicy, Target};
use crate::stream::TunnelStream;
use crate::turn::{is_turn_proxy, probe_ice_server, TurnProxyDialer};
use crate::ws::{self, WsByteStream};
use crate::{TunnelError, CONTROL_CHANNEL, NEGOTIATION_TIMEOUT};

#[derive(Default)]
pub struct ListenOptions {
    /// Bearer token presented to the broker.
    pub token: Option<String>,
    /// Token presented when dialing the TURN proxy named in an offer.
    pub turn_proxy_token: Option<String>,
    /// Optional restriction on the targets this listener will dial.
    pub policy: Option<Arc<dyn AddressPolicy>>,
}

/// Connect to the broker and serve negotiations until [`Listener::close`].
///
/// The first dial happens before this returns so that authentication and
/// DNS failures surface immediately; afterwards a supervisor redials lost
/// broker connections on a fixed interval.
pub async fn listen(broker: Url, options: ListenOptions) -> Result<Listener, TunnelError> {
    let inner = Arc::new(Inner {
        broker,
        token: options.token,
        turn_proxy_token: options.turn_proxy_token.unwrap_or_default(),
        policy: options.policy,
        conn_closers: Mutex::new(Vec::new()),
        terminal: Mutex::new(None),
        cancel: CancellationToken::new(),
    });
    let session = Session::dial(&inner).await?;
    let sup_inner = inner.clone();
    tokio::spawn(async move { supervise(sup_inner, session).await });
    Ok(Listener { inner })
}

pub struct Listener {
    inner: Arc<Inner>,
}

impl Listener {
    /// Tear down every live peer and the broker session deterministically.
    /// Returns the terminal error captured by the supervisor, if any.
    pub async fn close(&self) -> Result<(), TunnelError> {
        self.inner.cancel.cancel();
        close_all_peers(&self.inner).await;
        match self.inner.terminal.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Inner {
    broker: Url,
    token: Option<String>,
    turn_proxy_token: String,
    policy: Option<Arc<dyn AddressPolicy>>,
    // Live peers; only Close and the negotiation tasks mutate this.
    conn_closers: Mutex<Vec<Arc<RTCPeerConnection>>>,
    // Set-once: the first non-retryable failure the supervisor observed.
    terminal: Mutex<Option<TunnelError>>,
    cancel: CancellationToken,
}

impl Inner {
    fn store_terminal(&self, err: TunnelError) {
        let mut slot = self.terminal.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

fn remove_closer(inner: &Inner, pc: &Arc<RTCPeerConnection>) {
    inner.conn_closers.lock().retain(|held| !Arc::ptr_eq(held, pc));
}

async fn close_all_peers(inner: &Inner) {
    let peers: Vec<_> = inner.conn_closers.lock().drain(..).collect();
    for pc in peers {
        let _ = pc.close().await;
    }
}

enum SessionEnd {
    /// The broker stream ended; redial on the retry interval.
    Lost(String),
    /// Unrecoverable; stored as the terminal error.
    Fatal(TunnelError),
}

struct Session {
    ended: mpsc::Receiver<SessionEnd>,
    cancel: CancellationToken,
}

impl Session {
    async fn dial(inner: &Arc<Inner>) -> Result<Session, TunnelError> {
        let socket = ws::connect(&inner.broker, inner.token.as_deref()).await?;
        let io = WsByteStream::new(socket);
        let connection =
            yamux::Connection::new(io.compat(), yamux::Config::default(), yamux::Mode::Server);
        let cancel = inner.cancel.child_token();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(accept_loop(connection, inner.clone(), cancel.clone(), tx));
        Ok(Session { ended: rx, cancel })
    }
}

async fn accept_loop<T>(
    mut connection: yamux::Connection<T>,
    inner: Arc<Inner>,
    cancel: CancellationToken,
    ended: mpsc::Sender<SessionEnd>,
) where
    T: futures_util::AsyncRead + futures_util::AsyncWrite + Unpin + Send + 'static,
{
    let end = loop {
        let inbound = tokio::select! {
            // Session replaced or listener closed; dropping the connection
            // closes the broker socket.
            _ = cancel.cancelled() => return,
            inbound = std::future::poll_fn(|cx| connection.poll_next_inbound(cx)) => inbound,
        };
        match inbound {
            Some(Ok(stream)) => {
                tracing::debug!(target = "tunnel", "accepted negotiation stream");
                let inner = inner.clone();
                tokio::spawn(async move { negotiate(stream.compat(), inner).await });
            }
            Some(Err(yamux::ConnectionError::Io(err))) => break SessionEnd::Lost(err.to_string()),
            Some(Err(yamux::ConnectionError::Closed)) => {
                break SessionEnd::Lost("session closed".to_string())
            }
            Some(Err(err)) => break SessionEnd::Fatal(TunnelError::Broker(err.to_string())),
            None => break SessionEnd::Lost("broker stream ended".to_string()),
        }
    };
    let _ = ended.send(end).await;
}

async fn supervise(inner: Arc<Inner>, mut session: Session) {
    loop {
        let end = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            end = session.ended.recv() => end,
        };
        let Some(end) = end else { return };
        match end {
            SessionEnd::Lost(reason) => {
                tracing::warn!(target = "tunnel", reason = %reason, "broker connection lost; redialing");
                session.cancel.cancel();
                match redial(&inner).await {
                    Some(next) => session = next,
                    None => return,
                }
            }
            SessionEnd::Fatal(err) => {
                tracing::warn!(target = "tunnel", error = %err, "broker session failed");
                inner.store_terminal(err);
                inner.cancel.cancel();
                close_all_peers(&inner).await;
                return;
            }
        }
    }
}

async fn redial(inner: &Arc<Inner>) -> Option<Session> {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                inner.store_terminal(TunnelError::Canceled);
                return None;
            }
            _ = tokio::time::sleep(crate::connection_retry_interval()) => {}
        }
        match Session::dial(inner).await {
            Ok(session) => {
                tracing::info!(target = "tunnel", "broker connection re-established");
                return Some(session);
            }
            Err(err) => {
                tracing::debug!(target = "tunnel", error = %err, "broker redial failed")
            }
        }
    }
}

/// Run one negotiation over its substream. The substream owns at most one
/// peer; the peer's state callback closes the substream once signaling can
/// no longer matter.
async fn negotiate(io: Compat<yamux::Stream>, inner: Arc<Inner>) {
    let (mut reader, writer) = frame::split(io);
    let closed = CancellationToken::new();
    // Candidates arriving before the offer are buffered and applied once
    // the remote description exists.
    let mut pending: Vec<String> = Vec::new();
    let mut pc: Option<Arc<RTCPeerConnection>> = None;

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            _ = inner.cancel.cancelled() => break,
            frame = reader.read_frame() => frame,
        };
        let msg = match frame {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(err) => {
                send_error(&writer, format!("decode: {err}")).await;
                break;
            }
        };

        if !msg.candidate.is_empty() {
            match &pc {
                Some(pc) => {
                    if let Err(err) = pc
                        .add_ice_candidate(peer::candidate_init(&msg.candidate))
                        .await
                    {
                        send_error(&writer, format!("accept ice candidate: {err}")).await;
                        break;
                    }
                }
                None => pending.push(msg.candidate.clone()),
            }
        }

        if !msg.error.is_empty() {
            tracing::debug!(target = "tunnel", error = %msg.error, "dialer ended negotiation");
            break;
        }

        if let Some(offer) = msg.offer.clone() {
            match accept_offer(&inner, &msg, &offer, &writer, &closed, &mut pending).await {
                Ok(accepted) => pc = Some(accepted),
                Err(err) => {
                    send_error(&writer, err.to_string()).await;
                    break;
                }
            }
        }
    }

    // Abandoning the stream abandons the attempt unless the peer made it
    // all the way up.
    if let Some(pc) = pc {
        if pc.connection_state() != RTCPeerConnectionState::Connected {
            remove_closer(&inner, &pc);
            let _ = pc.close().await;
        }
    }
    writer.lock().await.shutdown().await;
}

async fn send_error(writer: &SharedFrameWriter, error: String) {
    tracing::debug!(target = "tunnel", error = %error, "negotiation failed");
    let frame = BrokerMessage {
        error,
        ..Default::default()
    };
    let _ = writer.lock().await.write_frame(&frame).await;
}

async fn accept_offer(
    inner: &Arc<Inner>,
    msg: &BrokerMessage,
    offer: &SessionDescription,
    writer: &SharedFrameWriter,
    closed: &CancellationToken,
    pending: &mut Vec<String>,
) -> Result<Arc<RTCPeerConnection>, TunnelError> {
    if msg.servers.is_empty() {
        return Err(TunnelError::Negotiation(
            "ICE servers must be provided".to_string(),
        ));
    }
    for server in msg.servers.iter().filter(|s| !is_turn_proxy(s)) {
        probe_ice_server(server).await.map_err(|err| {
            TunnelError::Negotiation(format!("dial server {:?}: {err}", server.urls))
        })?;
    }
    let relay = match &msg.turn_proxy_url {
        Some(raw) => {
            let url = Url::parse(raw).map_err(|err| {
                TunnelError::Negotiation(format!("parse turn proxy url: {err}"))
            })?;
            Some(TurnProxyDialer::new(url, inner.turn_proxy_token.clone()))
        }
        None => None,
    };

    let pc = peer::new_peer_connection(&msg.servers, relay.as_ref()).await?;

    let state_closed = closed.clone();
    let state_inner = inner.clone();
    let state_pc = Arc::downgrade(&pc);
    pc.on_peer_connection_state_change(Box::new(move |state| {
        tracing::debug!(target = "tunnel", state = %state, "peer state changed");
        // The substream only exists to carry the negotiation; any state
        // other than connecting means it is done with it.
        if state != RTCPeerConnectionState::Connecting {
            state_closed.cancel();
        }
        if matches!(
            state,
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
        ) {
            if let Some(pc) = state_pc.upgrade() {
                remove_closer(&state_inner, &pc);
            }
        }
        Box::pin(async {})
    }));

    inner.conn_closers.lock().push(pc.clone());
    register_data_channels(&pc, inner.clone());

    let flush = peer::proxy_ice_candidates(&pc, writer.clone());
    pc.set_remote_description(peer::rtc_description(offer)?)
        .await
        .map_err(|err| TunnelError::Negotiation(format!("apply offer: {err}")))?;
    let answer = pc
        .create_answer(None)
        .await
        .map_err(|err| TunnelError::Negotiation(format!("create answer: {err}")))?;
    pc.set_local_description(answer)
        .await
        .map_err(|err| TunnelError::Negotiation(format!("set local answer: {err}")))?;
    flush.flush().await?;
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| TunnelError::Negotiation("local description missing".to_string()))?;
    writer
        .lock()
        .await
        .write_frame(&BrokerMessage {
            answer: Some(peer::wire_description(&local)),
            ..Default::default()
        })
        .await?;
    for candidate in pending.drain(..) {
        pc.add_ice_candidate(peer::candidate_init(&candidate))
            .await
            .map_err(|err| TunnelError::Negotiation(format!("add pending candidate: {err}")))?;
    }

    let timeout_pc = pc.clone();
    tokio::spawn(async move {
        tokio::time::sleep(NEGOTIATION_TIMEOUT).await;
        let state = timeout_pc.connection_state();
        if state == RTCPeerConnectionState::Connecting || state == RTCPeerConnectionState::New {
            tracing::debug!(target = "tunnel", "negotiation timed out");
            let _ = timeout_pc.close().await;
        }
    });

    Ok(pc)
}

fn register_data_channels(pc: &RTCPeerConnection, inner: Arc<Inner>) {
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let inner = inner.clone();
        Box::pin(async move {
            let protocol = dc.protocol().to_string();
            if protocol == CONTROL_CHANNEL {
                register_control(dc);
            } else {
                register_proxy(dc, protocol, inner);
            }
        })
    }));
}

/// The control channel echoes one byte per frame; EOF ends the loop
/// silently.
fn register_control(dc: Arc<RTCDataChannel>) {
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        let dc = open_dc.clone();
        Box::pin(async move {
            let raw = match dc.detach().await {
                Ok(raw) => raw,
                Err(_) => return,
            };
            let mut byte = [0u8; 1];
            loop {
                match raw.read(&mut byte).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        if raw.write(&Bytes::copy_from_slice(&byte)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }));
}

fn register_proxy(dc: Arc<RTCDataChannel>, protocol: String, inner: Arc<Inner>) {
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        let dc = open_dc.clone();
        let protocol = protocol.clone();
        let inner = inner.clone();
        Box::pin(async move {
            let raw = match dc.detach().await {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(target = "tunnel", error = %err, "detach data channel");
                    return;
                }
            };
            let mut stream = TunnelStream::new(dc.clone(), raw);
            match resolve_target(&inner, &protocol) {
                Ok(target) => proxy_channel(stream, target, dc).await,
                Err(response) => {
                    let _ = stream.write_response(&response).await;
                    let _ = dc.close().await;
                }
            }
        })
    }));
}

fn resolve_target(inner: &Inner, protocol: &str) -> Result<Target, DialChannelResponse> {
    let target = parse_label(protocol).map_err(|err| DialChannelResponse {
        code: CODE_BAD_ADDRESS_ERR.to_string(),
        err: err.to_string(),
        ..Default::default()
    })?;
    if let Some(policy) = &inner.policy {
        if !policy.permit(&target.network, &target.host, target.port) {
            return Err(DialChannelResponse {
                code: CODE_PERMISSION_ERR.to_string(),
                err: format!("{target} is not permitted"),
                ..Default::default()
            });
        }
    }
    Ok(target)
}

fn dial_error(target: &Target, err: &io::Error) -> DialChannelResponse {
    DialChannelResponse {
        code: CODE_DIAL_ERR.to_string(),
        err: err.to_string(),
        net: target.network.clone(),
        op: "dial".to_string(),
    }
}

/// Dial the target, report the outcome as the channel's first frame, then
/// bridge bytes until either side closes.
async fn proxy_channel(mut stream: TunnelStream, target: Target, dc: Arc<RTCDataChannel>) {
    tracing::debug!(target = "tunnel", address = %target, "proxying data channel");
    match target.network.as_str() {
        "tcp" => match TcpStream::connect((target.host.as_str(), target.port)).await {
            Ok(mut socket) => {
                if stream
                    .write_response(&DialChannelResponse::default())
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut socket).await;
                let _ = dc.close().await;
            }
            Err(err) => {
                let _ = stream.write_response(&dial_error(&target, &err)).await;
                let _ = dc.close().await;
            }
        },
        _ => match dial_udp(&target).await {
            Ok(socket) => {
                if stream
                    .write_response(&DialChannelResponse::default())
                    .await
                    .is_err()
                {
                    return;
                }
                bridge_udp(stream, socket).await;
                let _ = dc.close().await;
            }
            Err(err) => {
                let _ = stream.write_response(&dial_error(&target, &err)).await;
                let _ = dc.close().await;
            }
        },
    }
}

async fn dial_udp(target: &Target) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((target.host.as_str(), target.port)).await?;
    Ok(socket)
}

/// Copy between the channel and a connected UDP socket, one datagram per
/// channel read.
async fn bridge_udp(stream: TunnelStream, socket: UdpSocket) {
    let socket = Arc::new(socket);
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let recv_socket = socket.clone();
    let inbound = tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match recv_socket.recv(&mut buf).await {
                Ok(n) => {
                    if write_half.write_all(&buf[..n]).await.is_err()
                        || write_half.flush().await.is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    let mut buf = vec![0u8; 65536];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if socket.send(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    inbound.abort();
}
