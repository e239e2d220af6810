//! The dialer half of the tunnel: negotiate one peer over the broker's
//! connect endpoint, then open application channels against the remote
//! listener and measure liveness on the control channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use broker_proto::{BrokerMessage, IceServer};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use url::Url;
use webrtc::data::data_channel::DataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate_pair::RTCIceCandidatePair;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::frame::{self, FrameReader, SharedFrameWriter};
use crate::peer;
use crate::stream::TunnelStream;
use crate::turn::{turn_proxy_ice_server, TurnProxyDialer};
use crate::ws::{self, WsByteStream};
use crate::{ChannelError, TunnelError, CONTROL_CHANNEL, NEGOTIATION_TIMEOUT};

#[derive(Default)]
pub struct DialOptions {
    /// Bearer token presented to the broker.
    pub token: Option<String>,
    /// ICE servers offered to the listener.
    pub ice_servers: Vec<IceServer>,
    /// Relay endpoint. When set, the sentinel relay entry is appended to
    /// the offered servers and both sides route its traffic through their
    /// proxy dialers.
    pub turn_proxy_url: Option<Url>,
    /// Token the local proxy dialer presents to the relay endpoint.
    pub turn_proxy_token: Option<String>,
}

/// Negotiate a tunnel against whatever listener the broker pairs us with.
/// Returns once the peer is connected; a listener-side rejection, a peer
/// failure or the negotiation timeout fail the attempt.
pub async fn dial(broker: Url, options: DialOptions) -> Result<Dialer, TunnelError> {
    let socket = ws::connect(&broker, options.token.as_deref()).await?;
    let (reader, writer) = frame::split(WsByteStream::new(socket));

    let mut servers = options.ice_servers.clone();
    let relay = match &options.turn_proxy_url {
        Some(url) => {
            servers.push(turn_proxy_ice_server());
            Some(TurnProxyDialer::new(
                url.clone(),
                options.turn_proxy_token.clone().unwrap_or_default(),
            ))
        }
        None => None,
    };

    let pc = peer::new_peer_connection(&servers, relay.as_ref()).await?;
    let state = peer::watch_connection_state(&pc);
    let flush = peer::proxy_ice_candidates(&pc, writer.clone());

    // The liveness channel travels in the offer's SCTP description, so it
    // must exist before the offer is created.
    let ctrl = pc
        .create_data_channel(
            CONTROL_CHANNEL,
            Some(RTCDataChannelInit {
                ordered: Some(false),
                protocol: Some(CONTROL_CHANNEL.to_string()),
                ..Default::default()
            }),
        )
        .await?;

    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| TunnelError::Negotiation("local description missing".to_string()))?;
    writer
        .lock()
        .await
        .write_frame(&BrokerMessage {
            offer: Some(peer::wire_description(&local)),
            servers: servers.clone(),
            turn_proxy_url: options.turn_proxy_url.as_ref().map(Url::to_string),
            ..Default::default()
        })
        .await?;
    flush.flush().await?;

    let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let failed = Arc::new(Notify::new());
    let read_task = tokio::spawn(run_signaling(
        reader,
        pc.clone(),
        failure.clone(),
        failed.clone(),
    ));

    let dialer = Dialer {
        pc,
        ctrl: AsyncMutex::new(ControlSlot { dc: ctrl, raw: None }),
        state,
        failure,
        writer,
        read_task,
    };

    match timeout(NEGOTIATION_TIMEOUT, dialer.wait_connected(&failed)).await {
        Ok(Ok(())) => Ok(dialer),
        Ok(Err(err)) => {
            dialer.close().await;
            Err(err)
        }
        Err(_) => {
            dialer.close().await;
            Err(TunnelError::NegotiationTimeout)
        }
    }
}

/// A connected tunnel. `open` and `ping` are safe to call concurrently.
pub struct Dialer {
    pc: Arc<RTCPeerConnection>,
    ctrl: AsyncMutex<ControlSlot>,
    state: watch::Receiver<RTCPeerConnectionState>,
    failure: Arc<Mutex<Option<String>>>,
    writer: SharedFrameWriter,
    read_task: JoinHandle<()>,
}

struct ControlSlot {
    dc: Arc<RTCDataChannel>,
    raw: Option<Arc<DataChannel>>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer").finish_non_exhaustive()
    }
}

impl Dialer {
    async fn wait_connected(&self, failed: &Notify) -> Result<(), TunnelError> {
        let mut state = self.state.clone();
        loop {
            // Register for the failure signal before checking it, so a
            // rejection landing between the check and the await still wakes
            // this loop.
            let notified = failed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(err) = self.failure.lock().clone() {
                return Err(TunnelError::Remote(err));
            }
            match *state.borrow() {
                RTCPeerConnectionState::Connected => return Ok(()),
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    return Err(TunnelError::PeerClosed)
                }
                _ => {}
            }
            tokio::select! {
                _ = &mut notified => {}
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(TunnelError::PeerClosed);
                    }
                }
            }
        }
    }

    /// The readiness gate for `open` and `ping`: a negotiation failure or a
    /// dead peer surfaces here instead of racing a half-built connection.
    fn ensure_ready(&self) -> Result<(), TunnelError> {
        if let Some(err) = self.failure.lock().clone() {
            return Err(TunnelError::Remote(err));
        }
        match *self.state.borrow() {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                Err(TunnelError::PeerClosed)
            }
            _ => Ok(()),
        }
    }

    /// Open a channel proxied to `(network, address)` on the listener side.
    /// Reads exactly one response frame before returning; a non-empty code
    /// surfaces as [`TunnelError::Channel`].
    pub async fn open(&self, network: &str, address: &str) -> Result<TunnelStream, TunnelError> {
        self.ensure_ready()?;
        let protocol = format!("{network}:{address}");
        tracing::debug!(target = "tunnel", %protocol, "opening data channel");
        let dc = self
            .pc
            .create_data_channel(
                &protocol,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    protocol: Some(protocol.clone()),
                    ..Default::default()
                }),
            )
            .await?;
        let raw = wait_detach(&dc).await?;
        let mut stream = TunnelStream::new(dc.clone(), raw);
        let response = stream.read_response().await?;
        if !response.is_ok() {
            let _ = dc.close().await;
            return Err(TunnelError::Channel(ChannelError {
                code: response.code,
                err: response.err,
                net: response.net,
                op: response.op,
            }));
        }
        Ok(stream)
    }

    /// Round-trip one byte on the control channel. A closed channel means
    /// the peer is gone and the caller must redial.
    pub async fn ping(&self) -> Result<Duration, TunnelError> {
        self.ensure_ready()?;
        let mut slot = self.ctrl.lock().await;
        let raw = match &slot.raw {
            Some(raw) => raw.clone(),
            None => {
                let raw = wait_detach(&slot.dc).await?;
                slot.raw = Some(raw.clone());
                raw
            }
        };
        let start = Instant::now();
        raw.write(&Bytes::from_static(b"!"))
            .await
            .map_err(|_| TunnelError::PeerClosed)?;
        let mut byte = [0u8; 1];
        match raw.read(&mut byte).await {
            Ok(0) | Err(_) => Err(TunnelError::PeerClosed),
            Ok(_) => Ok(start.elapsed()),
        }
    }

    /// The selected ICE candidate pair, once connected. Operators use this
    /// to tell a direct path from a relayed one.
    pub async fn candidates(&self) -> Option<RTCIceCandidatePair> {
        self.pc
            .sctp()
            .transport()
            .ice_transport()
            .get_selected_candidate_pair()
            .await
    }

    /// Tear down the peer and the signaling stream.
    pub async fn close(&self) {
        let _ = self.pc.close().await;
        self.read_task.abort();
        self.writer.lock().await.shutdown().await;
    }
}

async fn run_signaling(
    mut reader: FrameReader,
    pc: Arc<RTCPeerConnection>,
    failure: Arc<Mutex<Option<String>>>,
    failed: Arc<Notify>,
) {
    let mut pending: Vec<String> = Vec::new();
    let mut remote_set = false;
    loop {
        let msg = match reader.read_frame().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(err) => {
                record_failure(&failure, &failed, format!("decode: {err}"));
                break;
            }
        };
        if let Err(err) = apply_frame(&pc, msg, &mut pending, &mut remote_set).await {
            record_failure(&failure, &failed, err);
            break;
        }
    }
}

async fn apply_frame(
    pc: &RTCPeerConnection,
    msg: BrokerMessage,
    pending: &mut Vec<String>,
    remote_set: &mut bool,
) -> Result<(), String> {
    if !msg.candidate.is_empty() {
        if *remote_set {
            pc.add_ice_candidate(peer::candidate_init(&msg.candidate))
                .await
                .map_err(|err| format!("accept ice candidate: {err}"))?;
        } else {
            pending.push(msg.candidate);
        }
    }
    if let Some(answer) = &msg.answer {
        let desc = peer::rtc_description(answer).map_err(|err| err.to_string())?;
        pc.set_remote_description(desc)
            .await
            .map_err(|err| format!("apply answer: {err}"))?;
        *remote_set = true;
        for candidate in pending.drain(..) {
            pc.add_ice_candidate(peer::candidate_init(&candidate))
                .await
                .map_err(|err| format!("add pending candidate: {err}"))?;
        }
    }
    if !msg.error.is_empty() {
        return Err(msg.error);
    }
    Ok(())
}

fn record_failure(failure: &Mutex<Option<String>>, failed: &Notify, err: String) {
    tracing::debug!(target = "tunnel", error = %err, "signaling ended");
    let mut slot = failure.lock();
    if slot.is_none() {
        *slot = Some(err);
    }
    drop(slot);
    failed.notify_waiters();
}

/// Wait for the channel to open, then detach it for byte-stream use.
async fn wait_detach(dc: &Arc<RTCDataChannel>) -> Result<Arc<DataChannel>, TunnelError> {
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let cb_tx = tx.clone();
    dc.on_open(Box::new(move || {
        let tx = cb_tx.clone();
        Box::pin(async move {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        })
    }));
    // The handler is registered first so an open between the state check
    // and the await cannot be missed.
    if dc.ready_state() != RTCDataChannelState::Open {
        timeout(NEGOTIATION_TIMEOUT, rx)
            .await
            .map_err(|_| TunnelError::NegotiationTimeout)?
            .map_err(|_| TunnelError::PeerClosed)?;
    }
    Ok(dc.detach().await?)
}
