//! Peer construction: ICE configuration, relay wiring, and the candidate
//! proxy that trickles locally gathered candidates over a signaling stream.

use std::sync::Arc;
use std::time::Duration;

use broker_proto::{BrokerMessage, IceServer, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::watch;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::frame::SharedFrameWriter;
use crate::turn::TurnProxyDialer;
use crate::TunnelError;

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

fn is_relay_only(servers: &[IceServer]) -> bool {
    !servers.is_empty()
        && servers.iter().all(|server| {
            server
                .urls
                .iter()
                .all(|url| url.starts_with("turn:") || url.starts_with("turns:"))
        })
}

/// Build a peer connection for one negotiation.
///
/// Data channels are detached (consumed as byte streams, never through
/// message callbacks). When a relay dialer is supplied, the agent's socket
/// is the proxy tunnel itself, so TURN allocation and relayed traffic all
/// flow through the broker's relay endpoint.
pub(crate) async fn new_peer_connection(
    servers: &[IceServer],
    relay: Option<&TurnProxyDialer>,
) -> Result<Arc<RTCPeerConnection>, TunnelError> {
    let mut setting = SettingEngine::default();
    setting.detach_data_channels();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(5)),
        Some(Duration::from_secs(5)),
        Some(Duration::from_secs(2)),
    );
    if let Some(relay) = relay {
        let conn = relay.dial().await?;
        setting.set_udp_network(UDPNetwork::Muxed(UDPMuxDefault::new(UDPMuxParams::new(
            conn,
        ))));
    }
    let ice_transport_policy = if is_relay_only(servers) {
        RTCIceTransportPolicy::Relay
    } else {
        RTCIceTransportPolicy::All
    };
    let api = APIBuilder::new().with_setting_engine(setting).build();
    let config = RTCConfiguration {
        ice_servers: rtc_ice_servers(servers),
        ice_transport_policy,
        ..Default::default()
    };
    Ok(Arc::new(api.new_peer_connection(config).await?))
}

/// Mirror connection-state transitions into a watch channel.
pub(crate) fn watch_connection_state(
    pc: &RTCPeerConnection,
) -> watch::Receiver<RTCPeerConnectionState> {
    let (tx, rx) = watch::channel(pc.connection_state());
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let _ = tx.send(state);
        Box::pin(async {})
    }));
    rx
}

pub(crate) fn wire_description(desc: &RTCSessionDescription) -> SessionDescription {
    SessionDescription {
        kind: desc.sdp_type.to_string(),
        sdp: desc.sdp.clone(),
    }
}

pub(crate) fn rtc_description(
    desc: &SessionDescription,
) -> Result<RTCSessionDescription, TunnelError> {
    let converted = match desc.kind.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp.clone()),
        "answer" => RTCSessionDescription::answer(desc.sdp.clone()),
        "pranswer" => RTCSessionDescription::pranswer(desc.sdp.clone()),
        other => {
            return Err(TunnelError::Negotiation(format!(
                "unexpected description type {other:?}"
            )))
        }
    };
    Ok(converted?)
}

pub(crate) fn candidate_init(candidate: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.to_string(),
        ..Default::default()
    }
}

/// Forward locally gathered candidates as `candidate` frames.
///
/// Candidates gathered before [`CandidateFlush::flush`] are queued; the
/// caller flushes once its local description is in place, after which
/// candidates pass straight through.
pub(crate) fn proxy_ice_candidates(
    pc: &RTCPeerConnection,
    writer: SharedFrameWriter,
) -> CandidateFlush {
    let pending: Arc<Mutex<Option<Vec<String>>>> = Arc::new(Mutex::new(Some(Vec::new())));
    let cb_pending = pending.clone();
    let cb_writer = writer.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let pending = cb_pending.clone();
        let writer = cb_writer.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(err) => {
                    tracing::warn!(target = "tunnel", error = %err, "serialize candidate");
                    return;
                }
            };
            let queued = {
                let mut guard = pending.lock();
                match guard.as_mut() {
                    Some(queue) => {
                        queue.push(init.candidate.clone());
                        true
                    }
                    None => false,
                }
            };
            if queued {
                return;
            }
            let frame = BrokerMessage {
                candidate: init.candidate,
                ..Default::default()
            };
            if let Err(err) = writer.lock().await.write_frame(&frame).await {
                tracing::debug!(target = "tunnel", error = %err, "candidate write failed");
            }
        })
    }));
    CandidateFlush { pending, writer }
}

pub(crate) struct CandidateFlush {
    pending: Arc<Mutex<Option<Vec<String>>>>,
    writer: SharedFrameWriter,
}

impl CandidateFlush {
    /// Drain the queue and switch the proxy to pass-through.
    pub(crate) async fn flush(&self) -> std::io::Result<()> {
        let drained = self.pending.lock().take().unwrap_or_default();
        let mut writer = self.writer.lock().await;
        for candidate in drained {
            writer
                .write_frame(&BrokerMessage {
                    candidate,
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }
}
