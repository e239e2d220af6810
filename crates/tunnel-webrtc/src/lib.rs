//! Peer-to-peer byte tunnels between a local dialer and a remote workspace
//! listener.
//!
//! A broker relays signaling only: the dialer opens one stream against the
//! broker's `/connect` endpoint, the listener holds a multiplexed stream
//! against `/listen`, and the two exchange an offer, an answer and trickled
//! ICE candidates over it. Once the peer connection rises, application data
//! channels carry bytes directly between the peers, with an optional
//! TURN-over-tunnel relay when no direct path can be formed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

pub mod dial;
pub mod listen;
pub mod policy;
pub mod turn;

mod frame;
mod peer;
mod stream;
mod ws;

pub use broker_proto as proto;
pub use dial::{dial, DialOptions, Dialer};
pub use listen::{listen, ListenOptions, Listener};
pub use policy::AddressPolicy;
pub use stream::TunnelStream;
pub use turn::{turn_proxy_ice_server, TurnProxyDialer, TURN_PROXY_MAGIC_USERNAME};

/// Protocol label reserved for the liveness channel. Frames on it are one
/// byte long and echoed back by the listener.
pub const CONTROL_CHANNEL: &str = "control";

/// Wall-clock budget for a single negotiation attempt.
pub(crate) const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

static RETRY_INTERVAL_MS: AtomicU64 = AtomicU64::new(1_000);

/// Override the listener's broker reconnect interval. Only safe to call
/// before any session starts; tests use this to compress retry schedules.
pub fn set_connection_retry_interval(interval: Duration) {
    RETRY_INTERVAL_MS.store(interval.as_millis() as u64, Ordering::Relaxed);
}

pub(crate) fn connection_retry_interval() -> Duration {
    Duration::from_millis(RETRY_INTERVAL_MS.load(Ordering::Relaxed))
}

/// Failure reported in the first frame of an application channel.
#[derive(Debug, Clone, Error)]
#[error("{code}: {err}")]
pub struct ChannelError {
    /// One of the `broker_proto::CODE_*` values.
    pub code: String,
    pub err: String,
    /// Network of the failed dial, when the listener knew it.
    pub net: String,
    /// Operation of the failed dial, when the listener knew it.
    pub op: String,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("broker connect failed: {0}")]
    Broker(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("negotiation timed out")]
    NegotiationTimeout,
    /// The remote side ended the exchange with an `error` frame.
    #[error("remote error: {0}")]
    Remote(String),
    /// The peer connection is gone; the caller must redial.
    #[error("peer closed")]
    PeerClosed,
    #[error("channel rejected: {0}")]
    Channel(#[from] ChannelError),
    #[error("ICE server unreachable: {0}")]
    IceProbe(String),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("canceled")]
    Canceled,
}
