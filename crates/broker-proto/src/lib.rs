//! Wire types for brokering a tunnel dialer and listener.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for other languages without pulling in the WebRTC runtime.

use serde::{Deserialize, Serialize};

/// Channel response code: the listener failed to dial the target.
pub const CODE_DIAL_ERR: &str = "dial_error";
/// Channel response code: the target is not permitted by the listener's policy.
pub const CODE_PERMISSION_ERR: &str = "permission_error";
/// Channel response code: the channel label did not parse as a target address.
pub const CODE_BAD_ADDRESS_ERR: &str = "bad_address_error";

/// A session description in `{type, sdp}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// One ICE server entry exchanged alongside an offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// Message used for brokering a dialer and listener.
///
/// Dialers initiate an exchange by providing an offer, along with the ICE
/// servers the listener should peer with. The listener responds with an
/// answer, then both sides trickle candidates. At most one of `offer`,
/// `answer`, `candidate` and `error` is meaningful per frame; receivers
/// ignore fields they do not understand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerMessage {
    // Dialer -> listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<IceServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_proxy_url: Option<String>,

    // Listener -> dialer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,

    // Bidirectional, in trickle form.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub candidate: String,

    // Structured target mirroring the data-channel protocol label. The
    // label is authoritative; these are accepted and ignored on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// First frame on every application data channel, sent listener -> dialer.
///
/// An empty `code` means the target was dialed and raw bytes follow.
/// `net` and `op` are populated for [`CODE_DIAL_ERR`] when the underlying
/// dial error carried them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialChannelResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub net: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub op: String,
}

impl DialChannelResponse {
    /// True when the channel is open and raw bytes follow.
    pub fn is_ok(&self) -> bool {
        self.code.is_empty()
    }
}
