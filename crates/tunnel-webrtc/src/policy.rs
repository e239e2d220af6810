//! Target addressing: parsing data-channel protocol labels and the policy
//! hook that lets a listener restrict what it will dial.

use std::fmt;

use thiserror::Error;

/// Decides whether the listener may dial a target on behalf of a peer.
/// Absent a policy, everything is permitted.
pub trait AddressPolicy: Send + Sync {
    fn permit(&self, network: &str, host: &str, port: u16) -> bool;
}

impl<F> AddressPolicy for F
where
    F: Fn(&str, &str, u16) -> bool + Send + Sync,
{
    fn permit(&self, network: &str, host: &str, port: u16) -> bool {
        self(network, host, port)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum LabelError {
    #[error("unknown network {0:?}")]
    UnknownNetwork(String),
    #[error("missing host")]
    MissingHost,
    #[error("missing port")]
    MissingPort,
    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

/// A dial target parsed from a `"<tcp|udp>:<host>:<port>"` protocol label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub network: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    /// The `host:port` form handed to the socket dial, with IPv6 literals
    /// re-bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address())
    }
}

pub(crate) fn parse_label(label: &str) -> Result<Target, LabelError> {
    let (network, rest) = label
        .split_once(':')
        .ok_or(LabelError::MissingPort)?;
    if network != "tcp" && network != "udp" {
        return Err(LabelError::UnknownNetwork(network.to_string()));
    }
    let (host, port) = rest.rsplit_once(':').ok_or(LabelError::MissingPort)?;
    let host = host.trim_matches(|c| c == '[' || c == ']');
    if host.is_empty() {
        return Err(LabelError::MissingHost);
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| LabelError::InvalidPort(port.to_string()))?;
    Ok(Target {
        network: network.to_string(),
        host: host.to_string(),
        port,
    })
}
