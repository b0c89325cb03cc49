use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Identity of a node on the network
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a fresh random [PeerId]
    pub fn random() -> Self {
        PeerId(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(PeerId)
    }
}

/// Label both ends must agree on before exchanging messages, e.g. `/indexer/ingest/1.0.0`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolId(String);

impl ProtocolId {
    pub fn new(id: impl Into<String>) -> Self {
        ProtocolId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProtocolId {
    fn from(id: &str) -> Self {
        ProtocolId(id.to_owned())
    }
}

impl From<String> for ProtocolId {
    fn from(id: String) -> Self {
        ProtocolId(id)
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors reported by a [Host] while opening a stream
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("peer {0} is not known to this host")]
    UnknownPeer(PeerId),

    #[error("peer {peer} supports none of the protocols {protocols:?}")]
    ProtocolsNotSupported {
        peer: PeerId,
        protocols: Vec<ProtocolId>,
    },

    #[error("failed to dial peer: {0}")]
    Dial(String),
}

/// Networking host the client is layered on.
///
/// The host owns dialing, stream multiplexing and protocol negotiation. The client only ever
/// asks it for a fresh stream to a peer.
pub trait Host: Send + Sync + 'static {
    /// Duplex stream handed out after a successful negotiation
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Identity of this host
    fn id(&self) -> PeerId;

    /// Open a stream to `peer` under the first entry of `protocols` the remote accepts.
    ///
    /// Returns the stream together with the negotiated protocol.
    fn new_stream(
        &self,
        peer: &PeerId,
        protocols: &[ProtocolId],
    ) -> impl Future<Output = Result<(Self::Stream, ProtocolId), HostError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_parses_its_display_form() {
        let id = PeerId::random();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-peer".parse::<PeerId>().is_err());
    }

    #[test]
    fn protocol_id_conversions() {
        let a = ProtocolId::from("/indexer/ingest/1.0.0");
        let b = ProtocolId::from(String::from("/indexer/ingest/1.0.0"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "/indexer/ingest/1.0.0");
        assert_eq!(ProtocolId::new("v1").as_str(), "v1");
    }
}
