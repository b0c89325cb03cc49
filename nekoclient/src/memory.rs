//! In-process [Host] implementation.
//!
//! Peers join a shared [MemoryNetwork] and listen on protocols; opening a stream hands one end of
//! a `tokio::io::duplex` pipe to the listener. Useful for tests and for profiling the client
//! without a real network.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::trace;

use crate::host::{Host, HostError, PeerId, ProtocolId};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;
const ACCEPT_QUEUE: usize = 64;

type Handlers = DashMap<ProtocolId, mpsc::Sender<IncomingStream>>;

/// A stream opened to a [MemoryHost] by a remote peer
#[derive(Debug)]
pub struct IncomingStream {
    /// Peer that opened the stream
    pub remote: PeerId,

    /// Protocol the stream was negotiated under
    pub protocol: ProtocolId,

    pub stream: DuplexStream,
}

/// Shared broker routing streams between [MemoryHost]s
#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    /// Protocol handlers of every peer on the network
    peers: Arc<DashMap<PeerId, Arc<Handlers>>>,

    /// Number of streams successfully opened so far
    opened: Arc<AtomicUsize>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `peer` off the network; later dials to it fail with [HostError::UnknownPeer]
    pub fn remove(&self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    /// Total streams opened on this network
    pub fn streams_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn handlers(&self, peer: &PeerId) -> Option<Arc<Handlers>> {
        self.peers.get(peer).map(|h| Arc::clone(h.value()))
    }
}

/// A peer on a [MemoryNetwork]
#[derive(Clone, Debug)]
pub struct MemoryHost {
    id: PeerId,
    network: MemoryNetwork,
}

impl MemoryHost {
    /// Join `network` under a fresh random [PeerId]
    pub fn new(network: &MemoryNetwork) -> Self {
        let id = PeerId::random();
        network.peers.insert(id, Arc::new(DashMap::new()));
        MemoryHost {
            id,
            network: network.clone(),
        }
    }

    /// Accept streams for `protocol`. Dropping the receiver stops listening.
    pub fn listen(&self, protocol: ProtocolId) -> mpsc::Receiver<IncomingStream> {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        self.network
            .peers
            .entry(self.id)
            .or_insert_with(|| Arc::new(DashMap::new()))
            .insert(protocol, tx);
        rx
    }
}

impl Host for MemoryHost {
    type Stream = DuplexStream;

    fn id(&self) -> PeerId {
        self.id
    }

    fn new_stream(
        &self,
        peer: &PeerId,
        protocols: &[ProtocolId],
    ) -> impl Future<Output = Result<(Self::Stream, ProtocolId), HostError>> + Send {
        let network = self.network.clone();
        let local = self.id;
        let peer = *peer;
        let protocols = protocols.to_vec();

        async move {
            let handlers = network.handlers(&peer).ok_or(HostError::UnknownPeer(peer))?;

            for protocol in protocols.iter() {
                let Some(accept_tx) = handlers.get(protocol).map(|tx| tx.value().clone()) else {
                    trace!(%peer, %protocol, "protocol not supported");
                    continue;
                };

                let (ours, theirs) = tokio::io::duplex(DUPLEX_BUF_SIZE);
                let incoming = IncomingStream {
                    remote: local,
                    protocol: protocol.clone(),
                    stream: theirs,
                };
                if accept_tx.send(incoming).await.is_err() {
                    // listener went away
                    handlers.remove(protocol);
                    continue;
                }

                network.opened.fetch_add(1, Ordering::SeqCst);
                return Ok((ours, protocol.clone()));
            }

            Err(HostError::ProtocolsNotSupported { peer, protocols })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_supported_protocol_wins() {
        let network = MemoryNetwork::new();
        let a = MemoryHost::new(&network);
        let b = MemoryHost::new(&network);
        let mut v1 = b.listen("v1".into());
        let mut v0 = b.listen("v0".into());

        let (_s, proto) = a
            .new_stream(&b.id(), &["v2".into(), "v1".into(), "v0".into()])
            .await
            .unwrap();
        assert_eq!(proto, ProtocolId::from("v1"));

        let inc = v1.recv().await.unwrap();
        assert_eq!(inc.remote, a.id());
        assert_eq!(inc.protocol, ProtocolId::from("v1"));
        assert!(v0.try_recv().is_err());
        assert_eq!(network.streams_opened(), 1);
    }

    #[tokio::test]
    async fn reports_unknown_and_unsupported() {
        let network = MemoryNetwork::new();
        let a = MemoryHost::new(&network);
        let b = MemoryHost::new(&network);
        let _v1 = b.listen("v1".into());

        let err = a.new_stream(&PeerId::random(), &["v1".into()]).await.unwrap_err();
        assert!(matches!(err, HostError::UnknownPeer(_)));

        let err = a.new_stream(&b.id(), &["v3".into()]).await.unwrap_err();
        assert!(matches!(err, HostError::ProtocolsNotSupported { .. }));

        network.remove(&b.id());
        let err = a.new_stream(&b.id(), &["v1".into()]).await.unwrap_err();
        assert!(matches!(err, HostError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn dropped_listener_is_not_listening() {
        let network = MemoryNetwork::new();
        let a = MemoryHost::new(&network);
        let b = MemoryHost::new(&network);
        drop(b.listen("v1".into()));

        let err = a.new_stream(&b.id(), &["v1".into()]).await.unwrap_err();
        assert!(matches!(err, HostError::ProtocolsNotSupported { .. }));
        assert_eq!(network.streams_opened(), 0);
    }
}
