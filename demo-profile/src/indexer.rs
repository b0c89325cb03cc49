use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use nekoclient::memory::{IncomingStream, MemoryHost, MemoryNetwork};
use nekoclient::{decode, encode, framed, Host, PeerId, ProtocolId};

/// Protocol indexers accept advertisements on
pub const INGEST_PROTOCOL: &str = "/indexer/ingest/1.0.0";

/// Content advertisement pushed by a provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Advertisement {
    /// Unique id of this advertisement
    pub id: Uuid,

    /// Provider announcing the content
    pub provider: PeerId,

    /// Context the entries are published under
    pub context_id: String,

    /// Multihashes of the advertised content
    pub entries: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum IndexerRequest {
    Announce(Advertisement),
    Search(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum IndexerResponse {
    Ack(Uuid),
    Providers(Vec<PeerId>),
}

impl IndexerResponse {
    /// Decoder for answers to [IndexerRequest::Announce]
    pub fn ack(bytes: &[u8]) -> anyhow::Result<Uuid> {
        match decode(bytes)? {
            IndexerResponse::Ack(id) => Ok(id),
            other => anyhow::bail!("expected ack, got {other:?}"),
        }
    }

    /// Decoder for answers to [IndexerRequest::Search]
    pub fn providers(bytes: &[u8]) -> anyhow::Result<Vec<PeerId>> {
        match decode(bytes)? {
            IndexerResponse::Providers(p) => Ok(p),
            other => anyhow::bail!("expected providers, got {other:?}"),
        }
    }
}

/// In-process indexer node answering advertisements over a [MemoryNetwork]
#[derive(Clone)]
pub struct IndexerServer {
    /// Identity of this indexer
    id: PeerId,

    /// Context id to the providers that advertised it
    index: Arc<DashMap<String, DashSet<PeerId>>>,

    /// Hang up every this many requests, to exercise the client's recovery
    drop_every: Option<usize>,

    max_message_size: usize,
}

impl IndexerServer {
    /// Join `network` and start serving [INGEST_PROTOCOL]
    pub fn spawn(network: &MemoryNetwork, drop_every: Option<usize>, max_message_size: usize) -> Self {
        let host = MemoryHost::new(network);
        let server = IndexerServer {
            id: host.id(),
            index: Arc::new(DashMap::new()),
            drop_every,
            max_message_size,
        };
        let incoming = host.listen(ProtocolId::from(INGEST_PROTOCOL));
        tokio::spawn(server.clone().serve(incoming));
        server
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Number of distinct contexts indexed
    pub fn contexts(&self) -> usize {
        self.index.len()
    }

    async fn serve(self, mut incoming: mpsc::Receiver<IncomingStream>) {
        while let Some(inc) = incoming.recv().await {
            debug!(indexer = %self.id, remote = %inc.remote, protocol = %inc.protocol, "accepted stream");
            tokio::spawn(self.clone().handle(inc.stream));
        }
    }

    async fn handle(self, stream: DuplexStream) {
        let mut s = framed(stream, self.max_message_size);
        let mut served = 0;
        while let Some(frame) = s.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    warn!(indexer = %self.id, error = %e, "bad frame");
                    return;
                }
            };
            served += 1;
            if self.drop_every.is_some_and(|n| served % n == 0) {
                debug!(indexer = %self.id, "dropping stream");
                return;
            }

            let response = match decode::<IndexerRequest>(&frame) {
                Ok(req) => self.apply(req),
                Err(e) => {
                    warn!(indexer = %self.id, error = %e, "undecodable request");
                    return;
                }
            };
            let bytes = match encode(&response) {
                Ok(b) => b,
                Err(e) => {
                    warn!(indexer = %self.id, error = %e, "failed to encode response");
                    return;
                }
            };
            if s.send(Bytes::from(bytes)).await.is_err() {
                return;
            }
        }
    }

    fn apply(&self, req: IndexerRequest) -> IndexerResponse {
        match req {
            IndexerRequest::Announce(ad) => {
                debug!(
                    indexer = %self.id,
                    provider = %ad.provider,
                    context = %ad.context_id,
                    entries = ad.entries.len(),
                    "registered advertisement"
                );
                self.index.entry(ad.context_id).or_default().insert(ad.provider);
                IndexerResponse::Ack(ad.id)
            }
            IndexerRequest::Search(context_id) => IndexerResponse::Providers(
                self.index
                    .get(&context_id)
                    .map(|set| set.iter().map(|p| *p.key()).collect())
                    .unwrap_or_default(),
            ),
        }
    }
}
