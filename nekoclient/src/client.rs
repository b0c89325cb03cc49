use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument, Span};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::host::{Host, PeerId, ProtocolId};
use crate::sender::{PeerSender, PreparedSender};

type Sender<H> = PeerSender<<H as Host>::Stream>;

/// Sends requests and messages to other peers.
///
/// Keeps one [PeerSender] per remote peer so every peer gets a single reused stream. Senders
/// that fail are evicted and replaced by a fresh one on the next call.
pub struct Client<H: Host> {
    /// Identity of the local host
    local: PeerId,

    host: Arc<H>,

    /// Accepted protocols, most preferred first
    protocols: Vec<ProtocolId>,

    config: ClientConfig,

    /// One sender per peer; entries are only ever locked for map operations
    senders: DashMap<PeerId, Arc<Sender<H>>>,

    /// Span all client events are recorded in
    span: Span,
}

impl<H: Host> Client<H> {
    /// Create a [Client] speaking `protocol`, then `config.fallback_protocols` in order
    pub fn new(host: Arc<H>, protocol: impl Into<ProtocolId>, config: ClientConfig) -> Result<Self> {
        let protocols = config.protocols(protocol.into())?;
        let local = host.id();
        Ok(Client {
            local,
            host,
            protocols,
            config,
            senders: DashMap::new(),
            span: debug_span!("nekoclient", %local),
        })
    }

    /// Record client events in `span` instead of the default one
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn protocols(&self) -> &[ProtocolId] {
        &self.protocols
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Peers that currently have a sender
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.senders.iter().map(|e| *e.key()).collect()
    }

    /// Send `msg` to `peer` and decode the response with `decode`
    pub async fn send_request<M, T, F>(
        &self,
        cancel: &CancellationToken,
        peer: &PeerId,
        msg: &M,
        decode: F,
    ) -> Result<T>
    where
        M: Serialize + ?Sized,
        F: FnOnce(&[u8]) -> anyhow::Result<T>,
    {
        async {
            let prepared = match self.sender_for_peer(cancel, peer).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, to = %peer, "request failed to open message sender");
                    return Err(e);
                }
            };

            let sender = Arc::clone(prepared.sender());
            let res = prepared
                .send_request(cancel, msg, self.config.read_timeout, decode)
                .await;
            self.forget_if_invalid(peer, &sender);
            if let Err(e) = &res {
                debug!(error = %e, to = %peer, "request failed");
            }
            res
        }
        .instrument(self.span.clone())
        .await
    }

    /// Send `msg` to `peer` without waiting for a response
    pub async fn send_message<M>(&self, cancel: &CancellationToken, peer: &PeerId, msg: &M) -> Result<()>
    where
        M: Serialize + ?Sized,
    {
        async {
            let prepared = match self.sender_for_peer(cancel, peer).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, to = %peer, "message failed to open message sender");
                    return Err(e);
                }
            };

            let sender = Arc::clone(prepared.sender());
            let res = prepared.send_message(cancel, msg).await;
            self.forget_if_invalid(peer, &sender);
            if let Err(e) = &res {
                debug!(error = %e, to = %peer, "message failed");
            }
            res
        }
        .instrument(self.span.clone())
        .await
    }

    /// Drop the sender for `peer`, e.g. when the host reports it disconnected
    pub fn peer_disconnected(&self, peer: &PeerId) {
        if self.senders.remove(peer).is_some() {
            let _enter = self.span.enter();
            debug!(%peer, "peer disconnected, dropped sender");
        }
    }

    /// Existing sender for `peer`, or a new unprepared one
    fn peer_sender(&self, peer: &PeerId) -> Arc<Sender<H>> {
        let entry = self
            .senders
            .entry(*peer)
            .or_insert_with(|| Arc::new(PeerSender::new(*peer)));
        Arc::clone(entry.value())
    }

    /// Resolve a prepared sender for `peer`.
    ///
    /// Preparing happens outside the registry, so a slow peer never holds up the others. If it
    /// fails, the registry entry is only removed when it is still the exact instance that
    /// failed; a replacement put there concurrently gets one attempt instead.
    async fn sender_for_peer(
        &self,
        cancel: &CancellationToken,
        peer: &PeerId,
    ) -> Result<PreparedSender<H::Stream>> {
        let sender = self.peer_sender(peer);
        let err = match self.prepare(cancel, &sender).await {
            Ok(prepared) => return Ok(prepared),
            Err(e) => e,
        };

        // gave up waiting for the lock, the sender itself is fine
        if !sender.is_invalid() {
            return Err(err);
        }

        let retry = match self.replace_or_evict(peer, &sender) {
            Some(current) => current,
            // retired by someone else's failure before we got the lock, start over once
            None if matches!(err, ClientError::Invalidated) => self.peer_sender(peer),
            None => return Err(err),
        };
        debug!(
            %peer,
            failed = sender.instance(),
            retry = retry.instance(),
            "retrying with replacement sender"
        );
        self.retry(cancel, peer, err, &retry).await
    }

    /// The single re-dial on `retry` after a prepare failed with `first`
    async fn retry(
        &self,
        cancel: &CancellationToken,
        peer: &PeerId,
        first: ClientError,
        retry: &Arc<Sender<H>>,
    ) -> Result<PreparedSender<H::Stream>> {
        match self.prepare(cancel, retry).await {
            Ok(prepared) => Ok(prepared),
            Err(e) => {
                self.forget_if_invalid(peer, retry);
                match e {
                    // the replacement was retired by another caller, report our own failure
                    ClientError::Invalidated => Err(first),
                    e => Err(e),
                }
            }
        }
    }

    async fn prepare(
        &self,
        cancel: &CancellationToken,
        sender: &Arc<Sender<H>>,
    ) -> Result<PreparedSender<H::Stream>> {
        sender
            .prepare_or_invalidate(
                cancel,
                self.host.as_ref(),
                &self.protocols,
                self.config.max_message_size,
            )
            .await
    }

    /// Replacement for the failed `sender`, evicting it if it is still registered
    fn replace_or_evict(&self, peer: &PeerId, failed: &Arc<Sender<H>>) -> Option<Arc<Sender<H>>> {
        match self.senders.entry(*peer) {
            // changed, the old one is invalid and not in the map so we can just throw it away
            Entry::Occupied(cur) if !Arc::ptr_eq(cur.get(), failed) => Some(Arc::clone(cur.get())),
            Entry::Occupied(cur) => {
                debug!(%peer, instance = failed.instance(), "evicted invalid sender");
                cur.remove();
                None
            }
            // invalid but not in the map, must have been removed by a disconnect
            Entry::Vacant(_) => None,
        }
    }

    /// Evict `sender` if its last operation retired it
    fn forget_if_invalid(&self, peer: &PeerId, sender: &Arc<Sender<H>>) {
        if sender.is_invalid() {
            self.senders
                .remove_if(peer, |_, cur| Arc::ptr_eq(cur, sender));
        }
    }
}
