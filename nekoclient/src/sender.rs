use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ctx_mutex::CtxMutex;
use crate::error::{ClientError, Result};
use crate::host::{Host, PeerId, ProtocolId};
use crate::message::{encode, framed};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Stream state, only touched while holding the sender's lock
struct SenderState<S> {
    stream: Option<Framed<S, LengthDelimitedCodec>>,
}

/// Serializes all traffic to one peer through a single stream.
///
/// The stream is opened lazily by [PeerSender::prepare_or_invalidate]. The first I/O failure
/// retires the sender for good: its stream is dropped and every later prepare fails with
/// [ClientError::Invalidated], so the owner has to build a new one.
pub struct PeerSender<S> {
    /// Remote peer
    peer: PeerId,

    /// Process-wide unique id of this instance
    instance: u64,

    /// Set once, on the first failure
    invalid: AtomicBool,

    state: CtxMutex<SenderState<S>>,
}

impl<S> PeerSender<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    /// Create an unprepared sender for `peer`
    pub fn new(peer: PeerId) -> Self {
        PeerSender {
            peer,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            invalid: AtomicBool::new(false),
            state: CtxMutex::new(SenderState { stream: None }),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Take the lock and make sure a usable stream is in place.
    ///
    /// Opens a stream through `host` if there is none yet, trying `protocols` in order. A failed
    /// or cancelled negotiation invalidates the sender. On success the returned
    /// [PreparedSender] keeps the lock until it is dropped.
    pub async fn prepare_or_invalidate<H>(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        host: &H,
        protocols: &[ProtocolId],
        max_message_size: usize,
    ) -> Result<PreparedSender<S>>
    where
        H: Host<Stream = S>,
    {
        let mut state = self.state.lock(cancel).await?;
        if self.is_invalid() {
            return Err(ClientError::Invalidated);
        }

        if state.stream.is_none() {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                res = host.new_stream(&self.peer, protocols) => {
                    res.map_err(|source| ClientError::Negotiation { peer: self.peer, source })
                }
            };

            match opened {
                Ok((stream, protocol)) => {
                    trace!(peer = %self.peer, instance = self.instance, %protocol, "opened stream");
                    state.stream = Some(framed(stream, max_message_size));
                }
                Err(e) => {
                    self.invalidate(&mut state);
                    return Err(e);
                }
            }
        }

        Ok(PreparedSender {
            sender: Arc::clone(self),
            state,
        })
    }

    fn invalidate(&self, state: &mut SenderState<S>) {
        self.invalid.store(true, Ordering::Release);
        if state.stream.take().is_some() {
            trace!(peer = %self.peer, instance = self.instance, "dropped stream");
        }
    }
}

/// A [PeerSender] with its lock held and its stream ready
pub struct PreparedSender<S> {
    sender: Arc<PeerSender<S>>,
    state: OwnedMutexGuard<SenderState<S>>,
}

impl<S> PreparedSender<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    /// The sender whose lock is held
    pub fn sender(&self) -> &Arc<PeerSender<S>> {
        &self.sender
    }

    /// Write `msg`, then wait up to `read_timeout` for one response frame and hand it to `decode`.
    ///
    /// Any write or read failure invalidates the sender. An error from `decode` is returned as
    /// [ClientError::Decode] and leaves the stream in place.
    pub async fn send_request<M, T, F>(
        mut self,
        cancel: &CancellationToken,
        msg: &M,
        read_timeout: Duration,
        decode: F,
    ) -> Result<T>
    where
        M: Serialize + ?Sized,
        F: FnOnce(&[u8]) -> anyhow::Result<T>,
    {
        self.write(cancel, msg).await?;
        let frame = self.read(cancel, read_timeout).await?;
        decode(&frame[..]).map_err(ClientError::Decode)
    }

    /// Write `msg` without waiting for a response
    pub async fn send_message<M>(mut self, cancel: &CancellationToken, msg: &M) -> Result<()>
    where
        M: Serialize + ?Sized,
    {
        self.write(cancel, msg).await
    }

    async fn write<M>(&mut self, cancel: &CancellationToken, msg: &M) -> Result<()>
    where
        M: Serialize + ?Sized,
    {
        let buf = encode(msg)?;
        let Some(stream) = self.state.stream.as_mut() else {
            return Err(ClientError::Invalidated);
        };
        let max = stream.codec().max_frame_length();
        if buf.len() > max {
            return Err(ClientError::MessageTooLarge {
                size: buf.len(),
                max,
            });
        }

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            res = stream.send(Bytes::from(buf)) => res.map_err(ClientError::Write),
        };
        if let Err(e) = res {
            debug!(peer = %self.sender.peer, error = %e, "error writing message");
            self.sender.invalidate(&mut self.state);
            return Err(e);
        }
        Ok(())
    }

    async fn read(&mut self, cancel: &CancellationToken, read_timeout: Duration) -> Result<BytesMut> {
        let Some(stream) = self.state.stream.as_mut() else {
            return Err(ClientError::Invalidated);
        };

        // the window is fixed and starts here, whatever the caller's own deadline is
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            res = tokio::time::timeout(read_timeout, stream.next()) => match res {
                Err(_) => Err(ClientError::ReadTimeout),
                Ok(None) => Err(ClientError::Read(io::ErrorKind::UnexpectedEof.into())),
                Ok(Some(Err(e))) => Err(ClientError::Read(e)),
                Ok(Some(Ok(frame))) => Ok(frame),
            },
        };
        if let Err(e) = &res {
            debug!(peer = %self.sender.peer, error = %e, "error reading response");
            self.sender.invalidate(&mut self.state);
        }
        res
    }
}
