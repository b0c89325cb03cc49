//! Shared helpers for the nekoclient integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use nekoclient::memory::{MemoryHost, MemoryNetwork};
use nekoclient::{framed, Client, ClientConfig, Host, HostError, PeerId, ProtocolId};

pub const PROTO: &str = "/indexer/ingest/1.0.0";
pub const MAX: usize = 64 * 1024;

/// What one dial through a [ScriptedHost] does
#[derive(Clone, Copy, Debug, Default)]
pub struct Dial {
    /// Wait this long before doing anything
    pub delay: Duration,

    /// Fail instead of negotiating
    pub fail: bool,
}

impl Dial {
    pub fn pass_after(delay: Duration) -> Self {
        Dial { delay, fail: false }
    }

    pub fn fail_after(delay: Duration) -> Self {
        Dial { delay, fail: true }
    }
}

/// [MemoryHost] wrapper that follows a per-dial script and records every protocol it tries
#[derive(Clone)]
pub struct ScriptedHost {
    inner: MemoryHost,
    script: Arc<Mutex<VecDeque<Dial>>>,
    attempts: Arc<Mutex<Vec<ProtocolId>>>,
    dials: Arc<AtomicUsize>,
}

impl ScriptedHost {
    pub fn new(network: &MemoryNetwork) -> Self {
        ScriptedHost {
            inner: MemoryHost::new(network),
            script: Arc::default(),
            attempts: Arc::default(),
            dials: Arc::default(),
        }
    }

    /// Queue behaviour for upcoming dials; unscripted dials pass immediately
    pub fn script(&self, dials: impl IntoIterator<Item = Dial>) {
        self.script.lock().unwrap().extend(dials);
    }

    /// Protocols tried so far, in order
    pub fn attempts(&self) -> Vec<ProtocolId> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Host for ScriptedHost {
    type Stream = DuplexStream;

    fn id(&self) -> PeerId {
        self.inner.id()
    }

    fn new_stream(
        &self,
        peer: &PeerId,
        protocols: &[ProtocolId],
    ) -> impl Future<Output = Result<(Self::Stream, ProtocolId), HostError>> + Send {
        let inner = self.inner.clone();
        let attempts = Arc::clone(&self.attempts);
        let step = self.script.lock().unwrap().pop_front().unwrap_or_default();
        self.dials.fetch_add(1, Ordering::SeqCst);
        let peer = *peer;
        let protocols = protocols.to_vec();

        async move {
            tokio::time::sleep(step.delay).await;
            if step.fail {
                return Err(HostError::Dial("scripted failure".to_owned()));
            }

            // one protocol at a time so every attempt is visible
            for p in protocols.iter() {
                attempts.lock().unwrap().push(p.clone());
                match inner.new_stream(&peer, std::slice::from_ref(p)).await {
                    Ok(opened) => return Ok(opened),
                    Err(HostError::ProtocolsNotSupported { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(HostError::ProtocolsNotSupported { peer, protocols })
        }
    }
}

/// How a test peer answers
#[derive(Clone, Copy, Debug)]
pub enum Responder {
    /// Echo every frame back after `delay`
    Echo { delay: Duration },

    /// Echo the first `n` frames, then hang up
    EchoThenClose { n: usize },

    /// Read frames but never answer
    Silent,
}

/// Join `network` as a peer that answers on `protocols` the way `responder` says.
///
/// Returns the peer id and the protocols streams were accepted under.
pub fn spawn_peer(
    network: &MemoryNetwork,
    protocols: &[&str],
    responder: Responder,
) -> (PeerId, Arc<Mutex<Vec<ProtocolId>>>) {
    let host = MemoryHost::new(network);
    let negotiated = Arc::new(Mutex::new(Vec::new()));

    for p in protocols {
        let mut incoming = host.listen((*p).into());
        let negotiated = Arc::clone(&negotiated);
        tokio::spawn(async move {
            while let Some(inc) = incoming.recv().await {
                negotiated.lock().unwrap().push(inc.protocol.clone());
                tokio::spawn(respond(inc.stream, responder));
            }
        });
    }

    (host.id(), negotiated)
}

async fn respond(stream: DuplexStream, responder: Responder) {
    let mut s = framed(stream, MAX);
    let mut seen = 0;
    while let Some(Ok(frame)) = s.next().await {
        seen += 1;
        match responder {
            Responder::Echo { delay } => {
                tokio::time::sleep(delay).await;
            }
            Responder::EchoThenClose { n } if seen > n => return,
            Responder::EchoThenClose { .. } => {}
            Responder::Silent => continue,
        }
        if s.send(frame.freeze()).await.is_err() {
            return;
        }
        if matches!(responder, Responder::EchoThenClose { n } if seen == n) {
            return;
        }
    }
}

pub fn echo() -> Responder {
    Responder::Echo {
        delay: Duration::ZERO,
    }
}

pub fn client<H: Host>(host: H, config: ClientConfig) -> Arc<Client<H>> {
    Arc::new(Client::new(Arc::new(host), PROTO, config).expect("valid client config"))
}

/// Layer recording, for every event, the names of the spans it was emitted in (outermost first)
#[derive(Clone, Default)]
pub struct SpanCapture(Arc<Mutex<Vec<Vec<&'static str>>>>);

impl SpanCapture {
    pub fn scopes(&self) -> Vec<Vec<&'static str>> {
        self.0.lock().unwrap().clone()
    }
}

impl<S> Layer<S> for SpanCapture
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let scope = ctx
            .event_scope(event)
            .map(|scope| scope.from_root().map(|span| span.name()).collect())
            .unwrap_or_default();
        self.0.lock().unwrap().push(scope);
    }
}
