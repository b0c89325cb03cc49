//! Request/response client for peer-to-peer hosts.
//!
//! A [Client] keeps one [PeerSender] per remote peer. Each sender lazily opens a stream through
//! the [Host], serializes every exchange with that peer over it, and is retired on the first I/O
//! failure so the next call starts from a fresh stream. Messages are plain [serde] values; the
//! caller decides how a response is decoded.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nekoclient::memory::{MemoryHost, MemoryNetwork};
//! use nekoclient::{decode, CancellationToken, Client, ClientConfig, PeerId};
//!
//! # async fn run(indexer: PeerId) -> anyhow::Result<()> {
//! let network = MemoryNetwork::new();
//! let host = Arc::new(MemoryHost::new(&network));
//! let client = Client::new(host, "/indexer/ingest/1.0.0", ClientConfig::default())?;
//!
//! let cancel = CancellationToken::new();
//! let ack: bool = client
//!     .send_request(&cancel, &indexer, "bafy...", decode::<bool>)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod ctx_mutex;
pub mod error;
pub mod host;
pub mod memory;
pub mod message;
pub mod sender;

pub use client::Client;
pub use config::ClientConfig;
pub use ctx_mutex::CtxMutex;
pub use error::{ClientError, Result};
pub use host::{Host, HostError, PeerId, ProtocolId};
pub use message::{decode, encode, framed};
pub use sender::{PeerSender, PreparedSender};
pub use tokio_util::sync::CancellationToken;
