//! Remote protocol abstraction.
//!
//! A protocol turns envelopes into calls against a remote peer and turns the
//! peer's answers back into envelopes. The channel above it owns connection
//! state and the offline queue; protocols are stateless apart from their
//! configuration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_core::Envelope;

use crate::error::Result;

/// Which protocol implementation a collection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    Http,
    Websocket,
}

/// Result of fetching a remote collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// One `save` envelope per remote item.
    pub envelopes: Vec<Envelope>,
    /// New "changed since" watermark reported by the peer.
    pub watermark: Option<String>,
    /// The peer reported nothing changed since the watermark sent.
    pub not_modified: bool,
}

/// Protocol trait for talking to a remote peer.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait RemoteProtocol: Send + Sync {
    /// Which protocol this is.
    fn kind(&self) -> ProtocolKind;

    /// Open whatever the protocol needs before pushing.
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down. In-flight calls are not cancelled.
    async fn disconnect(&self) -> Result<()>;

    /// Retrieve the full remote collection.
    ///
    /// `since` is the last watermark; protocols that support conditional
    /// fetches send it to the peer.
    async fn fetch(&self, since: Option<&str>) -> Result<FetchOutcome>;

    /// Push one envelope and decode the peer's answer.
    ///
    /// The returned envelope keeps the request's runtime id, store id and
    /// transaction id so it can be reconciled and correlated.
    async fn push(&self, envelope: &Envelope) -> Result<Envelope>;
}
