//! # Tether Sync
//!
//! The remote side of Tether: a per-collection channel that pushes envelopes
//! to a remote peer, holds them in an offline queue while disconnected, and
//! correlates every reply or failure with the transaction that caused it.
//!
//! ## Key Types
//!
//! - [`RemoteChannel`] - Connection state, offline queue, push/fetch
//! - [`RemoteProtocol`] - Pluggable connect/disconnect/fetch/push contract
//! - [`HttpProtocol`] / [`HttpRelationProtocol`] - REST encodings over a [`Transport`]
//! - [`OfflineQueue`] - At most one pending envelope per runtime id
//! - [`ErrorBus`] - Broadcast stream of correlated [`ErrorEvent`]s
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether_core::{Envelope, RtId, TransactionCounter};
//! use tether_sync::{ErrorBus, HttpOptions, HttpProtocol, MemoryServer, RemoteChannel};
//!
//! async fn example() {
//!     let server = MemoryServer::new().with_collection("/todos");
//!     let protocol = HttpProtocol::new(Arc::new(server), HttpOptions::new("/todos"));
//!     let mut channel = RemoteChannel::new(
//!         "todos",
//!         Box::new(protocol),
//!         TransactionCounter::new(),
//!         ErrorBus::default(),
//!     );
//!
//!     channel.set_connected(true).await;
//!     let reply = channel
//!         .submit(Envelope::save(json!({"title": "milk"})).with_rt_id(RtId(1)))
//!         .await
//!         .unwrap();
//!     assert!(reply.is_some());
//! }
//! ```
//!
//! ## Push Encoding
//!
//! ```text
//! save (no serverId)   -> POST   {route}
//! save (serverId)      -> PUT    {route}/{serverId}
//! delete               -> DELETE {route}/{serverId}   => deletePermanently
//! function             -> POST   {route}/{serverId}/{name}   => data.fnReturn
//! ```

pub mod bus;
pub mod channel;
pub mod error;
pub mod http;
pub mod protocol;
pub mod queue;
pub mod transport;
pub mod waiter;
pub mod websocket;

pub use bus::{ErrorBus, ErrorEvent, ErrorTarget};
pub use channel::RemoteChannel;
pub use error::{Result, SyncError};
pub use http::{FunctionHook, HeaderSets, HttpOptions, HttpProtocol, HttpRelationProtocol, ParentScope};
pub use protocol::{FetchOutcome, ProtocolKind, RemoteProtocol};
pub use queue::OfflineQueue;
pub use transport::{memory::MemoryServer, Method, Request, Response, Transport};
pub use waiter::{Outcome, Waiters};
pub use websocket::WebSocketProtocol;
