//! WebSocket protocol placeholder.
//!
//! Selecting `websocket` for a collection is accepted by configuration, but no
//! handshake or framing is defined. Connecting succeeds without opening
//! anything; fetch and push fail with [`SyncError::Unsupported`], which is not
//! retried, so pushes surface on the error stream instead of piling up in the
//! offline queue.

use async_trait::async_trait;
use tether_core::Envelope;

use crate::error::{Result, SyncError};
use crate::protocol::{FetchOutcome, ProtocolKind, RemoteProtocol};

#[derive(Debug, Clone, Default)]
pub struct WebSocketProtocol {
    route: String,
}

impl WebSocketProtocol {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    fn unsupported<T>(&self) -> Result<T> {
        tracing::debug!(route = %self.route, "websocket protocol has no implementation");
        Err(SyncError::Unsupported(ProtocolKind::Websocket))
    }
}

#[async_trait]
impl RemoteProtocol for WebSocketProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Websocket
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, _since: Option<&str>) -> Result<FetchOutcome> {
        self.unsupported()
    }

    async fn push(&self, _envelope: &Envelope) -> Result<Envelope> {
        self.unsupported()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_and_push_are_unsupported() {
        let ws = WebSocketProtocol::new("/todos");
        assert_eq!(ws.kind(), ProtocolKind::Websocket);
        assert!(ws.connect().await.is_ok());
        assert!(matches!(
            ws.fetch(None).await,
            Err(SyncError::Unsupported(ProtocolKind::Websocket))
        ));
        assert!(ws.push(&Envelope::save(json!({}))).await.is_err());
        assert!(ws.disconnect().await.is_ok());
    }
}
