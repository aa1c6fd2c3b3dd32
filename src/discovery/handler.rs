// Transport handler answering inbound pings
use std::sync::Weak;
use async_trait::async_trait;
use tracing::trace;

use super::error::PingError;
use super::messages::PingRequest;
use super::PingShared;
use crate::transport::RequestHandler;

/// Registered under `PING_ACTION`. Holds the discovery state weakly so the
/// transport's handler table does not keep a dropped `UnicastPing` alive.
pub(crate) struct PingRequestHandler {
    shared: Weak<PingShared>,
}

impl PingRequestHandler {
    pub(crate) fn new(shared: Weak<PingShared>) -> Self {
        Self { shared }
    }

    fn handle_bytes(&self, payload: &[u8]) -> Result<Vec<u8>, PingError> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| PingError::AlreadyClosed("node is shutting down".to_string()))?;
        let request = PingRequest::decode(payload)?;
        trace!(round = request.round_id, from = %request.sender.node, "handling ping");
        shared.handle_ping_request(request)?.encode()
    }
}

#[async_trait]
impl RequestHandler for PingRequestHandler {
    async fn handle(&self, payload: Vec<u8>) -> Result<Vec<u8>, String> {
        self.handle_bytes(&payload).map_err(String::from)
    }
}
