//! Upstream correlation bookkeeping.
//!
//! Requests written upstream carry proxy-assigned correlation ids so that
//! self-sent requests can never collide with ids chosen by the client. The
//! table maps each id back to the original correlation id, the api key the
//! response must be decoded as, and who is waiting for it.

use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::filter::FilterError;
use crate::frame::ApiKey;

pub(crate) enum Recipient {
    /// A client request; the response fills this sequencer slot.
    Client { slot: u64 },
    /// A self-sent request; the response passes back through filters
    /// `floor..` and then completes the promise.
    Filter {
        floor: usize,
        promise: oneshot::Sender<Result<Bytes, FilterError>>,
    },
}

pub(crate) struct PendingRequest {
    pub(crate) downstream_correlation_id: u32,
    pub(crate) api_key: ApiKey,
    pub(crate) api_version: i16,
    pub(crate) recipient: Recipient,
}

#[derive(Default)]
pub(crate) struct CorrelationManager {
    next_id: u32,
    pending: HashMap<u32, PendingRequest>,
}

impl CorrelationManager {
    /// Allocate an upstream correlation id without expecting a response.
    pub(crate) fn allocate(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Allocate an upstream correlation id and remember who awaits its response.
    pub(crate) fn register(&mut self, pending: PendingRequest) -> u32 {
        let id = self.allocate();
        self.pending.insert(id, pending);
        id
    }

    pub(crate) fn take(&mut self, upstream_correlation_id: u32) -> Option<PendingRequest> {
        self.pending.remove(&upstream_correlation_id)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Fail every pending self-sent request; used when the connection closes.
    pub(crate) fn fail_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let Recipient::Filter { promise, .. } = pending.recipient {
                let _ = promise.send(Err(FilterError::ConnectionClosed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_map_back_to_the_downstream_request() {
        let mut manager = CorrelationManager::default();
        let skipped = manager.allocate();
        let id = manager.register(PendingRequest {
            downstream_correlation_id: 42,
            api_key: ApiKey::Fetch,
            api_version: 11,
            recipient: Recipient::Client { slot: 0 },
        });
        assert_ne!(skipped, id);
        assert_eq!(manager.in_flight(), 1);

        let pending = manager.take(id).unwrap();
        assert_eq!(pending.downstream_correlation_id, 42);
        assert_eq!(pending.api_key, ApiKey::Fetch);
        assert!(manager.take(id).is_none());
    }

    #[tokio::test]
    async fn closing_fails_self_sent_promises() {
        let mut manager = CorrelationManager::default();
        let (promise, response) = oneshot::channel();
        manager.register(PendingRequest {
            downstream_correlation_id: 1,
            api_key: ApiKey::Metadata,
            api_version: 12,
            recipient: Recipient::Filter { floor: 1, promise },
        });

        manager.fail_all();
        assert!(matches!(response.await.unwrap(), Err(FilterError::ConnectionClosed)));
        assert_eq!(manager.in_flight(), 0);
    }
}
