//! Correlation of in-flight requests with their eventual responses

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use tunnelhub_common::ResponseFrame;

use crate::error_handling::RelayError;

type Outcome = Result<ResponseFrame, RelayError>;

/// Broker-side bookkeeping for one request awaiting its response
#[derive(Debug)]
struct PendingRequest {
    tunnel_id: String,
    connection_id: String,
    created_at: Instant,
    /// Distinguishes this entry from a later one reusing the same request ID
    seq: u64,
    slot: oneshot::Sender<Outcome>,
}

/// Table of outstanding round-trips
///
/// An entry leaves the table exactly once: through a response, a timeout, a
/// cancellation, a connection failure, or its waiter being dropped. Whichever
/// comes first wins; the others find nothing and do nothing.
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    entries: Arc<DashMap<String, PendingRequest>>,
    next_seq: AtomicU64,
}

/// Receiving side of a pending request
///
/// Dropping it (for example because the HTTP caller went away) removes the
/// entry from the table.
#[derive(Debug)]
pub struct Waiter {
    request_id: String,
    seq: u64,
    rx: oneshot::Receiver<Outcome>,
    entries: Arc<DashMap<String, PendingRequest>>,
}

impl Waiter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait until resolved or until `timeout` elapses
    ///
    /// On timeout the entry is removed before returning, so a late response
    /// finds nothing to resolve.
    pub async fn wait(mut self, timeout: Duration) -> Outcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Slot dropped without an answer: the entry was cancelled
            Ok(Err(_)) => Err(RelayError::HostDisconnected),
            Err(_) => {
                self.remove_own_entry();
                debug!(request_id = %self.request_id, ?timeout, "Request timed out");
                Err(RelayError::Timeout(timeout))
            }
        }
    }

    fn remove_own_entry(&self) {
        let seq = self.seq;
        self.entries.remove_if(&self.request_id, |_, p| p.seq == seq);
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.remove_own_entry();
    }
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new slot for `request_id`, dispatched on `connection_id`
    pub fn create(
        &self,
        request_id: &str,
        tunnel_id: &str,
        connection_id: &str,
    ) -> Result<Waiter, RelayError> {
        let (slot, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        match self.entries.entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                warn!("Duplicate request ID {}", request_id);
                return Err(RelayError::DuplicateRequestId(request_id.to_string()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingRequest {
                    tunnel_id: tunnel_id.to_string(),
                    connection_id: connection_id.to_string(),
                    created_at: Instant::now(),
                    seq,
                    slot,
                });
            }
        }

        Ok(Waiter {
            request_id: request_id.to_string(),
            seq,
            rx,
            entries: self.entries.clone(),
        })
    }

    /// Deliver a response to whoever waits on its request ID
    ///
    /// Unknown IDs (already timed out, cancelled or resolved) are a logged no-op.
    pub fn resolve(&self, response: ResponseFrame) -> bool {
        match self.entries.remove(&response.request_id) {
            Some((request_id, pending)) => deliver(&request_id, pending, Ok(response)),
            None => {
                warn!(request_id = %response.request_id, "Dropping response for unknown request");
                false
            }
        }
    }

    /// Like [`resolve`](Self::resolve), but only for requests dispatched on
    /// `connection_id`
    pub fn resolve_from(&self, connection_id: &str, response: ResponseFrame) -> bool {
        let removed = self
            .entries
            .remove_if(&response.request_id, |_, p| p.connection_id == connection_id);

        match removed {
            Some((request_id, pending)) => deliver(&request_id, pending, Ok(response)),
            None if self.entries.contains_key(&response.request_id) => {
                warn!(
                    connection_id,
                    request_id = %response.request_id,
                    "Connection answered a request it was never sent"
                );
                false
            }
            None => {
                warn!(
                    connection_id,
                    request_id = %response.request_id,
                    "Dropping response for unknown request"
                );
                false
            }
        }
    }

    /// Drop a slot whose request could not be dispatched
    pub fn cancel(&self, request_id: &str) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Fail every request dispatched on `connection_id` with `error`
    pub fn fail_connection(&self, connection_id: &str, error: RelayError) -> usize {
        let request_ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.connection_id == connection_id)
            .map(|e| e.key().clone())
            .collect();

        let mut failed = 0;
        for id in request_ids {
            let Some((request_id, pending)) = self
                .entries
                .remove_if(&id, |_, p| p.connection_id == connection_id)
            else {
                continue;
            };
            debug!(
                tunnel_id = %pending.tunnel_id,
                %request_id,
                %error,
                "Failing in-flight request"
            );
            deliver(&request_id, pending, Err(error.clone()));
            failed += 1;
        }
        failed
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn deliver(request_id: &str, pending: PendingRequest, outcome: Outcome) -> bool {
    let waited = pending.created_at.elapsed();
    if pending.slot.send(outcome).is_err() {
        debug!("Waiter for request {} is gone", request_id);
        return false;
    }
    debug!(request_id, ?waited, "Resolved request");
    true
}
