//! Directory of connected hosts keyed by tunnel ID

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};
use tunnelhub_common::Message;

use crate::error_handling::RelayError;

/// Addressable outbound side of one transport connection
///
/// Sending never waits: the queue is bounded and a full queue is reported to
/// the caller instead of stalling it.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: String,
    tunnel_id: String,
    tx: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    pub fn new(
        connection_id: impl Into<String>,
        tunnel_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            connection_id: connection_id.into(),
            tunnel_id: tunnel_id.into(),
            tx,
        };
        (handle, rx)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Enqueue a frame for this connection without blocking
    pub fn dispatch(&self, message: Message) -> Result<(), RelayError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RelayError::HostUnavailable(self.tunnel_id.clone())),
            Err(TrySendError::Closed(_)) => {
                Err(RelayError::TunnelNotConnected(self.tunnel_id.clone()))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One currently connected host
#[derive(Debug, Clone)]
pub struct TunnelRegistration {
    pub tunnel_id: String,
    pub handle: ConnectionHandle,
    /// Argon2 PHC string; presence means every HTTP request must authenticate
    pub password_hash: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl TunnelRegistration {
    pub fn new(handle: ConnectionHandle, password_hash: Option<String>) -> Self {
        Self {
            tunnel_id: handle.tunnel_id().to_string(),
            handle,
            password_hash,
            connected_at: Utc::now(),
        }
    }

    pub fn is_protected(&self) -> bool {
        self.password_hash.is_some()
    }
}

/// Registry of connected hosts
///
/// Every mutation goes through a single shard lock of the map, so register is
/// an atomic check-then-insert and unregister only removes the entry it owns.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelRegistration>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a host addressable under its tunnel ID
    ///
    /// An already registered ID is never taken over.
    pub fn register(&self, registration: TunnelRegistration) -> Result<(), RelayError> {
        match self.tunnels.entry(registration.tunnel_id.clone()) {
            Entry::Occupied(existing) => {
                debug!(
                    "Rejecting registration of {} from {}: held by {}",
                    registration.tunnel_id,
                    registration.handle.connection_id(),
                    existing.get().handle.connection_id()
                );
                Err(RelayError::TunnelConflict(registration.tunnel_id))
            }
            Entry::Vacant(slot) => {
                info!(
                    "Registered tunnel {} on connection {} (protected: {})",
                    registration.tunnel_id,
                    registration.handle.connection_id(),
                    registration.is_protected()
                );
                slot.insert(registration);
                Ok(())
            }
        }
    }

    /// Remove the registration owned by `handle`, if any
    ///
    /// Idempotent. A registration made by another connection under the same
    /// tunnel ID is left alone.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let removed = self
            .tunnels
            .remove_if(handle.tunnel_id(), |_, reg| {
                reg.handle.connection_id() == handle.connection_id()
            })
            .is_some();

        if removed {
            info!(
                "Unregistered tunnel {} (connection {})",
                handle.tunnel_id(),
                handle.connection_id()
            );
        }
        removed
    }

    pub fn lookup(&self, tunnel_id: &str) -> Option<TunnelRegistration> {
        self.tunnels.get(tunnel_id).map(|reg| reg.value().clone())
    }

    /// Snapshot of all registrations, ordered by tunnel ID
    pub fn list(&self) -> Vec<TunnelRegistration> {
        let mut all: Vec<_> = self.tunnels.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        all
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
