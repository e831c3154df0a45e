//! Request/response round-trips over a host's connection

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use tunnelhub_common::{Message, RequestFrame, ResponseFrame};

use crate::error_handling::RelayError;
use crate::pending::PendingRequestTable;
use crate::registry::TunnelRegistry;

/// Bridges a caller waiting for one answer onto a host connection shared by
/// many concurrent requests
#[derive(Debug, Clone)]
pub struct RelayBroker {
    registry: Arc<TunnelRegistry>,
    pending: Arc<PendingRequestTable>,
    default_timeout: Duration,
}

impl RelayBroker {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        pending: Arc<PendingRequestTable>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pending,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending(&self) -> &Arc<PendingRequestTable> {
        &self.pending
    }

    /// Send `frame` to the host of `tunnel_id` and wait for its response
    ///
    /// No pending entry is created for a tunnel that is not connected, and a
    /// failed dispatch cancels its entry before returning.
    pub async fn relay(
        &self,
        tunnel_id: &str,
        frame: RequestFrame,
        timeout: Duration,
    ) -> Result<ResponseFrame, RelayError> {
        let registration = self
            .registry
            .lookup(tunnel_id)
            .ok_or_else(|| RelayError::TunnelNotConnected(tunnel_id.to_string()))?;
        let handle = registration.handle;
        let request_id = frame.request_id.clone();

        let waiter = self
            .pending
            .create(&request_id, tunnel_id, handle.connection_id())?;

        if let Err(e) = handle.dispatch(Message::HttpRequest(frame)) {
            warn!(%tunnel_id, %request_id, error = %e, "Failed to dispatch request");
            self.pending.cancel(&request_id);
            return Err(e);
        }

        debug!(
            %tunnel_id,
            %request_id,
            connection_id = handle.connection_id(),
            "Dispatched request"
        );

        waiter.wait(timeout).await
    }

    /// [`relay`](Self::relay) with the configured timeout
    pub async fn relay_default(
        &self,
        tunnel_id: &str,
        frame: RequestFrame,
    ) -> Result<ResponseFrame, RelayError> {
        self.relay(tunnel_id, frame, self.default_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, TunnelRegistration};
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<TunnelRegistry>,
        pending: Arc<PendingRequestTable>,
        broker: RelayBroker,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(TunnelRegistry::new());
        let pending = Arc::new(PendingRequestTable::new());
        let broker = RelayBroker::new(registry.clone(), pending.clone(), Duration::from_secs(60));
        Fixture {
            registry,
            pending,
            broker,
        }
    }

    fn connect(
        registry: &TunnelRegistry,
        connection_id: &str,
        tunnel_id: &str,
        capacity: usize,
    ) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (handle, rx) = ConnectionHandle::new(connection_id, tunnel_id, capacity);
        registry
            .register(TunnelRegistration::new(handle.clone(), None))
            .unwrap();
        (handle, rx)
    }

    fn frame(request_id: &str) -> RequestFrame {
        RequestFrame::new(request_id.into(), "GET".into(), "/".into(), 0)
    }

    /// Answers every request with `status`, returning the request IDs it saw
    fn spawn_echo_host(
        pending: Arc<PendingRequestTable>,
        connection_id: String,
        mut rx: mpsc::Receiver<Message>,
        status: u16,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(msg) = rx.recv().await {
                if let Message::HttpRequest(req) = msg {
                    seen.push(req.request_id.clone());
                    pending.resolve_from(&connection_id, ResponseFrame::new(req.request_id, status));
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let f = fixture();
        let (_handle, rx) = connect(&f.registry, "conn-1", "tunnel-1", 8);
        spawn_echo_host(f.pending.clone(), "conn-1".into(), rx, 200);

        let res = f.broker.relay_default("tunnel-1", frame("req-1")).await.unwrap();
        assert_eq!(res.status_code, 200);
        assert_eq!(res.request_id, "req-1");
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_relay_unknown_tunnel_creates_no_slot() {
        let f = fixture();
        let err = f
            .broker
            .relay("tunnel-x", frame("req-1"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::TunnelNotConnected("tunnel-x".into()));
        assert!(f.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_timeout_law() {
        let f = fixture();
        let (_handle, mut rx) = connect(&f.registry, "conn-1", "tunnel-1", 8);

        let started = tokio::time::Instant::now();
        let err = f
            .broker
            .relay("tunnel-1", frame("req-1"), Duration::from_secs(60))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, RelayError::Timeout(Duration::from_secs(60)));
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(61));
        assert!(!f.pending.contains("req-1"));

        // The silent host did receive the frame
        assert!(matches!(rx.try_recv(), Ok(Message::HttpRequest(_))));
    }

    #[tokio::test]
    async fn test_relay_full_queue_fails_fast() {
        let f = fixture();
        let (handle, _rx) = connect(&f.registry, "conn-1", "tunnel-1", 1);
        handle.dispatch(Message::Ping).unwrap();

        let err = f
            .broker
            .relay("tunnel-1", frame("req-1"), Duration::from_secs(60))
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::HostUnavailable("tunnel-1".into()));
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_relay_closed_connection() {
        let f = fixture();
        let (_handle, rx) = connect(&f.registry, "conn-1", "tunnel-1", 8);
        drop(rx);

        let err = f
            .broker
            .relay("tunnel-1", frame("req-1"), Duration::from_secs(60))
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::TunnelNotConnected("tunnel-1".into()));
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_isolation() {
        let f = fixture();
        let (a, rx_a) = connect(&f.registry, "conn-a", "tunnel-a", 64);
        let (b, rx_b) = connect(&f.registry, "conn-b", "tunnel-b", 64);
        let host_a = spawn_echo_host(f.pending.clone(), "conn-a".into(), rx_a, 200);
        let host_b = spawn_echo_host(f.pending.clone(), "conn-b".into(), rx_b, 201);

        let mut calls = Vec::new();
        for i in 0..20 {
            let broker = f.broker.clone();
            let (tunnel, id) = if i % 2 == 0 {
                ("tunnel-a", format!("a-{}", i))
            } else {
                ("tunnel-b", format!("b-{}", i))
            };
            calls.push(tokio::spawn(async move {
                broker.relay_default(tunnel, frame(&id)).await
            }));
        }

        for call in calls {
            let res = call.await.unwrap().unwrap();
            let expected = if res.request_id.starts_with("a-") { 200 } else { 201 };
            assert_eq!(res.status_code, expected);
        }

        f.registry.unregister(&a);
        f.registry.unregister(&b);
        drop((a, b));

        let seen_a = host_a.await.unwrap();
        let seen_b = host_b.await.unwrap();
        assert_eq!(seen_a.len(), 10);
        assert_eq!(seen_b.len(), 10);
        assert!(seen_a.iter().all(|id| id.starts_with("a-")));
        assert!(seen_b.iter().all(|id| id.starts_with("b-")));
    }

    #[tokio::test]
    async fn test_replayed_frames_are_independent() {
        let f = fixture();
        let (_handle, rx) = connect(&f.registry, "conn-1", "tunnel-1", 8);
        spawn_echo_host(f.pending.clone(), "conn-1".into(), rx, 200);

        let original = frame("req-1");
        let mut replay = original.clone();
        replay.request_id = "req-2".into();

        let (first, second) = tokio::join!(
            f.broker.relay_default("tunnel-1", original),
            f.broker.relay_default("tunnel-1", replay),
        );

        assert_eq!(first.unwrap().request_id, "req-1");
        assert_eq!(second.unwrap().request_id, "req-2");
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_host_disconnect_fails_in_flight() {
        let f = fixture();
        let (handle, mut rx) = connect(&f.registry, "conn-1", "tunnel-1", 8);

        let broker = f.broker.clone();
        let call = tokio::spawn(async move {
            broker
                .relay("tunnel-1", frame("req-1"), Duration::from_secs(60))
                .await
        });

        // Wait until the frame is on the wire, then tear the host down
        assert!(matches!(rx.recv().await, Some(Message::HttpRequest(_))));
        drop(rx);
        f.registry.unregister(&handle);
        f.pending
            .fail_connection(handle.connection_id(), RelayError::HostDisconnected);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, RelayError::HostDisconnected);
        assert!(f.pending.is_empty());
    }
}
