//! Room routing: fan-out of server events to document subscribers.
//!
//! ```text
//!            ┌─ conn A ── mpsc ──► writer task ──► WebSocket
//! doc_id ────┼─ conn B ── mpsc ──► writer task ──► WebSocket
//!            └─ conn C ── mpsc ──► writer task ──► WebSocket
//! ```
//!
//! Each subscriber is a bounded per-connection channel, so delivery to one
//! connection preserves send order while connections never block each
//! other beyond channel backpressure. Broadcast can exclude one sender,
//! which is how an author avoids receiving its own op back.
//!
//! Senders are collected under the map lock and awaited after it is
//! dropped; no guard is held across a suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::ServerEvent;

/// Identifies one live connection.
pub type ConnectionId = Uuid;

/// Routing statistics (lock-free counters).
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub events_routed: u64,
    pub events_dropped: u64,
}

#[derive(Default)]
struct AtomicRouterStats {
    events_routed: AtomicU64,
    events_dropped: AtomicU64,
}

/// Document → subscriber map.
pub struct RoomRouter {
    rooms: RwLock<HashMap<Uuid, HashMap<ConnectionId, mpsc::Sender<ServerEvent>>>>,
    stats: AtomicRouterStats,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            stats: AtomicRouterStats::default(),
        }
    }

    /// Subscribe a connection to a document room. Idempotent: re-joining
    /// replaces the stored sender.
    pub async fn subscribe(
        &self,
        doc_id: Uuid,
        conn_id: ConnectionId,
        sender: mpsc::Sender<ServerEvent>,
    ) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(doc_id).or_default().insert(conn_id, sender);
    }

    /// Remove a connection from one room. Idempotent; empty rooms are
    /// dropped.
    pub async fn unsubscribe(&self, doc_id: Uuid, conn_id: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        if let Some(subscribers) = rooms.get_mut(&doc_id) {
            subscribers.remove(&conn_id);
            if subscribers.is_empty() {
                rooms.remove(&doc_id);
                log::debug!("room {doc_id} removed (empty)");
            }
        }
    }

    /// Remove a connection from every room it is in; returns the rooms it
    /// left. Disconnect path.
    pub async fn unsubscribe_all(&self, conn_id: ConnectionId) -> Vec<Uuid> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|doc_id, subscribers| {
            if subscribers.remove(&conn_id).is_some() {
                left.push(*doc_id);
            }
            !subscribers.is_empty()
        });
        left
    }

    /// Whether a connection is subscribed to a room.
    pub async fn is_subscribed(&self, doc_id: Uuid, conn_id: ConnectionId) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(&doc_id)
            .is_some_and(|subs| subs.contains_key(&conn_id))
    }

    /// Deliver `event` to every subscriber of `doc_id` except `exclude`.
    ///
    /// Returns the number of connections the event was handed to. A
    /// subscriber whose channel has closed is skipped (its disconnect
    /// cleanup will prune it).
    pub async fn broadcast(
        &self,
        doc_id: Uuid,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let senders: Vec<mpsc::Sender<ServerEvent>> = {
            let rooms = self.rooms.read().await;
            match rooms.get(&doc_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|(conn_id, _)| Some(**conn_id) != exclude)
                    .map(|(_, tx)| tx.clone())
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for sender in senders {
            if sender.send(event.clone()).await.is_ok() {
                delivered += 1;
                self.stats.events_routed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        delivered
    }

    /// Number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Number of subscribers in one room.
    pub async fn subscriber_count(&self, doc_id: Uuid) -> usize {
        self.rooms
            .read()
            .await
            .get(&doc_id)
            .map_or(0, |subs| subs.len())
    }

    /// Snapshot of the routing counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            events_routed: self.stats.events_routed.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(version: u64) -> ServerEvent {
        ServerEvent::OpAck { version }
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_idempotent() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);

        router.subscribe(doc, conn, tx.clone()).await;
        router.subscribe(doc, conn, tx).await;
        assert_eq!(router.subscriber_count(doc).await, 1);

        router.unsubscribe(doc, conn).await;
        router.unsubscribe(doc, conn).await;
        assert_eq!(router.subscriber_count(doc).await, 0);
        assert_eq!(router.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        router.subscribe(doc, Uuid::new_v4(), tx1).await;
        router.subscribe(doc, Uuid::new_v4(), tx2).await;

        let delivered = router.broadcast(doc, &ack(1), None).await;
        assert_eq!(delivered, 2);
        assert_eq!(rx1.recv().await.unwrap(), ack(1));
        assert_eq!(rx2.recv().await.unwrap(), ack(1));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let sender_conn = Uuid::new_v4();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        router.subscribe(doc, sender_conn, tx1).await;
        router.subscribe(doc, Uuid::new_v4(), tx2).await;

        let delivered = router.broadcast(doc, &ack(2), Some(sender_conn)).await;
        assert_eq!(delivered, 1);
        assert_eq!(rx2.recv().await.unwrap(), ack(2));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_isolated_per_room() {
        let router = RoomRouter::new();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        router.subscribe(doc_a, Uuid::new_v4(), tx_a).await;
        router.subscribe(doc_b, Uuid::new_v4(), tx_b).await;

        router.broadcast(doc_a, &ack(1), None).await;
        assert_eq!(rx_a.recv().await.unwrap(), ack(1));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_room() {
        let router = RoomRouter::new();
        assert_eq!(router.broadcast(Uuid::new_v4(), &ack(1), None).await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_reports_rooms() {
        let router = RoomRouter::new();
        let conn = Uuid::new_v4();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);
        router.subscribe(doc_a, conn, tx.clone()).await;
        router.subscribe(doc_b, conn, tx.clone()).await;
        // A second subscriber keeps doc_b's room alive afterwards.
        let other = Uuid::new_v4();
        let (tx2, _rx2) = mpsc::channel(4);
        router.subscribe(doc_b, other, tx2).await;

        let mut left = router.unsubscribe_all(conn).await;
        left.sort();
        let mut expected = vec![doc_a, doc_b];
        expected.sort();
        assert_eq!(left, expected);
        assert_eq!(router.room_count().await, 1);
        assert!(router.is_subscribed(doc_b, other).await);
        assert!(!router.is_subscribed(doc_b, conn).await);
    }

    #[tokio::test]
    async fn test_closed_receiver_counts_as_dropped() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        router.subscribe(doc, Uuid::new_v4(), tx).await;

        let delivered = router.broadcast(doc, &ack(1), None).await;
        assert_eq!(delivered, 0);
        assert_eq!(router.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_per_connection_order_preserved() {
        let router = RoomRouter::new();
        let doc = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(16);
        router.subscribe(doc, Uuid::new_v4(), tx).await;

        for version in 1..=5 {
            router.broadcast(doc, &ack(version), None).await;
        }
        for version in 1..=5 {
            assert_eq!(rx.recv().await.unwrap(), ack(version));
        }
    }
}
