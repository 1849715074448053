//! Per-connection collaboration state machine.
//!
//! One `CollabSession` wraps one authenticated duplex connection and owns
//! its protocol state: which rooms it joined and how inbound events are
//! served. The transport is injected as a plain outbound channel, so the
//! whole state machine runs in tests without a socket.
//!
//! Write-path choreography for `send-op`:
//! ```text
//! lock:doc:{id} ── acquire (3s deadline, proceed on timeout)
//!   apply_operation (transform → compose → version gate → log)
//!   op-ack ──► sender            (before any later peer op)
//!   receive-op ──► room \ sender (transformed delta)
//! release (compare-and-delete, only if held)
//! ```
//!
//! Errors reach only the originating connection, as `op-error` for a
//! rejected op and `error` for join-level failures; they are never
//! broadcast.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::lock::{acquire_with_deadline, doc_lock_key, LockConfig, LockService};
use crate::protocol::{ClientEvent, CursorRange, ServerEvent, VersionedDelta};
use crate::room::{ConnectionId, RoomRouter};
use crate::service::{DocumentService, ServiceError};
use crate::store::StoreError;
use scribe_ot::Delta;

/// Shared handles a session operates on. Injected so tests substitute
/// in-memory fakes.
pub struct SessionContext {
    pub service: DocumentService,
    pub locks: Arc<dyn LockService>,
    pub router: Arc<RoomRouter>,
    pub lock_config: LockConfig,
}

/// One connection's server-side state machine.
pub struct CollabSession {
    ctx: Arc<SessionContext>,
    conn_id: ConnectionId,
    user_id: String,
    /// Outbound channel to this connection's writer task.
    outbound: mpsc::Sender<ServerEvent>,
    /// Rooms this connection joined (and was authorized for).
    joined: HashSet<Uuid>,
}

impl CollabSession {
    pub fn new(
        ctx: Arc<SessionContext>,
        conn_id: ConnectionId,
        user_id: impl Into<String>,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            ctx,
            conn_id,
            user_id: user_id.into(),
            outbound,
            joined: HashSet::new(),
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Dispatch one inbound event.
    pub async fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::JoinDoc {
                doc_id,
                from_version,
            } => self.handle_join(doc_id, from_version).await,
            ClientEvent::SendOp {
                doc_id,
                delta,
                base_version,
            } => self.handle_send_op(doc_id, delta, base_version).await,
            ClientEvent::CursorUpdate { doc_id, range } => {
                self.handle_cursor(doc_id, range).await
            }
            ClientEvent::LeaveDoc { doc_id } => self.handle_leave(doc_id).await,
        }
    }

    /// Connection teardown: leave every room and tell each one.
    pub async fn disconnect(&mut self) {
        self.joined.clear();
        let left = self.ctx.router.unsubscribe_all(self.conn_id).await;
        for doc_id in left {
            self.ctx
                .router
                .broadcast(
                    doc_id,
                    &ServerEvent::UserLeft {
                        user_id: self.user_id.clone(),
                    },
                    Some(self.conn_id),
                )
                .await;
        }
        log::info!("connection {} ({}) disconnected", self.conn_id, self.user_id);
    }

    async fn handle_join(&mut self, doc_id: Uuid, from_version: Option<u64>) {
        let doc = match self.ctx.service.store().load(doc_id) {
            Ok(doc) => doc,
            Err(StoreError::NotFound(_)) => {
                self.send(ServerEvent::Error {
                    message: format!("document not found: {doc_id}"),
                })
                .await;
                return;
            }
            Err(e) => {
                log::error!("load failed for {doc_id}: {e}");
                self.send(ServerEvent::Error {
                    message: "storage failure".into(),
                })
                .await;
                return;
            }
        };

        if !doc.allows(&self.user_id) {
            log::warn!("user {} denied access to {doc_id}", self.user_id);
            self.send(ServerEvent::Error {
                message: format!("not authorized for document {doc_id}"),
            })
            .await;
            return;
        }

        // Subscribe before reading state so no commit falls between the
        // reply and the first broadcast; the client drops anything older
        // than the snapshot it receives.
        self.ctx
            .router
            .subscribe(doc_id, self.conn_id, self.outbound.clone())
            .await;
        self.joined.insert(doc_id);

        match from_version {
            Some(version) if version < doc.version => {
                match self.ctx.service.store().ops_since(doc_id, version) {
                    Ok(entries) => {
                        let ops = entries
                            .into_iter()
                            .map(|e| VersionedDelta {
                                delta: e.delta,
                                version: e.version,
                            })
                            .collect();
                        self.send(ServerEvent::CatchupOps {
                            ops,
                            current_version: doc.version,
                        })
                        .await;
                    }
                    Err(e) => {
                        log::error!("ops_since failed for {doc_id}: {e}");
                        self.send(ServerEvent::Error {
                            message: "storage failure".into(),
                        })
                        .await;
                    }
                }
            }
            _ => {
                self.send(ServerEvent::DocSnapshot {
                    content: doc.content,
                    version: doc.version,
                })
                .await;
            }
        }

        log::info!(
            "user {} joined doc {doc_id} (from_version {from_version:?})",
            self.user_id
        );
    }

    async fn handle_send_op(&mut self, doc_id: Uuid, delta: Delta, base_version: u64) {
        if !self.joined.contains(&doc_id) {
            self.send(ServerEvent::OpError {
                message: format!("not joined to document {doc_id}"),
                base_version,
            })
            .await;
            return;
        }

        // Fresh owner token per write so a TTL-expired lock can never be
        // released out from under its next holder.
        let owner = Uuid::new_v4().to_string();
        let key = doc_lock_key(doc_id);
        let held =
            acquire_with_deadline(self.ctx.locks.as_ref(), &key, &owner, &self.ctx.lock_config)
                .await;

        let result = self.ctx.service.apply_operation(
            doc_id,
            &delta,
            base_version,
            &self.user_id,
            self.conn_id,
        );

        match result {
            Ok(applied) => {
                // Ack first: the sender must see its own version before
                // any later peer op on this connection.
                self.send(ServerEvent::OpAck {
                    version: applied.version,
                })
                .await;
                self.ctx
                    .router
                    .broadcast(
                        doc_id,
                        &ServerEvent::ReceiveOp {
                            delta: applied.delta,
                            version: applied.version,
                            user_id: self.user_id.clone(),
                        },
                        Some(self.conn_id),
                    )
                    .await;
            }
            Err(e) => {
                if let ServiceError::Store(inner) = &e {
                    log::error!("write path failed for {doc_id}: {inner}");
                }
                self.send(ServerEvent::OpError {
                    message: e.to_string(),
                    base_version,
                })
                .await;
            }
        }

        if held && !self.ctx.locks.release(&key, &owner) {
            // TTL lapsed mid-write; the version gate covered us.
            log::debug!("lock {key} expired before release");
        }
    }

    async fn handle_cursor(&mut self, doc_id: Uuid, range: Option<CursorRange>) {
        if !self.joined.contains(&doc_id) {
            log::debug!("dropping cursor update for unjoined doc {doc_id}");
            return;
        }
        self.ctx
            .router
            .broadcast(
                doc_id,
                &ServerEvent::RemoteCursor {
                    user_id: self.user_id.clone(),
                    range,
                },
                Some(self.conn_id),
            )
            .await;
    }

    async fn handle_leave(&mut self, doc_id: Uuid) {
        if !self.joined.remove(&doc_id) {
            return;
        }
        self.ctx.router.unsubscribe(doc_id, self.conn_id).await;
        self.ctx
            .router
            .broadcast(
                doc_id,
                &ServerEvent::UserLeft {
                    user_id: self.user_id.clone(),
                },
                Some(self.conn_id),
            )
            .await;
        log::info!("user {} left doc {doc_id}", self.user_id);
    }

    async fn send(&self, event: ServerEvent) {
        if self.outbound.send(event).await.is_err() {
            log::debug!("outbound channel closed for connection {}", self.conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockService;
    use crate::store::{DocumentRecord, DocumentStore, MemoryStore};

    fn test_context() -> (Arc<SessionContext>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(SessionContext {
            service: DocumentService::new(store.clone()),
            locks: Arc::new(MemoryLockService::new()),
            router: Arc::new(RoomRouter::new()),
            lock_config: LockConfig::for_testing(),
        });
        (ctx, store)
    }

    fn doc_for(store: &MemoryStore, owner: &str, collaborators: &[&str]) -> Uuid {
        let record = DocumentRecord::new(
            "doc",
            owner,
            collaborators.iter().map(|s| s.to_string()).collect(),
        );
        let id = record.id;
        store.create_document(&record).unwrap();
        id
    }

    fn session(
        ctx: &Arc<SessionContext>,
        user: &str,
    ) -> (CollabSession, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (
            CollabSession::new(ctx.clone(), Uuid::new_v4(), user, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_join_fresh_gets_snapshot() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &[]);
        let (mut sess, mut rx) = session(&ctx, "alice");

        sess.handle(ClientEvent::JoinDoc {
            doc_id,
            from_version: None,
        })
        .await;

        match rx.recv().await.unwrap() {
            ServerEvent::DocSnapshot { content, version } => {
                assert_eq!(version, 0);
                assert!(content.is_empty());
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(ctx.router.is_subscribed(doc_id, sess.conn_id()).await);
    }

    #[tokio::test]
    async fn test_join_missing_doc_errors() {
        let (ctx, _store) = test_context();
        let (mut sess, mut rx) = session(&ctx, "alice");

        sess.handle(ClientEvent::JoinDoc {
            doc_id: Uuid::new_v4(),
            from_version: None,
        })
        .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_join_unauthorized_errors() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &["bob"]);
        let (mut sess, mut rx) = session(&ctx, "mallory");

        sess.handle(ClientEvent::JoinDoc {
            doc_id,
            from_version: None,
        })
        .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::Error { .. }
        ));
        assert!(!ctx.router.is_subscribed(doc_id, sess.conn_id()).await);
    }

    #[tokio::test]
    async fn test_join_behind_gets_catchup() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &["bob"]);
        let conn = Uuid::new_v4();
        for (v, text) in [(0, "a"), (1, "b"), (2, "c")] {
            ctx.service
                .apply_operation(
                    doc_id,
                    &Delta::new().retain(v as usize).insert(text),
                    v,
                    "alice",
                    conn,
                )
                .unwrap();
        }

        let (mut sess, mut rx) = session(&ctx, "bob");
        sess.handle(ClientEvent::JoinDoc {
            doc_id,
            from_version: Some(1),
        })
        .await;

        match rx.recv().await.unwrap() {
            ServerEvent::CatchupOps {
                ops,
                current_version,
            } => {
                assert_eq!(current_version, 3);
                let versions: Vec<u64> = ops.iter().map(|o| o.version).collect();
                assert_eq!(versions, vec![2, 3]);
            }
            other => panic!("expected catchup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_current_version_gets_snapshot() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &[]);
        let (mut sess, mut rx) = session(&ctx, "alice");

        sess.handle(ClientEvent::JoinDoc {
            doc_id,
            from_version: Some(0),
        })
        .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::DocSnapshot { version: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_send_op_acks_then_broadcasts() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &["bob"]);

        let (mut alice, mut alice_rx) = session(&ctx, "alice");
        let (mut bob, mut bob_rx) = session(&ctx, "bob");
        alice
            .handle(ClientEvent::JoinDoc {
                doc_id,
                from_version: None,
            })
            .await;
        bob.handle(ClientEvent::JoinDoc {
            doc_id,
            from_version: None,
        })
        .await;
        let _ = alice_rx.recv().await; // snapshot
        let _ = bob_rx.recv().await; // snapshot

        alice
            .handle(ClientEvent::SendOp {
                doc_id,
                delta: Delta::new().insert("Hello"),
                base_version: 0,
            })
            .await;

        // Sender gets exactly the ack, never its own op.
        assert_eq!(
            alice_rx.recv().await.unwrap(),
            ServerEvent::OpAck { version: 1 }
        );
        assert!(alice_rx.try_recv().is_err());

        // The peer gets the transformed op with the author's user id.
        match bob_rx.recv().await.unwrap() {
            ServerEvent::ReceiveOp {
                delta,
                version,
                user_id,
            } => {
                assert_eq!(delta, Delta::new().insert("Hello"));
                assert_eq!(version, 1);
                assert_eq!(user_id, "alice");
            }
            other => panic!("expected receive-op, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_op_unjoined_is_op_error() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &[]);
        let (mut sess, mut rx) = session(&ctx, "alice");

        sess.handle(ClientEvent::SendOp {
            doc_id,
            delta: Delta::new().insert("x"),
            base_version: 0,
        })
        .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::OpError { base_version: 0, .. }
        ));
        // Nothing was committed.
        assert_eq!(store.load(doc_id).unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_send_op_version_ahead_is_op_error() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &[]);
        let (mut sess, mut rx) = session(&ctx, "alice");
        sess.handle(ClientEvent::JoinDoc {
            doc_id,
            from_version: None,
        })
        .await;
        let _ = rx.recv().await; // snapshot

        sess.handle(ClientEvent::SendOp {
            doc_id,
            delta: Delta::new().insert("x"),
            base_version: 9,
        })
        .await;

        match rx.recv().await.unwrap() {
            ServerEvent::OpError {
                base_version,
                message,
            } => {
                assert_eq!(base_version, 9);
                assert!(message.contains("ahead"));
            }
            other => panic!("expected op-error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_op_releases_lock() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &[]);
        let (mut sess, mut rx) = session(&ctx, "alice");
        sess.handle(ClientEvent::JoinDoc {
            doc_id,
            from_version: None,
        })
        .await;
        let _ = rx.recv().await;

        sess.handle(ClientEvent::SendOp {
            doc_id,
            delta: Delta::new().insert("x"),
            base_version: 0,
        })
        .await;
        let _ = rx.recv().await; // ack

        // A fresh acquire on the same key must succeed immediately.
        assert!(ctx
            .locks
            .try_acquire(&doc_lock_key(doc_id), "probe", std::time::Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_cursor_update_broadcasts_to_peers_only() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &["bob"]);
        let (mut alice, mut alice_rx) = session(&ctx, "alice");
        let (mut bob, mut bob_rx) = session(&ctx, "bob");
        alice
            .handle(ClientEvent::JoinDoc {
                doc_id,
                from_version: None,
            })
            .await;
        bob.handle(ClientEvent::JoinDoc {
            doc_id,
            from_version: None,
        })
        .await;
        let _ = alice_rx.recv().await;
        let _ = bob_rx.recv().await;

        alice
            .handle(ClientEvent::CursorUpdate {
                doc_id,
                range: Some(CursorRange {
                    index: 2,
                    length: 1,
                }),
            })
            .await;

        match bob_rx.recv().await.unwrap() {
            ServerEvent::RemoteCursor { user_id, range } => {
                assert_eq!(user_id, "alice");
                assert_eq!(
                    range,
                    Some(CursorRange {
                        index: 2,
                        length: 1
                    })
                );
            }
            other => panic!("expected remote-cursor, got {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_broadcasts_user_left() {
        let (ctx, store) = test_context();
        let doc_id = doc_for(&store, "alice", &["bob"]);
        let (mut alice, mut alice_rx) = session(&ctx, "alice");
        let (mut bob, mut bob_rx) = session(&ctx, "bob");
        alice
            .handle(ClientEvent::JoinDoc {
                doc_id,
                from_version: None,
            })
            .await;
        bob.handle(ClientEvent::JoinDoc {
            doc_id,
            from_version: None,
        })
        .await;
        let _ = alice_rx.recv().await;
        let _ = bob_rx.recv().await;

        bob.handle(ClientEvent::LeaveDoc { doc_id }).await;

        assert_eq!(
            alice_rx.recv().await.unwrap(),
            ServerEvent::UserLeft {
                user_id: "bob".into()
            }
        );
        assert!(!ctx.router.is_subscribed(doc_id, bob.conn_id()).await);

        // Leaving twice is silent.
        bob.handle(ClientEvent::LeaveDoc { doc_id }).await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_every_room() {
        let (ctx, store) = test_context();
        let doc_a = doc_for(&store, "alice", &["bob"]);
        let doc_b = doc_for(&store, "alice", &["bob"]);
        let (mut alice, mut alice_rx) = session(&ctx, "alice");
        let (mut bob, mut bob_rx) = session(&ctx, "bob");
        for doc_id in [doc_a, doc_b] {
            alice
                .handle(ClientEvent::JoinDoc {
                    doc_id,
                    from_version: None,
                })
                .await;
            bob.handle(ClientEvent::JoinDoc {
                doc_id,
                from_version: None,
            })
            .await;
            let _ = alice_rx.recv().await;
            let _ = bob_rx.recv().await;
        }

        bob.disconnect().await;

        let mut seen = 0;
        while let Ok(event) = alice_rx.try_recv() {
            assert_eq!(
                event,
                ServerEvent::UserLeft {
                    user_id: "bob".into()
                }
            );
            seen += 1;
        }
        assert_eq!(seen, 2);
        assert_eq!(ctx.router.subscriber_count(doc_a).await, 1);
        assert_eq!(ctx.router.subscriber_count(doc_b).await, 1);
    }
}
