//! Client-side collaboration: optimistic buffering and the WebSocket
//! wrapper around it.
//!
//! [`ClientCore`] is the whole protocol brain in three cells:
//!
//! ```text
//! known_version  last server-confirmed version
//! in_flight      the one op sent but not yet acknowledged
//! pending        composition of edits made while in_flight is out
//! ```
//!
//! An edit is NEVER sent while another is in flight; the ack promotes the
//! pending buffer into the next in-flight op. Inbound remote ops are
//! transformed against `in_flight ∘ pending` — the remote op is already
//! committed, so it wins positional ties and the locals are re-based to
//! land after it.
//!
//! [`CollabClient`] drives a real connection: writer + reader tasks, an
//! event channel for the application, automatic resync (`join-doc` from
//! `known_version`) after `op-error` or a detected version gap.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::{
    ClientEvent, CursorRange, ProtocolError, ServerEvent, VersionedDelta,
};
use scribe_ot::{Delta, OtError};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What to do with one inbound remote op.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Apply this (already re-based) delta to the editor view.
    Applied(Delta),
    /// Redelivery or pre-sync noise; drop it.
    Ignored,
    /// A version gap: re-join from `known_version` to catch up.
    Resync,
}

/// The three-cell optimistic state machine. Pure and synchronous; the
/// event loop that owns it needs no locking discipline beyond its own.
///
/// `confirmed` holds only server-confirmed content; the editor view is
/// always `confirmed ∘ in_flight ∘ pending`. Dropping the optimistic
/// buffers therefore reverts the view to authoritative state for free,
/// which is exactly what every resync path needs.
pub struct ClientCore {
    doc_id: Uuid,
    /// Content as of `known_version` (inserts only).
    confirmed: Delta,
    known_version: u64,
    in_flight: Option<Delta>,
    pending: Option<Delta>,
    /// Set once the first snapshot or catch-up arrived.
    synced: bool,
}

impl ClientCore {
    pub fn new(doc_id: Uuid) -> Self {
        Self {
            doc_id,
            confirmed: Delta::new(),
            known_version: 0,
            in_flight: None,
            pending: None,
            synced: false,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Server-confirmed content as of `known_version`.
    pub fn confirmed(&self) -> &Delta {
        &self.confirmed
    }

    /// The editor view: confirmed content with the optimistic buffers
    /// applied on top.
    pub fn document(&self) -> Delta {
        let mut view = self.confirmed.clone();
        for local in [&self.in_flight, &self.pending].into_iter().flatten() {
            view = view.compose(local);
        }
        view
    }

    pub fn known_version(&self) -> u64 {
        self.known_version
    }

    pub fn in_flight(&self) -> Option<&Delta> {
        self.in_flight.as_ref()
    }

    pub fn pending(&self) -> Option<&Delta> {
        self.pending.as_ref()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// A user-originated edit (based on the current view). Returns the
    /// `send-op` to put on the wire if the channel is idle; otherwise the
    /// edit folds into the pending buffer.
    pub fn local_edit(&mut self, delta: Delta) -> Result<Option<ClientEvent>, OtError> {
        // Validate against the view the user was editing.
        self.document().apply(&delta)?;
        if self.in_flight.is_none() {
            self.in_flight = Some(delta.clone());
            Ok(Some(ClientEvent::SendOp {
                doc_id: self.doc_id,
                delta,
                base_version: self.known_version,
            }))
        } else {
            self.pending = Some(match self.pending.take() {
                Some(pending) => pending.compose(&delta),
                None => delta,
            });
            Ok(None)
        }
    }

    /// The server committed our in-flight op. Idempotent: a replayed ack
    /// for an already-confirmed version does nothing. Returns the next
    /// `send-op` when a pending buffer was waiting, or a `join-doc` when
    /// the ack exposes missed history.
    pub fn handle_ack(&mut self, version: u64) -> Option<ClientEvent> {
        if version <= self.known_version {
            return None;
        }
        if version > self.known_version + 1 || self.in_flight.is_none() {
            // Our op landed on top of ops we never received (possible
            // when the write lock was lost and broadcasts raced the ack).
            // The in-flight delta no longer matches what the server
            // composed, so drop the buffers and replay from known state;
            // our own committed op comes back in the replay.
            log::warn!(
                "ack for v{version} but confirmed state is v{}; resyncing",
                self.known_version
            );
            self.discard_local_edits();
            return Some(ClientEvent::JoinDoc {
                doc_id: self.doc_id,
                from_version: Some(self.known_version),
            });
        }

        self.known_version = version;
        if let Some(op) = self.in_flight.take() {
            // Every remote op below `version` has already re-based the
            // in-flight delta, so it equals the server-side transform.
            self.confirmed = self.confirmed.compose(&op);
        }
        let promoted = self.pending.take()?;
        self.in_flight = Some(promoted.clone());
        Some(ClientEvent::SendOp {
            doc_id: self.doc_id,
            delta: promoted,
            base_version: self.known_version,
        })
    }

    /// A peer's committed op arrived.
    pub fn handle_remote(&mut self, delta: &Delta, version: u64) -> Result<RemoteOutcome, OtError> {
        if !self.synced {
            // Raced ahead of our snapshot; the snapshot will contain it.
            return Ok(RemoteOutcome::Ignored);
        }
        if version <= self.known_version {
            // At-least-once redelivery.
            return Ok(RemoteOutcome::Ignored);
        }
        if version > self.known_version + 1 {
            log::warn!(
                "version gap: have {}, received {version}; requesting catch-up",
                self.known_version
            );
            self.discard_local_edits();
            return Ok(RemoteOutcome::Resync);
        }

        self.confirmed = self.confirmed.apply(delta)?;
        let for_view = self.rebase_remote(delta)?;
        self.known_version = version;
        Ok(RemoteOutcome::Applied(for_view))
    }

    /// Transform a committed remote op past the optimistic locals and
    /// re-base the locals after it. The remote op wins every positional
    /// tie: it is already in the server's history.
    fn rebase_remote(&mut self, remote: &Delta) -> Result<Delta, OtError> {
        let past_in_flight = match self.in_flight.take() {
            Some(in_flight) => {
                let remote_after = in_flight.transform(remote, false);
                self.in_flight = Some(remote.transform(&in_flight, true));
                remote_after
            }
            None => remote.clone(),
        };
        let past_pending = match self.pending.take() {
            Some(pending) => {
                let remote_after = pending.transform(&past_in_flight, false);
                self.pending = Some(past_in_flight.transform(&pending, true));
                remote_after
            }
            None => past_in_flight,
        };
        Ok(past_pending)
    }

    /// Authoritative state replaces everything, including unacknowledged
    /// local edits.
    pub fn handle_snapshot(&mut self, content: Delta, version: u64) {
        self.confirmed = content;
        self.known_version = version;
        self.in_flight = None;
        self.pending = None;
        self.synced = true;
    }

    /// Replay of missed committed ops, ascending. Each entry is treated
    /// like a remote op, so optimistic locals stay valid across the
    /// replay. Returns the deltas applied to the view.
    pub fn handle_catchup(
        &mut self,
        ops: &[VersionedDelta],
        current_version: u64,
    ) -> Result<Vec<Delta>, OtError> {
        self.synced = true;
        let mut applied = Vec::new();
        for op in ops {
            if op.version <= self.known_version {
                continue;
            }
            self.confirmed = self.confirmed.apply(&op.delta)?;
            let for_view = self.rebase_remote(&op.delta)?;
            self.known_version = op.version;
            applied.push(for_view);
        }
        if current_version > self.known_version {
            // The server said we are current as of this version.
            self.known_version = current_version;
        }
        Ok(applied)
    }

    /// Drop unacknowledged local edits. The reset rule for every resync
    /// that crosses a connection boundary: a dead connection's in-flight
    /// op may or may not have committed, and the catch-up replay will
    /// deliver it as a remote op if it did.
    pub fn discard_local_edits(&mut self) {
        self.in_flight = None;
        self.pending = None;
    }

    /// The server rejected our op: drop the optimistic buffers and ask
    /// for reconciliation from the last confirmed version.
    pub fn handle_op_error(&mut self) -> ClientEvent {
        self.discard_local_edits();
        ClientEvent::JoinDoc {
            doc_id: self.doc_id,
            from_version: Some(self.known_version),
        }
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientSyncEvent {
    Connected,
    Disconnected,
    /// A snapshot or catch-up brought the view to this version.
    Synced { version: u64 },
    /// A peer's op, re-based for the local view.
    RemoteEdit {
        delta: Delta,
        version: u64,
        user_id: String,
    },
    /// Our own op committed.
    Acked { version: u64 },
    RemoteCursor {
        user_id: String,
        range: Option<CursorRange>,
    },
    UserLeft { user_id: String },
    /// An `op-error` or `error`; resync is already underway when it was
    /// an op rejection.
    ServerError { message: String },
}

/// WebSocket client for one document.
pub struct CollabClient {
    doc_id: Uuid,
    server_url: String,
    bearer_token: String,
    state: Arc<RwLock<ConnectionState>>,
    core: Arc<Mutex<ClientCore>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<ClientSyncEvent>,
    event_rx: Option<mpsc::Receiver<ClientSyncEvent>>,
}

impl CollabClient {
    pub fn new(
        doc_id: Uuid,
        server_url: impl Into<String>,
        bearer_token: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            doc_id,
            server_url: server_url.into(),
            bearer_token: bearer_token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            core: Arc::new(Mutex::new(ClientCore::new(doc_id))),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientSyncEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn known_version(&self) -> u64 {
        self.core.lock().await.known_version()
    }

    /// Current local view as plain text.
    pub async fn text(&self) -> String {
        self.core.lock().await.document().text()
    }

    pub async fn document(&self) -> Delta {
        self.core.lock().await.document()
    }

    /// Connect, authenticate, and join the document. Spawns the writer
    /// and reader tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
        use tokio_tungstenite::tungstenite::http::HeaderValue;
        use tokio_tungstenite::tungstenite::Message;

        let reconnecting = {
            let mut core = self.core.lock().await;
            if core.is_synced() {
                // The old connection died with these unconfirmed; if any
                // committed, the catch-up brings them back as remote ops.
                core.discard_local_edits();
                true
            } else {
                false
            }
        };
        *self.state.write().await = if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };

        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        let header = HeaderValue::from_str(&format!("Bearer {}", self.bearer_token))
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await.map_err(|e| {
            log::warn!("connect to {} failed: {e}", self.server_url);
            ProtocolError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: drain the outgoing channel onto the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        // Join (or re-join from the last confirmed version).
        let join = {
            let core = self.core.lock().await;
            ClientEvent::JoinDoc {
                doc_id: self.doc_id,
                from_version: if core.is_synced() {
                    Some(core.known_version())
                } else {
                    None
                },
            }
        };
        send_event(&out_tx, &join).await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientSyncEvent::Connected).await;

        // Reader task: decode server events and drive the core.
        let core = self.core.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerEvent::decode(&text) {
                        Ok(event) => {
                            handle_server_event(&core, &out_tx, &event_tx, event).await;
                        }
                        Err(e) => log::warn!("undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientSyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Submit a local edit; buffered per the in-flight/pending rules.
    pub async fn edit(&self, delta: Delta) -> Result<(), ProtocolError> {
        let outgoing = {
            let mut core = self.core.lock().await;
            core.local_edit(delta)
                .map_err(|e| ProtocolError::SerializationError(e.to_string()))?
        };
        if let Some(event) = outgoing {
            let tx = self
                .outgoing_tx
                .as_ref()
                .ok_or(ProtocolError::ConnectionClosed)?;
            send_event(tx, &event).await?;
        }
        Ok(())
    }

    /// Share the local cursor position.
    pub async fn cursor(&self, range: Option<CursorRange>) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        send_event(
            tx,
            &ClientEvent::CursorUpdate {
                doc_id: self.doc_id,
                range,
            },
        )
        .await
    }

    /// Close the document view.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        send_event(tx, &ClientEvent::LeaveDoc { doc_id: self.doc_id }).await
    }
}

async fn send_event(
    tx: &mpsc::Sender<String>,
    event: &ClientEvent,
) -> Result<(), ProtocolError> {
    let text = event.encode()?;
    tx.send(text)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

/// Apply one server event to the core and surface the app-level result.
async fn handle_server_event(
    core: &Arc<Mutex<ClientCore>>,
    out_tx: &mpsc::Sender<String>,
    event_tx: &mpsc::Sender<ClientSyncEvent>,
    event: ServerEvent,
) {
    match event {
        ServerEvent::DocSnapshot { content, version } => {
            core.lock().await.handle_snapshot(content, version);
            let _ = event_tx.send(ClientSyncEvent::Synced { version }).await;
        }
        ServerEvent::CatchupOps {
            ops,
            current_version,
        } => {
            let outcome = core.lock().await.handle_catchup(&ops, current_version);
            match outcome {
                Ok(_) => {
                    let _ = event_tx
                        .send(ClientSyncEvent::Synced {
                            version: current_version,
                        })
                        .await;
                }
                Err(e) => log::error!("catch-up replay failed: {e}"),
            }
        }
        ServerEvent::ReceiveOp {
            delta,
            version,
            user_id,
        } => {
            let outcome = core.lock().await.handle_remote(&delta, version);
            match outcome {
                Ok(RemoteOutcome::Applied(for_view)) => {
                    let _ = event_tx
                        .send(ClientSyncEvent::RemoteEdit {
                            delta: for_view,
                            version,
                            user_id,
                        })
                        .await;
                }
                Ok(RemoteOutcome::Ignored) => {}
                Ok(RemoteOutcome::Resync) => {
                    let rejoin = {
                        let core = core.lock().await;
                        ClientEvent::JoinDoc {
                            doc_id: core.doc_id(),
                            from_version: Some(core.known_version()),
                        }
                    };
                    let _ = send_event(out_tx, &rejoin).await;
                }
                Err(e) => log::error!("remote op failed to apply: {e}"),
            }
        }
        ServerEvent::OpAck { version } => {
            let next = core.lock().await.handle_ack(version);
            if let Some(event) = next {
                let _ = send_event(out_tx, &event).await;
            }
            let _ = event_tx.send(ClientSyncEvent::Acked { version }).await;
        }
        ServerEvent::OpError {
            message,
            base_version,
        } => {
            log::warn!("op rejected at base {base_version}: {message}");
            let rejoin = core.lock().await.handle_op_error();
            let _ = send_event(out_tx, &rejoin).await;
            let _ = event_tx
                .send(ClientSyncEvent::ServerError { message })
                .await;
        }
        ServerEvent::RemoteCursor { user_id, range } => {
            let _ = event_tx
                .send(ClientSyncEvent::RemoteCursor { user_id, range })
                .await;
        }
        ServerEvent::UserLeft { user_id } => {
            let _ = event_tx.send(ClientSyncEvent::UserLeft { user_id }).await;
        }
        ServerEvent::Error { message } => {
            let _ = event_tx
                .send(ClientSyncEvent::ServerError { message })
                .await;
        }
    }
}
