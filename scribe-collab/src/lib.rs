//! # scribe-collab — real-time collaborative document service
//!
//! Server and client halves of an OT-based collaboration pipeline over
//! WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌───────────────┐
//! │ CollabClient │ ◄──────────────────► │ CollabSession │ (one per conn)
//! │ (ClientCore) │   JSON event frames  └───────┬───────┘
//! └──────────────┘                              │
//!                             ┌─────────────────┼──────────────────┐
//!                             ▼                 ▼                  ▼
//!                       ┌───────────┐   ┌───────────────┐   ┌────────────┐
//!                       │ RoomRouter│   │DocumentService│   │ LockService│
//!                       │ (fan-out) │   │ (write path)  │   │ (per-doc)  │
//!                       └───────────┘   └───────┬───────┘   └────────────┘
//!                                               ▼
//!                                       ┌───────────────┐
//!                                       │ DocumentStore │ snapshot + log
//!                                       │ (memory/rocks)│
//!                                       └───────────────┘
//! ```
//!
//! Writes serialize per document through a TTL'd distributed lock, with
//! the store's version gate as the correctness backstop; committed ops
//! fan out to room subscribers already transformed. The client keeps at
//! most one op in flight and folds further edits into a pending buffer.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire events (`join-doc`, `send-op`, `op-ack`, …)
//! - [`store`] — snapshot + append-only op log, version-gated commit
//! - [`lock`] — per-document distributed mutex with owner fencing
//! - [`service`] — the transform/compose/commit write path
//! - [`room`] — document rooms and subscriber fan-out
//! - [`session`] — per-connection protocol state machine
//! - [`server`] — WebSocket accept loop and handshake auth
//! - [`client`] — optimistic client core and WebSocket client
//! - [`auth`] — bearer-token seam to the external auth service

pub mod auth;
pub mod client;
pub mod lock;
pub mod protocol;
pub mod room;
pub mod server;
pub mod service;
pub mod session;
pub mod store;

pub use auth::{AuthService, StaticTokenAuth};
pub use client::{ClientCore, ClientSyncEvent, CollabClient, ConnectionState, RemoteOutcome};
pub use lock::{doc_lock_key, LockConfig, LockService, MemoryLockService};
pub use protocol::{ClientEvent, CursorRange, ProtocolError, ServerEvent, VersionedDelta};
pub use room::{ConnectionId, RoomRouter, RouterStats};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use service::{AppliedOp, DocumentService, ServiceError, MAX_COMMIT_RETRIES};
pub use session::{CollabSession, SessionContext};
pub use store::{
    AppendOutcome, CommitOutcome, DocumentRecord, DocumentStore, MemoryStore, OpLogEntry,
    RocksStore, StoreConfig, StoreError,
};
