//! WebSocket collaboration server.
//!
//! ```text
//! Client A ──┐                    ┌──► RoomRouter ──► other clients
//!             ├── CollabSession ──┤
//! Client B ──┘   (per conn)       └──► DocumentService ──► DocumentStore
//!                                            │
//!                                       LockService
//! ```
//!
//! Authentication happens at the WebSocket handshake: the bearer token in
//! the `Authorization` header is resolved through the injected
//! [`AuthService`]; a bad token rejects the upgrade with 401 before any
//! session state exists.
//!
//! Each accepted connection runs two tasks: a reader that decodes client
//! events and drives the session, and a writer that drains the session's
//! outbound channel onto the socket. All fan-out (acks, broadcasts)
//! funnels through that one channel, which is what gives each client a
//! single totally-ordered event stream.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::AuthService;
use crate::lock::{LockConfig, LockService};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::room::RoomRouter;
use crate::service::DocumentService;
use crate::session::{CollabSession, SessionContext};
use crate::store::DocumentStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound channel capacity per connection
    pub outbound_capacity: usize,
    /// Per-document lock tuning
    pub lock: LockConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9292".to_string(),
            outbound_capacity: 256,
            lock: LockConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    ctx: Arc<SessionContext>,
    auth: Arc<dyn AuthService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        locks: Arc<dyn LockService>,
        auth: Arc<dyn AuthService>,
    ) -> Self {
        let ctx = Arc::new(SessionContext {
            service: DocumentService::new(store),
            locks,
            router: Arc::new(RoomRouter::new()),
            lock_config: config.lock.clone(),
        });
        Self {
            config,
            ctx,
            auth,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn router(&self) -> &Arc<RoomRouter> {
        &self.ctx.router
    }

    /// Server statistics; `active_rooms` is read live from the router.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.ctx.router.room_count().await;
        stats
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collaboration server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let ctx = self.ctx.clone();
            let auth = self.auth.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx, auth, stats, config).await
                {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<SessionContext>,
        auth: Arc<dyn AuthService>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Handshake-time authentication: resolve the bearer token before
        // accepting the upgrade.
        let mut user_id: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| {
                match bearer_token(request).and_then(|token| auth.authenticate(token)) {
                    Some(resolved) => {
                        user_id = Some(resolved);
                        Ok(response)
                    }
                    None => {
                        log::warn!("rejecting unauthenticated handshake from {addr}");
                        let mut denied = ErrorResponse::new(None);
                        *denied.status_mut() = StatusCode::UNAUTHORIZED;
                        Err(denied)
                    }
                }
            },
        )
        .await?;
        let Some(user_id) = user_id else {
            return Ok(()); // Handshake was rejected.
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn_id = Uuid::new_v4();
        log::info!("connection {conn_id} established for {user_id} from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Writer task: the session's single ordered event stream.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(config.outbound_capacity);
        let writer = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                match event.encode() {
                    Ok(text) => {
                        if ws_sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("failed to encode outbound event: {e}"),
                }
            }
        });

        let mut session = CollabSession::new(ctx, conn_id, user_id, outbound_tx.clone());

        // Reader loop: decode frames and drive the session.
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                    }
                    match ClientEvent::decode(&text) {
                        Ok(event) => session.handle(event).await,
                        Err(e) => {
                            log::warn!("malformed frame from {conn_id}: {e}");
                            let _ = outbound_tx
                                .send(ServerEvent::Error {
                                    message: format!("malformed frame: {e}"),
                                })
                                .await;
                        }
                    }
                }
                Ok(Message::Binary(_)) => {
                    let _ = outbound_tx
                        .send(ServerEvent::Error {
                            message: "binary frames are not part of this protocol".into(),
                        })
                        .await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {} // Ping/pong handled by the protocol layer.
                Err(e) => {
                    log::debug!("transport error on {conn_id}: {e}");
                    break;
                }
            }
        }

        session.disconnect().await;
        drop(outbound_tx);
        let _ = writer.await;

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        Ok(())
    }
}

/// Pull `Bearer <token>` out of the handshake request.
fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
