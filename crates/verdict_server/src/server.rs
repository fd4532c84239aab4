//! Server assembly and the RPC socket loop.
//!
//! The server binds a ROUTER socket and spawns one handler task per
//! incoming request, so slow calls (the long-poll task await) never
//! block the socket. Replies funnel back through a channel owned by the
//! socket loop.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use verdict_protocol::{ApiError, RpcRequest, RpcResponse};
use verdict_store::ConfigStore;

use crate::auth::AuthEngine;
use crate::config::ServerConfig;
use crate::dispatcher;
use crate::reaper::Reaper;
use crate::registry::ProductRegistry;
use crate::task_manager::TaskManager;
use crate::workers::WorkerPool;

/// Shared server-wide capabilities handed to every request handler.
pub struct ServerState {
    pub config: ServerConfig,
    pub store: ConfigStore,
    pub auth: AuthEngine,
    pub registry: ProductRegistry,
    pub tm: TaskManager,
    pub started_at: Instant,
}

pub struct Server {
    state: Arc<ServerState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Open stores, provision auth, and mount every product.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let store = ConfigStore::open(&config.config_store_path).await?;
        store.init().await?;

        let auth = AuthEngine::new(store.clone(), config.auth_disabled);
        auth.bootstrap_root(&verdict_protocol::paths::verdict_home())
            .await?;

        let registry = ProductRegistry::new(store.clone());
        registry.mount_all().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tm = TaskManager::new(
            store.clone(),
            config.server_id.clone(),
            config.scratch_root.clone(),
            config.queue_capacity,
            shutdown_rx.clone(),
        );

        let state = Arc::new(ServerState {
            store,
            auth,
            registry,
            tm,
            started_at: Instant::now(),
            config,
        });

        Ok(Self {
            state,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Handle callers can use to stop the server (signal handlers).
    pub fn shutdown_trigger(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown_tx.clone()
    }

    /// Run until the shutdown flag flips, then drain workers and close
    /// every pool.
    pub async fn run(self) -> Result<()> {
        let state = self.state.clone();

        let reaper = Reaper::new(state.store.clone(), &state.config);
        let reaper_handle = tokio::spawn(reaper.run(self.shutdown_rx.clone()));

        let pool_handle = if state.config.spawn_workers {
            let pool = WorkerPool::spawn(&state.config).await?;
            Some(tokio::spawn(pool.supervise(self.shutdown_rx.clone())))
        } else {
            None
        };

        let result = serve_rpc(
            state.clone(),
            state.config.bind_addr.clone(),
            self.shutdown_rx.clone(),
        )
        .await;

        // Make sure every background loop sees the flag, whatever
        // stopped the RPC loop.
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = pool_handle {
            let _ = handle.await;
        }
        let _ = reaper_handle.await;

        state.registry.close_all().await;
        state.store.close().await;
        info!("Server stopped");
        result
    }
}

/// ROUTER loop: one spawned task per request, replies multiplexed back
/// through a channel.
///
/// Receive runs under a short timeout so pending replies are flushed
/// between polls without the send and receive halves contending for the
/// socket.
async fn serve_rpc(
    state: Arc<ServerState>,
    bind_addr: String,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut socket = zeromq::RouterSocket::new();
    socket
        .bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind RPC socket to {bind_addr}"))?;
    info!("RPC surface bound to {}", bind_addr);

    let (reply_tx, mut reply_rx) = mpsc::channel::<ZmqMessage>(64);
    let recv_window = std::time::Duration::from_millis(50);

    loop {
        if *shutdown.borrow() {
            info!("RPC loop stopped");
            return Ok(());
        }

        // Flush replies produced by handler tasks since the last poll.
        while let Ok(reply) = reply_rx.try_recv() {
            if let Err(err) = socket.send(reply).await {
                warn!("Failed to send RPC reply: {}", err);
            }
        }

        match tokio::time::timeout(recv_window, socket.recv()).await {
            Ok(Ok(message)) => {
                let state = state.clone();
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    if let Some(reply) = handle_message(state, message).await {
                        let _ = reply_tx.send(reply).await;
                    }
                });
            }
            Ok(Err(err)) => {
                error!("RPC recv error: {}", err);
            }
            Err(_) => {} // timeout, no message
        }
    }
}

/// Decode one multipart request and produce the multipart reply.
///
/// REQ clients send `[identity, empty, payload]`, DEALER clients
/// `[identity, payload]`; the reply mirrors the envelope it came with.
async fn handle_message(state: Arc<ServerState>, message: ZmqMessage) -> Option<ZmqMessage> {
    let frames: Vec<Vec<u8>> = message.into_vec().into_iter().map(|b| b.to_vec()).collect();

    let (identity, delimited, payload) = match frames.as_slice() {
        [identity, payload] => (identity.clone(), false, payload.clone()),
        [identity, delim, payload] if delim.is_empty() => (identity.clone(), true, payload.clone()),
        _ => {
            warn!("Dropping RPC message with {} frames", frames.len());
            return None;
        }
    };

    let response = match serde_json::from_slice::<RpcRequest>(&payload) {
        Ok(request) => dispatcher::dispatch(&state, request).await,
        Err(err) => RpcResponse::error(ApiError::input_malformed(format!(
            "invalid request: {err}"
        ))),
    };

    let body = match serde_json::to_vec(&response) {
        Ok(body) => body,
        Err(err) => {
            error!("Failed to serialize RPC response: {}", err);
            return None;
        }
    };

    let mut reply = ZmqMessage::from(identity);
    if delimited {
        reply.push_back(Vec::<u8>::new().into());
    }
    reply.push_back(body.into());
    Some(reply)
}
