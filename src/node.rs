//! Node startup
//!
//! Binds the HTTP port (walking forward when it is taken), builds the
//! shared state and starts every background task: discovery, staleness
//! sweep, periodic sync and the peer watcher.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::{Config, WAREHOUSES_CAPABILITY};
use crate::discovery::{bind_listener, listen, start_announce_task, RegistryEvent, SubnetProber};
use crate::error::SyncError;
use crate::routes::build_router;
use crate::state::AppState;

/// A bound, running node that is not serving HTTP yet
pub struct Node {
    state: AppState,
    listener: TcpListener,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the server socket and start background work
    pub async fn start(config: Config, db: SqlitePool) -> Result<Self, SyncError> {
        let listener = bind_with_fallback(
            &config.server.host,
            config.server.port,
            config.server.port_fallback_attempts,
        )
        .await?;
        let local_addr = listener.local_addr().map_err(|e| SyncError::BindFailure {
            what: "server socket".to_string(),
            reason: e.to_string(),
        })?;

        if local_addr.port() != config.server.port && config.server.port != 0 {
            tracing::warn!(
                configured = config.server.port,
                bound = local_addr.port(),
                "Configured port was taken, using fallback"
            );
        }

        let state = AppState::new(config, db, local_addr.port()).await?;
        let tasks = start_background_tasks(&state).await?;

        tracing::info!(
            device_id = %state.device_id(),
            address = %local_addr,
            "Node started"
        );

        Ok(Self {
            state,
            listener,
            local_addr,
            tasks,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve HTTP until `shutdown` resolves, then stop background tasks
    pub async fn serve<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = build_router(self.state.clone());

        let result = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        for task in &self.tasks {
            task.abort();
        }

        // Hand anything still queued to peers before exiting
        self.state.batcher().flush_now().await;

        result
    }
}

/// Bind `host:port`, then `port+1 ..= port+attempts` if it is taken
pub async fn bind_with_fallback(host: &str, port: u16, attempts: u16) -> Result<TcpListener, SyncError> {
    // Port 0 asks the OS for any free port; there is nothing to walk
    let last = if port == 0 { 0 } else { port.saturating_add(attempts) };
    let mut last_error = None;

    for candidate in port..=last {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!(port = candidate, error = %e, "Port unavailable");
                last_error = Some(e);
            }
        }
    }

    Err(SyncError::BindFailure {
        what: format!("{}:{}-{}", host, port, last),
        reason: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no port tried".to_string()),
    })
}

async fn start_background_tasks(state: &AppState) -> Result<Vec<JoinHandle<()>>, SyncError> {
    let config = state.config().clone();
    let port = state.port();
    let mut tasks = Vec::new();

    tasks.push(state.registry().clone().start_sweep_task(
        config.discovery.stale_after,
        config.discovery.sweep_interval,
        Arc::clone(state.stats()),
    ));

    if config.discovery.multicast_enabled {
        match bind_listener(&config.discovery).await {
            Ok(socket) => {
                tasks.push(tokio::spawn(listen(
                    socket,
                    config.device.id.clone(),
                    state.registry().clone(),
                    Arc::clone(state.stats()),
                )));
            }
            // Probing and favorites still work without multicast
            Err(e) => tracing::warn!(error = %e, "Multicast discovery unavailable"),
        }
        tasks.push(start_announce_task(config.clone(), port));
    }

    let prober = SubnetProber::new(
        &config.discovery,
        config.device.id.clone(),
        state.registry().clone(),
        Arc::clone(state.stats()),
    )?;
    if prober.is_enabled() {
        tasks.push(prober.start_probe_task(port, config.discovery.probe_interval));
    }

    tasks.push(
        Arc::clone(state.client()).start_periodic_task(config.sync.periodic_interval),
    );
    tasks.push(start_peer_watcher(state.clone()));

    Ok(tasks)
}

/// React to peers joining: release held batches and sync right away
fn start_peer_watcher(state: AppState) -> JoinHandle<()> {
    let mut events = state.registry().subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RegistryEvent::PeerJoined(peer)) => {
                    if !peer.has_capability(WAREHOUSES_CAPABILITY) {
                        continue;
                    }
                    state.batcher().notify_reconnect();

                    let client = Arc::clone(state.client());
                    tokio::spawn(async move {
                        let _ = client.sync_with_peer(&peer).await;
                    });
                }
                Ok(RegistryEvent::PeerLeft(peer_id)) => {
                    tracing::debug!(peer_id = %peer_id, "Peer left");
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Peer watcher fell behind registry events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
