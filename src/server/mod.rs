pub mod handler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::LamportClock;
use crate::config::{Config, ServerConfig};
use crate::durability::{Durability, RestoreSource};
use crate::export::HealthMetrics;
use crate::store::RecordStore;
use crate::sweeper::ExpirySweeper;

/// State shared by every connection task.
pub struct Shared {
    pub clock: LamportClock,
    pub store: Arc<RecordStore>,
    pub durability: Arc<Durability>,
    pub health: Arc<HealthMetrics>,
    pub limits: ServerConfig,
}

impl Shared {
    pub fn new(
        store: Arc<RecordStore>,
        durability: Arc<Durability>,
        health: Arc<HealthMetrics>,
        limits: ServerConfig,
    ) -> Self {
        Self {
            clock: LamportClock::new(),
            store,
            durability,
            health,
            limits,
        }
    }
}

/// Server orchestrates the listener, the sweeper, persistence and metrics.
pub struct Server {
    cfg: Config,
    shared: Arc<Shared>,
    sweeper: ExpirySweeper,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Server {
    /// Create a server and recover the store from the last snapshot.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let durability = Arc::new(Durability::new(
            cfg.storage.path.clone(),
            cfg.storage.fsync,
        ));

        let restored = durability.restore();
        let store = Arc::new(RecordStore::from_snapshot(restored.snapshot, Instant::now()));
        if restored.source != RestoreSource::Empty {
            info!(records = store.len(), source = ?restored.source, "store recovered");
        }
        health.live_records.set(store.len() as f64);

        let sweeper = ExpirySweeper::new(
            Arc::clone(&store),
            Arc::clone(&durability),
            Arc::clone(&health),
            cfg.expiry.ttl,
            cfg.expiry.sweep_interval,
        );

        let shared = Arc::new(Shared::new(store, durability, health, cfg.server.clone()));

        Ok(Self {
            cfg,
            shared,
            sweeper,
            local_addr: None,
            accept_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        // 0. Health metrics first so probes respond while we come up.
        if self.cfg.health.enabled {
            self.shared
                .health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Listener.
        let bind_addr = self.cfg.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;
        self.local_addr = Some(local_addr);

        // 2. Expiry sweeper.
        self.sweeper.start();

        // 3. Accept loop.
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        self.accept_task = Some(tokio::spawn(async move {
            accept_loop(listener, shared, cancel).await;
        }));

        info!(addr = %local_addr, "aggregation server listening");

        Ok(local_addr)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Stop accepting, stop the sweeper and write a final snapshot.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.sweeper.stop();

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "accept loop panicked");
            }
        }

        let shared = &self.shared;
        match shared.durability.flush_store_blocking(&shared.store).await {
            Ok(records) => {
                shared.health.record_flush("shutdown", true);
                info!(records, "final snapshot flushed");
            }
            Err(e) => {
                shared.health.record_flush("shutdown", false);
                error!(error = %e, "final snapshot flush failed");
            }
        }

        self.shared.health.stop().await?;

        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("accept loop stopped");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            handler::handle_connection(stream, peer, shared).await;
                        });
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning.
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}
