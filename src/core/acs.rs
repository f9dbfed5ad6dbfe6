//! Main ACS orchestrator wiring the store, engine and background services

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{self, ApiState};
use crate::config::AcsConfig;
use crate::protocols::cwmp::CwmpCodec;
use crate::services::liveness::LivenessSweeper;
use crate::services::session::SessionEngine;
use crate::store::DeviceStore;
use crate::{Error, Result};

/// The assembled ACS: HTTP surface plus the liveness sweeper
pub struct AcsServer {
    config: AcsConfig,
    store: Arc<DeviceStore>,
    shutdown: CancellationToken,
}

impl AcsServer {
    pub async fn new(config: AcsConfig) -> Result<Self> {
        let store = Arc::new(DeviceStore::connect(&config.database.url).await?);
        info!("Device store ready at {}", config.database.url);

        Ok(Self {
            config,
            store,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the server and its background tasks when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn store(&self) -> Arc<DeviceStore> {
        Arc::clone(&self.store)
    }

    /// Serve until the shutdown token fires
    pub async fn run(&self) -> Result<()> {
        let engine = Arc::new(SessionEngine::new(CwmpCodec::new(), Arc::clone(&self.store)));
        let state = ApiState {
            store: Arc::clone(&self.store),
            engine,
            session_timeout: Duration::from_secs(self.config.cwmp.session_timeout),
        };
        let app = api::router(state);

        let sweeper = LivenessSweeper::new(
            Arc::clone(&self.store),
            self.config.device.offline_threshold,
            self.config.device.sweep_interval,
        );
        let sweeper_task = tokio::spawn(sweeper.run(self.shutdown.clone()));

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| Error::parse(format!("Invalid listen address: {}", e)))?;
        let listener = TcpListener::bind(addr).await?;
        info!("CWMP endpoint listening on http://{}/cwmp", addr);
        info!("Management API listening on http://{}/api", addr);

        let shutdown = self.shutdown.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        sweeper_task.await.ok();
        info!("ACS shutdown complete");
        Ok(())
    }
}
