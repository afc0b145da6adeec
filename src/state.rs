//! Application state module
//!
//! Contains the shared state used across all server connections and the world tick.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::ServerConfig;
use crate::crypto::RsaDecryptor;
use crate::error::{FerroscapeError, Result};
use crate::game::persistence::{JsonPlayerStore, PlayerStore, WorkerPool};
use crate::game::world::World;
use crate::net::gateway::AdmissionGate;
use crate::net::session::SessionManager;
use crate::protocol::packets::HandlerTable;

/// Application state shared across all connections
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Per-host admission policy
    pub gate: AdmissionGate,
    /// Session manager for tracking connected clients
    pub session_manager: SessionManager,
    /// Game world state
    pub world: World,
    /// RSA decryptor for the login block
    pub rsa: RsaDecryptor,
    /// Player state collaborator
    pub store: Arc<dyn PlayerStore>,
    /// Blocking pool for store calls
    pub workers: WorkerPool,
    /// Opcode handlers, built once at startup
    pub handlers: HandlerTable,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create the application state with JSON player files under the data path
    pub fn new(config: ServerConfig, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let store = Arc::new(JsonPlayerStore::new(config.players_path()));
        info!(path = %store.root().display(), "Player store initialized");
        Self::with_store(config, shutdown_tx, store)
    }

    /// Create the application state around an existing store
    pub fn with_store(
        config: ServerConfig,
        shutdown_tx: broadcast::Sender<()>,
        store: Arc<dyn PlayerStore>,
    ) -> Result<Self> {
        let key_pair = config
            .rsa_key_pair()
            .map_err(|e| FerroscapeError::Config(e.to_string()))?;
        info!(
            "RSA decryptor initialized (key size: {} bits)",
            key_pair.key_size_bits()
        );

        Ok(Self {
            gate: AdmissionGate::from_config(&config.admission),
            session_manager: SessionManager::new(),
            world: World::from_config(&config),
            rsa: RsaDecryptor::new(key_pair),
            store,
            workers: WorkerPool::new(config.worker_pool_size),
            handlers: HandlerTable::init(),
            config,
            shutdown_tx,
        })
    }
}
