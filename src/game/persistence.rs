//! Player persistence module
//!
//! Handles saving and loading player state outside the network tasks:
//! - `PlayerState`, the persisted form of a player
//! - `PlayerStore`, the load/save collaborator (JSON files or in-memory)
//! - `WorkerPool`, a bounded blocking pool running store calls off the
//!   reactor; loads are awaited, saves are fire-and-forget but keyed by
//!   username so a later load can wait for them

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info};

use crate::error::{FerroscapeError, GameError, Result};
use crate::game::entity::{Location, PlayerRights};

/// Where new players appear
pub const DEFAULT_SPAWN: Location = Location::new(3093, 3244, 0);

/// Starting (and maximum) hitpoints of a new player
pub const DEFAULT_HITPOINTS: i32 = 10;

fn default_max_hp() -> i32 {
    DEFAULT_HITPOINTS
}

/// Persisted player state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlayerState {
    pub username: String,
    pub password: String,
    #[serde(default = "default_position")]
    pub position: Location,
    #[serde(default)]
    pub staff_rights: PlayerRights,
    #[serde(default = "default_max_hp")]
    pub hp: i32,
    #[serde(default = "default_max_hp")]
    pub max_hp: i32,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

fn default_position() -> Location {
    DEFAULT_SPAWN
}

impl PlayerState {
    /// State of a player logging in for the first time
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            position: DEFAULT_SPAWN,
            staff_rights: PlayerRights::Player,
            hp: DEFAULT_HITPOINTS,
            max_hp: DEFAULT_HITPOINTS,
            banned: false,
            last_login: None,
        }
    }
}

/// Load/save collaborator. Implementations block; call them through the `WorkerPool`.
pub trait PlayerStore: Send + Sync {
    /// Saved state for `username`, or `None` on first login
    fn load(&self, username: &str) -> Result<Option<PlayerState>>;

    fn save(&self, state: &PlayerState) -> Result<()>;
}

/// One JSON document per player under a root directory
#[derive(Debug, Clone)]
pub struct JsonPlayerStore {
    root: PathBuf,
}

impl JsonPlayerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, username: &str) -> PathBuf {
        self.root.join(format!("{}.json", username))
    }
}

impl PlayerStore for JsonPlayerStore {
    fn load(&self, username: &str) -> Result<Option<PlayerState>> {
        let path = self.path_for(username);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(username = %username, "First login, no saved state");
                return Ok(None);
            }
            Err(e) => return Err(GameError::Persistence(format!("{}: {}", path.display(), e)).into()),
        };
        let state = serde_json::from_str(&content)
            .map_err(|e| GameError::Persistence(format!("{}: {}", path.display(), e)))?;
        debug!(username = %username, path = %path.display(), "Loaded player state");
        Ok(Some(state))
    }

    fn save(&self, state: &PlayerState) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| GameError::Persistence(format!("{}: {}", self.root.display(), e)))?;
        let path = self.path_for(&state.username);
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| GameError::Persistence(e.to_string()))?;
        fs::write(&path, json)
            .map_err(|e| GameError::Persistence(format!("{}: {}", path.display(), e)))?;
        debug!(username = %state.username, path = %path.display(), "Saved player state");
        Ok(())
    }
}

/// In-memory store, used by tests and tooling
#[derive(Debug, Default)]
pub struct MemoryPlayerStore {
    states: DashMap<String, PlayerState>,
}

impl MemoryPlayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: PlayerState) {
        self.states.insert(state.username.clone(), state);
    }

    pub fn get(&self, username: &str) -> Option<PlayerState> {
        self.states.get(username).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl PlayerStore for MemoryPlayerStore {
    fn load(&self, username: &str) -> Result<Option<PlayerState>> {
        Ok(self.get(username))
    }

    fn save(&self, state: &PlayerState) -> Result<()> {
        self.insert(state.clone());
        Ok(())
    }
}

/// Bounded pool for blocking store calls
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    /// Unfinished spawned jobs per key
    pending: Arc<DashMap<String, usize>>,
    settled: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            pending: Arc::new(DashMap::new()),
            settled: Arc::new(Notify::new()),
        }
    }

    /// Run `job` on the pool and wait for its result
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FerroscapeError::Internal("worker pool closed".to_string()))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| FerroscapeError::Internal(format!("worker failed: {}", e)))?
    }

    /// Queue `job` without waiting. Failures are logged with `name`.
    /// `key` is registered before this returns, so a later `settled(key)`
    /// always waits for the job.
    pub fn spawn<F>(&self, name: &'static str, key: impl Into<String>, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let key = key.into();
        *self.pending.entry(key.clone()).or_insert(0) += 1;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let permits = self.permits.clone();
        let in_flight = self.in_flight.clone();
        let idle = self.idle.clone();
        let pending = self.pending.clone();
        let settled = self.settled.clone();

        tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => tokio::task::spawn_blocking(job)
                    .await
                    .map_err(|e| FerroscapeError::Internal(format!("worker failed: {}", e)))
                    .and_then(|result| result),
                Err(_) => Err(FerroscapeError::Internal("worker pool closed".to_string())),
            };
            if let Err(e) = outcome {
                error!(job = name, key = %key, error = %e, "Background job failed");
            }
            pending.remove_if_mut(&key, |_, count| {
                *count -= 1;
                *count == 0
            });
            settled.notify_waiters();
            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }

    /// Wait until no job queued under `key` is unfinished
    pub async fn settled(&self, key: &str) {
        loop {
            let notified = self.settled.notified();
            if !self.pending.contains_key(key) {
                return;
            }
            notified.await;
        }
    }

    /// Spawned jobs that have not finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every spawned job has finished
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ferroscape-{}-{}-{}",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_new_player_defaults() {
        let state = PlayerState::new("zezima", "secret");
        assert_eq!(state.position, DEFAULT_SPAWN);
        assert_eq!(state.staff_rights, PlayerRights::Player);
        assert_eq!(state.hp, state.max_hp);
        assert!(!state.banned);
    }

    #[test]
    fn test_json_field_names() {
        let mut state = PlayerState::new("zezima", "secret");
        state.staff_rights = PlayerRights::Administrator;
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["staff-rights"], "ADMINISTRATOR");
        assert_eq!(json["position"]["x"], 3093);
        assert!(json.get("last-login").is_some());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let state: PlayerState =
            serde_json::from_str(r#"{"username":"bob","password":"pw"}"#).unwrap();
        assert_eq!(state.position, DEFAULT_SPAWN);
        assert_eq!(state.max_hp, DEFAULT_HITPOINTS);
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = scratch_dir("store");
        let store = JsonPlayerStore::new(&dir);
        assert!(store.load("bob").unwrap().is_none());

        let mut state = PlayerState::new("bob", "pw");
        state.position = Location::new(3222, 3218, 0);
        store.save(&state).unwrap();
        assert_eq!(store.load("bob").unwrap(), Some(state));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_file_is_persistence_error() {
        let dir = scratch_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("bob.json"), "{ not json").unwrap();
        let store = JsonPlayerStore::new(&dir);
        let err = assert_err!(store.load("bob"));
        assert!(matches!(err, FerroscapeError::Game(GameError::Persistence(_))));
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_worker_pool_run() {
        let pool = WorkerPool::new(2);
        let store = Arc::new(MemoryPlayerStore::new());
        store.insert(PlayerState::new("alice", "pw"));

        let loader = store.clone();
        let loaded = assert_ok!(pool.run(move || loader.load("alice")).await);
        assert_eq!(loaded.map(|state| state.username), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_worker_pool_drain_waits_for_spawned_jobs() {
        let pool = WorkerPool::new(1);
        let store = Arc::new(MemoryPlayerStore::new());
        for name in ["a", "b", "c"] {
            let store = store.clone();
            pool.spawn("save", name, move || store.save(&PlayerState::new(name, "pw")));
        }
        pool.spawn("failing", "d", || Err(GameError::Persistence("disk full".to_string()).into()));
        pool.drain().await;
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_settled_waits_for_keyed_save() {
        let pool = Arc::new(WorkerPool::new(2));
        let store = Arc::new(MemoryPlayerStore::new());
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let saver = store.clone();
        pool.spawn("save player", "zezima", move || {
            let _ = release_rx.recv();
            saver.save(&PlayerState::new("zezima", "pw"))
        });

        // Another key never waits on this one
        pool.settled("bob").await;

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.settled("zezima").await })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        release_tx.send(()).unwrap();
        assert_ok!(waiting.await);
        assert_eq!(store.len(), 1);
        assert!(!pool.pending.contains_key("zezima"));
    }
}
