//! World module
//!
//! Owns the live entities and drives the game tick:
//! - Player and NPC registries with stable slots
//! - Movement, scheduled tasks and the death sequence
//! - Per-viewer update frames (players then NPCs)
//! - Idle session cleanup and shutdown

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::game::entity::{EntityKey, EntityList, Location, Npc, Player, UidAllocator};
use crate::game::persistence::PlayerState;
use crate::game::sync::entity_sync::{EntityUpdateEncoder, Viewpoint};
use crate::game::task::{DeathTask, TaskScheduler};
use crate::net::session::{Session, SessionId, Stage};
use crate::protocol::handshake::disconnect;
use crate::state::AppState;

/// Maximum NPCs per world
pub const MAX_NPCS: usize = 4096;

/// Ticks between milestone log lines
const MILESTONE_TICKS: u64 = 1000;

/// Game world - entity registries and the task scheduler
pub struct World {
    pub players: EntityList<Player>,
    pub npcs: EntityList<Npc>,
    pub tasks: TaskScheduler,
    uids: UidAllocator,
    tick: AtomicU64,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub frames_sent: usize,
    pub deaths: usize,
    pub disconnected: usize,
}

impl World {
    pub fn new(max_players: usize, max_npcs: usize) -> Self {
        Self {
            players: EntityList::new("players", max_players),
            npcs: EntityList::new("npcs", max_npcs),
            tasks: TaskScheduler::new(),
            uids: UidAllocator::default(),
            tick: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        info!(
            max_players = config.max_players,
            max_npcs = MAX_NPCS,
            "Creating game world"
        );
        Self::new(config.max_players as usize, MAX_NPCS)
    }

    /// Current tick number
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.players.is_full()
    }

    /// Place a player in the world from its persisted state
    pub fn register_player(&self, session_id: SessionId, state: &PlayerState) -> Result<Arc<Player>> {
        let uid = self.uids.next();
        let player = self
            .players
            .add(|slot| Player::from_state(slot, uid, session_id, state))?;
        debug!(slot = player.slot, username = %player.username, "Player registered");
        Ok(player)
    }

    pub fn unregister_player(&self, slot: u16) -> Option<Arc<Player>> {
        let player = self.players.remove(slot)?;
        debug!(slot = slot, username = %player.username, "Player unregistered");
        Some(player)
    }

    /// The player owned by `session`, if it is in the world
    pub fn player_for(&self, session: &Session) -> Option<Arc<Player>> {
        session
            .player_slot()
            .and_then(|slot| self.players.get(slot))
            .filter(|player| player.session_id == session.id)
    }

    pub fn spawn_npc(&self, npc_id: u16, location: Location, max_hp: i32) -> Result<Arc<Npc>> {
        let uid = self.uids.next();
        self.npcs
            .add(|slot| Npc::new(slot, uid, npc_id, location, max_hp))
    }

    pub fn remove_npc(&self, slot: u16) -> Option<Arc<Npc>> {
        let npc = self.npcs.remove(slot)?;
        self.tasks.cancel_tasks(npc.uid);
        Some(npc)
    }

    fn schedule_death(&self, key: EntityKey) {
        self.tasks.submit(key.uid, Box::new(DeathTask::new(key)));
    }
}

/// Run the tick loop until shutdown, then disconnect everyone
pub async fn run(state: Arc<AppState>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!(tick_rate_ms = state.config.tick_rate_ms, "Starting game world");

    let mut tick_interval = interval(state.config.tick_interval());
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                let report = process_tick(&state);
                if report.tick % MILESTONE_TICKS == 0 {
                    debug!(
                        tick = report.tick,
                        players = state.world.players.len(),
                        npcs = state.world.npcs.len(),
                        sessions = state.session_manager.count(),
                        "Game tick milestone"
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    shutdown(&state).await;
    info!(total_ticks = state.world.tick(), "Game world stopped");
}

/// Disconnect every session (saving logged-in players) and wait for the saves
pub async fn shutdown(state: &AppState) {
    let sessions = state.session_manager.all();
    info!(sessions = sessions.len(), "Disconnecting all sessions");
    for session in sessions {
        disconnect(state, &session);
    }
    state.workers.drain().await;
}

/// One world tick
pub fn process_tick(state: &AppState) -> TickReport {
    let world = &state.world;
    let mut report = TickReport {
        tick: world.tick(),
        ..Default::default()
    };

    // Frames left buffered last tick may now be decoded
    for session in state.session_manager.all() {
        session.reset_packet_count();
    }

    let players = world.players.snapshot();
    let npcs = world.npcs.snapshot();
    // Actions queued by connection tasks since the last tick. From here to
    // the reset below only this loop writes update flags.
    for player in &players {
        player.apply_pending();
        player.mobile().write().process_movement();
    }
    for npc in &npcs {
        npc.mobile().write().process_movement();
    }

    world.tasks.process(world);

    let mut deaths = Vec::new();
    let mut failed = Vec::new();
    for player in &players {
        let Some(session) = state.session_manager.get(player.session_id) else {
            continue;
        };
        if session.stage() != Stage::LoggedIn {
            continue;
        }
        match synchronize(world, player, &session, &mut deaths) {
            Ok(frames) => report.frames_sent += frames,
            Err(e) => {
                warn!(session_id = session.id, error = %e, "Update frame failed");
                failed.push(session);
            }
        }
    }

    report.deaths = deaths.len();
    for key in deaths {
        world.schedule_death(key);
    }

    // Hits nobody saw still kill
    for player in &players {
        let mut mobile = player.mobile().write();
        if mobile.check_death() {
            world.schedule_death(player.key());
            report.deaths += 1;
        }
        mobile.reset_flags();
    }
    for npc in &npcs {
        let mut mobile = npc.mobile().write();
        if mobile.check_death() {
            world.schedule_death(npc.key());
            report.deaths += 1;
        }
        mobile.reset_flags();
    }

    for session in failed {
        disconnect(state, &session);
        report.disconnected += 1;
    }
    for session in state.session_manager.idle_sessions(state.config.idle_timeout()) {
        warn!(
            session_id = session.id,
            idle_secs = session.idle_duration().as_secs(),
            "Session timed out"
        );
        disconnect(state, &session);
        report.disconnected += 1;
    }

    world.tick.fetch_add(1, Ordering::SeqCst);
    report
}

/// Encode and queue both update frames for one viewer
fn synchronize(
    world: &World,
    player: &Player,
    session: &Session,
    deaths: &mut Vec<EntityKey>,
) -> Result<usize> {
    let viewer = Viewpoint {
        uid: player.uid,
        location: player.location(),
    };
    let cipher = session.cipher();

    let players_frame = {
        let mut local = player.local_players.lock();
        let mut encode = cipher.map(|c| c.encode.lock());
        EntityUpdateEncoder::players().encode(
            viewer,
            &mut local,
            &world.players,
            encode.as_deref_mut(),
            deaths,
        )?
    };
    session.send(players_frame.as_bytes().to_vec())?;

    let npcs_frame = {
        let mut local = player.local_npcs.lock();
        let mut encode = cipher.map(|c| c.encode.lock());
        EntityUpdateEncoder::npcs().encode(
            viewer,
            &mut local,
            &world.npcs,
            encode.as_deref_mut(),
            deaths,
        )?
    };
    session.send(npcs_frame.as_bytes().to_vec())?;

    Ok(2)
}
