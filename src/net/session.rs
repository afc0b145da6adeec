//! Session management module
//!
//! Manages client sessions including:
//! - Session lifecycle (creation, tracking, cleanup)
//! - Stage machine (connected -> logging in -> logged in -> logged out)
//! - Per-session data (inbound buffer, ISAAC streams, packet counter, idle timer)
//! - Thread-safe session registry with a username index

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::crypto::{Isaac, IsaacPair};
use crate::error::{FerroscapeError, NetworkError, ProtocolError, Result};

/// Unique session identifier
pub type SessionId = u64;

/// Upper bound on bytes buffered but not yet decoded
pub const MAX_INBOUND_BYTES: usize = 16 * 1024;

/// Stage of a session in the login lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Waiting for the connect request
    Connected,
    /// Waiting for the login block
    LoggingIn,
    /// In the world
    LoggedIn,
    /// Torn down
    LoggedOut,
}

impl Stage {
    /// Stages only move forward one step at a time, except that any stage may log out
    pub fn can_advance_to(self, next: Stage) -> bool {
        match (self, next) {
            (Stage::LoggedOut, _) => false,
            (_, Stage::LoggedOut) => true,
            (Stage::Connected, Stage::LoggingIn) => true,
            (Stage::LoggingIn, Stage::LoggedIn) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Connected => "Connected",
            Stage::LoggingIn => "LoggingIn",
            Stage::LoggedIn => "LoggedIn",
            Stage::LoggedOut => "LoggedOut",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Resettable elapsed-time counter
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

/// The two keystreams of an authenticated session.
///
/// Encode and decode are locked separately: the world tick only touches the
/// encode stream and the connection task only touches the decode stream.
pub struct SessionCipher {
    pub encode: Mutex<Isaac>,
    pub decode: Mutex<Isaac>,
}

impl From<IsaacPair> for SessionCipher {
    fn from(pair: IsaacPair) -> Self {
        Self {
            encode: Mutex::new(pair.encode),
            decode: Mutex::new(pair.decode),
        }
    }
}

/// Bytes received but not yet consumed, plus the frame being assembled
#[derive(Debug, Default)]
pub struct Inbound {
    pub buffer: BytesMut,
    /// Decoded opcode of the frame in progress
    pub opcode: Option<u8>,
    /// Payload length of the frame in progress, once known
    pub length: Option<usize>,
}

/// A connected client session
pub struct Session {
    /// Unique session identifier
    pub id: SessionId,
    /// Remote address of the client
    pub address: SocketAddr,
    /// Host string used for admission bookkeeping
    host: String,
    stage: RwLock<Stage>,
    inbound: Mutex<Inbound>,
    /// Set once, when the login block is decoded
    cipher: OnceCell<SessionCipher>,
    /// Frames decoded since the last world tick
    packet_count: AtomicU32,
    /// Packet timeout timer
    timeout: Mutex<Stopwatch>,
    /// Outbound message channel, dropped when the session closes
    outbound_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Wakes the connection task when buffered frames may be decoded again
    wakeup: Notify,
    /// Username claimed during login
    username: RwLock<Option<String>>,
    /// World slot of this session's player (set when logged in)
    player_slot: RwLock<Option<u16>>,
    disconnecting: AtomicBool,
    closed: AtomicBool,
    pub created_at: Instant,
}

impl Session {
    /// Create a new session
    pub fn new(id: SessionId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            host: address.ip().to_string(),
            stage: RwLock::new(Stage::Connected),
            inbound: Mutex::new(Inbound::default()),
            cipher: OnceCell::new(),
            packet_count: AtomicU32::new(0),
            timeout: Mutex::new(Stopwatch::new()),
            outbound_tx: Mutex::new(None),
            wakeup: Notify::new(),
            username: RwLock::new(None),
            player_slot: RwLock::new(None),
            disconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Create a new session with an outbound channel
    pub fn with_channel(
        id: SessionId,
        address: SocketAddr,
        outbound_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        let session = Self::new(id, address);
        *session.outbound_tx.lock() = Some(outbound_tx);
        session
    }

    /// Host address (without port)
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn stage(&self) -> Stage {
        *self.stage.read()
    }

    /// Move to `next` if the transition is allowed. Returns whether it happened.
    /// Once a disconnect has begun only `LoggedOut` can be reached.
    pub fn advance(&self, next: Stage) -> bool {
        let mut stage = self.stage.write();
        if !stage.can_advance_to(next) {
            return false;
        }
        if next != Stage::LoggedOut && self.is_disconnecting() {
            return false;
        }
        let previous = *stage;
        *stage = next;
        debug!(
            session_id = self.id,
            old_stage = %previous,
            new_stage = %next,
            "Session stage changed"
        );
        true
    }

    // ============ Cipher ============

    /// Install the keystream pair. Fails if one was already installed.
    pub fn set_cipher(&self, pair: IsaacPair) -> Result<()> {
        self.cipher
            .set(SessionCipher::from(pair))
            .map_err(|_| FerroscapeError::Internal("session cipher already set".to_string()))
    }

    pub fn cipher(&self) -> Option<&SessionCipher> {
        self.cipher.get()
    }

    // ============ Inbound ============

    /// Append freshly read bytes to the inbound buffer
    pub fn append_inbound(&self, bytes: &[u8]) -> Result<()> {
        let mut inbound = self.inbound.lock();
        if inbound.buffer.len() + bytes.len() > MAX_INBOUND_BYTES {
            return Err(ProtocolError::BufferOverrun {
                needed: bytes.len(),
                position: inbound.buffer.len(),
                capacity: MAX_INBOUND_BYTES,
            }
            .into());
        }
        inbound.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Run `f` with exclusive access to the inbound state
    pub fn with_inbound<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Inbound) -> R,
    {
        f(&mut self.inbound.lock())
    }

    pub fn buffered_bytes(&self) -> usize {
        self.inbound.lock().buffer.len()
    }

    // ============ Per-cycle packet counter ============

    pub fn packet_count(&self) -> u32 {
        self.packet_count.load(Ordering::Acquire)
    }

    pub fn increment_packet_count(&self) -> u32 {
        self.packet_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reset the counter for a new tick and wake the connection task so that
    /// frames left buffered by the cap get decoded
    pub fn reset_packet_count(&self) {
        self.packet_count.store(0, Ordering::Release);
        self.wakeup.notify_one();
    }

    /// Resolves when the session is woken by a tick or by `close`
    pub async fn woken(&self) {
        self.wakeup.notified().await;
    }

    // ============ Idle timer ============

    /// Reset the packet timeout timer
    pub fn touch(&self) {
        self.timeout.lock().reset();
    }

    pub fn idle_duration(&self) -> Duration {
        self.timeout.lock().elapsed()
    }

    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.idle_duration() > max_idle
    }

    // ============ Identity ============

    pub fn set_username(&self, username: &str) {
        *self.username.write() = Some(username.to_string());
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn set_player_slot(&self, slot: u16) {
        *self.player_slot.write() = Some(slot);
    }

    pub fn player_slot(&self) -> Option<u16> {
        *self.player_slot.read()
    }

    // ============ Outbound ============

    /// Queue bytes for the writer task. Never waits: a client that cannot
    /// keep up is reported as a full write buffer.
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        match self.outbound_tx.lock().as_ref() {
            Some(tx) => tx.try_send(data).map_err(|e| {
                let err = match e {
                    mpsc::error::TrySendError::Full(_) => NetworkError::WriteBufferFull,
                    mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed,
                };
                FerroscapeError::Network(err)
            }),
            None if self.is_closed() => Err(NetworkError::ConnectionClosed.into()),
            None => Ok(()),
        }
    }

    // ============ Teardown ============

    /// Claim the right to run the disconnect sequence. Only the first caller
    /// gets the stage the session was in; the stage lock is held across the
    /// claim so no concurrent `advance` slips in between.
    pub fn begin_disconnect(&self) -> Option<Stage> {
        let stage = self.stage.read();
        if self.disconnecting.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(*stage)
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    /// Release the outbound channel and wake the connection task so it exits
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.outbound_tx.lock().take();
        self.wakeup.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("stage", &self.stage())
            .field("username", &self.username())
            .field("player_slot", &self.player_slot())
            .field("idle_duration", &self.idle_duration())
            .finish()
    }
}

/// Thread-safe session manager
pub struct SessionManager {
    /// Map of session ID to session
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Map of username to the session that claimed it
    username_to_session: DashMap<String, SessionId>,
    /// Next session ID to assign
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            username_to_session: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create and register a session for an admitted connection
    pub fn create_session(
        &self,
        address: SocketAddr,
        outbound_tx: Option<mpsc::Sender<Vec<u8>>>,
    ) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(match outbound_tx {
            Some(tx) => Session::with_channel(id, address, tx),
            None => Session::new(id, address),
        });
        self.sessions.insert(id, session.clone());

        info!(session_id = id, address = %address, "Session created");
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|r| r.clone())
    }

    /// Get the session that holds a username
    pub fn get_by_username(&self, username: &str) -> Option<Arc<Session>> {
        self.username_to_session
            .get(&username.to_lowercase())
            .and_then(|id| self.get(*id))
    }

    pub fn is_logged_in(&self, username: &str) -> bool {
        self.username_to_session
            .contains_key(&username.to_lowercase())
    }

    /// Atomically reserve a username for a session. Returns false if another
    /// session already holds it.
    pub fn claim_username(&self, session_id: SessionId, username: &str) -> bool {
        match self.username_to_session.entry(username.to_lowercase()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(session_id);
                if let Some(session) = self.get(session_id) {
                    session.set_username(username);
                }
                debug!(session_id = session_id, username = %username, "Username claimed");
                true
            }
        }
    }

    /// Release a username, but only if `session_id` is the one holding it
    pub fn release_username(&self, session_id: SessionId, username: &str) {
        self.username_to_session
            .remove_if(&username.to_lowercase(), |_, holder| *holder == session_id);
    }

    pub fn remove(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            if let Some(username) = session.username() {
                self.release_username(id, &username);
            }
            debug!(session_id = id, username = ?session.username(), "Session removed");
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of claimed usernames
    pub fn player_count(&self) -> usize {
        self.username_to_session.len()
    }

    /// Snapshot of every session, ordered by id
    pub fn all(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|r| r.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Snapshot of the sessions currently in the world, ordered by id
    pub fn logged_in(&self) -> Vec<Arc<Session>> {
        self.all()
            .into_iter()
            .filter(|s| s.stage() == Stage::LoggedIn)
            .collect()
    }

    /// Logged-in sessions whose timeout timer exceeds `max_idle`
    pub fn idle_sessions(&self, max_idle: Duration) -> Vec<Arc<Session>> {
        self.logged_in()
            .into_iter()
            .filter(|s| s.is_idle(max_idle))
            .collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[test]
    fn test_session_creation() {
        let session = Session::new(1, test_address());
        assert_eq!(session.id, 1);
        assert_eq!(session.stage(), Stage::Connected);
        assert_eq!(session.host(), "127.0.0.1");
        assert!(session.cipher().is_none());
    }

    #[test]
    fn test_stage_moves_forward_only() {
        let session = Session::new(1, test_address());

        assert!(!session.advance(Stage::LoggedIn));
        assert!(session.advance(Stage::LoggingIn));
        assert!(!session.advance(Stage::Connected));
        assert!(session.advance(Stage::LoggedIn));
        assert!(session.advance(Stage::LoggedOut));
        assert!(!session.advance(Stage::LoggedOut));
        assert_eq!(session.stage(), Stage::LoggedOut);
    }

    #[test]
    fn test_any_stage_may_log_out() {
        for stage in [Stage::Connected, Stage::LoggingIn, Stage::LoggedIn] {
            assert!(stage.can_advance_to(Stage::LoggedOut));
        }
    }

    #[test]
    fn test_cipher_set_once() {
        let session = Session::new(1, test_address());
        let seeds = [1, 2, 3, 4];
        assert!(session.set_cipher(IsaacPair::new(&seeds)).is_ok());
        assert!(session.set_cipher(IsaacPair::new(&[5, 6, 7, 8])).is_err());

        let mut expected = IsaacPair::new(&seeds);
        let cipher = session.cipher().unwrap();
        assert_eq!(cipher.decode.lock().next_byte(), expected.decode.next_byte());
        assert_eq!(cipher.encode.lock().next_byte(), expected.encode.next_byte());
    }

    #[test]
    fn test_inbound_limit() {
        let session = Session::new(1, test_address());
        assert!(session.append_inbound(&[0u8; MAX_INBOUND_BYTES]).is_ok());
        let err = session.append_inbound(&[0]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_packet_count_reset() {
        let session = Session::new(1, test_address());
        assert_eq!(session.increment_packet_count(), 1);
        assert_eq!(session.increment_packet_count(), 2);
        session.reset_packet_count();
        assert_eq!(session.packet_count(), 0);
    }

    #[test]
    fn test_begin_disconnect_once() {
        let session = Session::new(1, test_address());
        assert_eq!(session.begin_disconnect(), Some(Stage::Connected));
        assert_eq!(session.begin_disconnect(), None);
    }

    #[test]
    fn test_no_advance_after_disconnect_begins() {
        let session = Session::new(1, test_address());
        assert!(session.advance(Stage::LoggingIn));
        assert_eq!(session.begin_disconnect(), Some(Stage::LoggingIn));
        assert!(!session.advance(Stage::LoggedIn));
        assert!(session.advance(Stage::LoggedOut));
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = Session::with_channel(1, test_address(), tx);

        session.send(vec![1, 2, 3]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);

        session.close();
        assert!(session.is_closed());
        assert!(rx.recv().await.is_none());
        assert!(session.send(vec![4]).is_err());
    }

    #[tokio::test]
    async fn test_send_full_buffer() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::with_channel(1, test_address(), tx);
        session.send(vec![1]).unwrap();
        let err = session.send(vec![2]).unwrap_err();
        assert!(matches!(
            err,
            FerroscapeError::Network(NetworkError::WriteBufferFull)
        ));
    }

    #[tokio::test]
    async fn test_reset_wakes_connection_task() {
        let session = Session::new(1, test_address());
        session.reset_packet_count();
        // The stored permit completes the wait immediately
        tokio::time::timeout(Duration::from_millis(100), session.woken())
            .await
            .unwrap();
    }

    #[test]
    fn test_session_manager_create_and_remove() {
        let manager = SessionManager::new();
        let session = manager.create_session(test_address(), None);
        assert_eq!(session.id, 1);
        assert_eq!(manager.count(), 1);

        manager.remove(session.id);
        assert!(manager.get(session.id).is_none());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_claim_username() {
        let manager = SessionManager::new();
        let first = manager.create_session(test_address(), None);
        let second = manager.create_session(test_address(), None);

        assert!(manager.claim_username(first.id, "zezima"));
        assert!(!manager.claim_username(second.id, "Zezima"));
        assert!(manager.is_logged_in("ZEZIMA"));
        assert_eq!(manager.get_by_username("zezima").unwrap().id, first.id);

        // Only the holder can release
        manager.release_username(second.id, "zezima");
        assert!(manager.is_logged_in("zezima"));

        manager.remove(first.id);
        assert!(!manager.is_logged_in("zezima"));
        assert!(manager.claim_username(second.id, "zezima"));
    }

    #[test]
    fn test_idle_sessions() {
        let manager = SessionManager::new();
        let session = manager.create_session(test_address(), None);
        session.advance(Stage::LoggingIn);
        session.advance(Stage::LoggedIn);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(manager.idle_sessions(Duration::from_millis(5)).len(), 1);

        session.touch();
        assert!(manager.idle_sessions(Duration::from_secs(60)).is_empty());
    }
}
