//! Integration tests for admission, login and the world tick
//!
//! These tests drive the public API end to end without sockets:
//! - Per-host admission and throttling
//! - The connect and login exchange over in-memory session buffers
//! - World entry, update frames and the final save on shutdown

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use num_bigint::BigUint;
use pretty_assertions::assert_eq;
use tokio::sync::{broadcast, mpsc};

use ferroscape_server::config::ServerConfig;
use ferroscape_server::crypto::isaac::seeds_from_keys;
use ferroscape_server::crypto::rsa::RsaEncryptor;
use ferroscape_server::crypto::IsaacPair;
use ferroscape_server::error::{FerroscapeError, ProtocolError};
use ferroscape_server::game::entity::PlayerRights;
use ferroscape_server::game::persistence::{
    MemoryPlayerStore, PlayerState, DEFAULT_HITPOINTS, DEFAULT_SPAWN,
};
use ferroscape_server::game::sync::entity_sync::{NPC_UPDATE_OPCODE, PLAYER_UPDATE_OPCODE};
use ferroscape_server::game::world;
use ferroscape_server::net::gateway::AdmissionGate;
use ferroscape_server::net::session::{Session, Stage};
use ferroscape_server::protocol::handshake::{progress, CONNECT_REPLY_SIZE, CONNECT_REQUEST};
use ferroscape_server::protocol::login::{decode_login_block, Credentials, LoginBlock, LoginType};
use ferroscape_server::{AppState, CLIENT_VERSION};

/// 512-bit key pair used only by these tests
const TEST_MODULUS: &str = "7278324031498520272961780855258523218547926107233192192576016087630540556525989488850103369629980906339555847162219659858103652303584917740008168177707287";
const TEST_PRIVATE_EXPONENT: &str = "727088323149073229276298568127585203958577173566927221032320327841023376467865642039416553580754043251253301947811630477246688510539652709480578869316193";
const TEST_PUBLIC_EXPONENT: u32 = 65537;

const CLIENT_KEY: u64 = 0x1234_5678_9abc_def0;
const SERVER_KEY: u64 = 0x0fed_cba9_8765_4321;

fn encryptor() -> RsaEncryptor {
    let modulus = TEST_MODULUS.parse::<BigUint>().unwrap();
    RsaEncryptor::new(modulus, BigUint::from(TEST_PUBLIC_EXPONENT))
}

fn test_state(store: Arc<MemoryPlayerStore>) -> AppState {
    let mut config = ServerConfig::default();
    config.rsa.modulus = TEST_MODULUS.to_string();
    config.rsa.private_exponent = TEST_PRIVATE_EXPONENT.to_string();
    let (shutdown_tx, _) = broadcast::channel(1);
    AppState::with_store(config, shutdown_tx, store).unwrap()
}

fn login_block(username: &str, password: &str, version: u16) -> LoginBlock {
    LoginBlock {
        login_type: LoginType::Normal,
        version,
        low_memory: false,
        client_key: CLIENT_KEY,
        server_key: SERVER_KEY,
        uid: 317,
        credentials: Credentials {
            username: username.to_string(),
            password: password.to_string(),
        },
    }
}

/// Run the connect exchange and submit a login block. Returns the session,
/// its outbound queue and the three-byte login reply.
async fn attempt_login(
    state: &AppState,
    username: &str,
    password: &str,
) -> (Arc<Session>, mpsc::Receiver<Vec<u8>>, Vec<u8>) {
    let (tx, mut rx) = mpsc::channel(16);
    let session = state
        .session_manager
        .create_session("127.0.0.1:50000".parse().unwrap(), Some(tx));

    session.append_inbound(&[CONNECT_REQUEST, 0]).unwrap();
    progress(state, &session).await.unwrap();
    let reply = rx.try_recv().unwrap();
    assert_eq!(reply.len(), CONNECT_REPLY_SIZE);
    assert_eq!(session.stage(), Stage::LoggingIn);

    let bytes = login_block(username, password, CLIENT_VERSION)
        .encode(&encryptor())
        .unwrap();
    session.append_inbound(&bytes).unwrap();
    progress(state, &session).await.unwrap();
    let reply = rx.try_recv().unwrap();
    (session, rx, reply)
}

#[test]
fn test_host_throttle_scenario() {
    let gate = AdmissionGate::new(1, Duration::from_millis(1000));
    let host = "203.0.113.5";
    let start = Instant::now();

    assert!(gate.enter_at(host, start));
    assert!(!gate.enter_at(host, start + Duration::from_millis(200)));
    assert_eq!(gate.connections(host), 1);

    gate.exit(host);
    assert!(gate.enter_at(host, start + Duration::from_millis(1200)));
    assert_eq!(gate.connections(host), 1);
}

#[test]
fn test_loopback_always_admitted() {
    let gate = AdmissionGate::new(1, Duration::from_millis(1000));
    let now = Instant::now();
    for _ in 0..5 {
        assert!(gate.enter_at("127.0.0.1", now));
    }
}

#[test]
fn test_version_mismatch_rejected_before_credentials() {
    let state = test_state(Arc::new(MemoryPlayerStore::new()));
    let mut bytes = login_block("zezima", "secret", CLIENT_VERSION + 1)
        .encode(&encryptor())
        .unwrap();
    // Garble the encrypted credentials; the version check must fire first
    let tail = bytes.len() - 8;
    for byte in &mut bytes[tail..] {
        *byte ^= 0xff;
    }

    let mut buffer = BytesMut::from(&bytes[..]);
    let err = decode_login_block(&mut buffer, &state.rsa).unwrap_err();
    assert!(matches!(
        err,
        FerroscapeError::Protocol(ProtocolError::InvalidVersion { expected: 317, actual: 318 })
    ));
}

#[tokio::test]
async fn test_new_user_gets_default_entity() {
    let store = Arc::new(MemoryPlayerStore::new());
    let state = test_state(store.clone());

    let (session, _rx, reply) = attempt_login(&state, "Fresh_Start", "hunter2").await;
    assert_eq!(reply, vec![2, 0, 0]);
    assert_eq!(session.stage(), Stage::LoggedIn);

    let player = state.world.player_for(&session).unwrap();
    assert_eq!(player.username, "fresh start");
    assert_eq!(player.location(), DEFAULT_SPAWN);
    assert_eq!(player.rights(), PlayerRights::Player);
    let mobile = player.mobile().read();
    assert_eq!(mobile.hp, DEFAULT_HITPOINTS);
    assert!(!mobile.has_died);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_already_online_rejected() {
    let state = test_state(Arc::new(MemoryPlayerStore::new()));

    let (first, _first_rx, reply) = attempt_login(&state, "zezima", "secret").await;
    assert_eq!(reply, vec![2, 0, 0]);

    let (second, _second_rx, reply) = attempt_login(&state, "ZEZIMA", "secret").await;
    assert_eq!(reply, vec![5, 0, 0]);
    assert_eq!(second.stage(), Stage::LoggedOut);
    assert!(state.session_manager.get(second.id).is_none());

    assert_eq!(state.world.players.len(), 1);
    assert_eq!(state.session_manager.player_count(), 1);
    assert_eq!(first.stage(), Stage::LoggedIn);
}

#[tokio::test]
async fn test_saved_state_restored() {
    let store = Arc::new(MemoryPlayerStore::new());
    let mut saved = PlayerState::new("zezima", "secret");
    saved.staff_rights = PlayerRights::Administrator;
    saved.hp = 7;
    store.insert(saved);
    let state = test_state(store);

    let (session, _rx, reply) = attempt_login(&state, "zezima", "secret").await;
    assert_eq!(reply, vec![2, 2, 0]);
    let player = state.world.player_for(&session).unwrap();
    assert_eq!(player.mobile().read().hp, 7);
}

#[tokio::test]
async fn test_tick_sends_ciphered_update_frames() {
    let state = test_state(Arc::new(MemoryPlayerStore::new()));
    let (_session, mut rx, _) = attempt_login(&state, "zezima", "secret").await;

    let report = world::process_tick(&state);
    assert_eq!(report.frames_sent, 2);

    let mut client = IsaacPair::for_client(&seeds_from_keys(CLIENT_KEY, SERVER_KEY));
    let players = rx.try_recv().unwrap();
    assert_eq!(client.decode_opcode(players[0]), PLAYER_UPDATE_OPCODE);
    let npcs = rx.try_recv().unwrap();
    assert_eq!(client.decode_opcode(npcs[0]), NPC_UPDATE_OPCODE);
}

#[tokio::test]
async fn test_shutdown_saves_players_once() {
    let store = Arc::new(MemoryPlayerStore::new());
    let state = test_state(store.clone());
    let (session, _rx, _) = attempt_login(&state, "zezima", "secret").await;

    world::shutdown(&state).await;
    world::shutdown(&state).await;

    assert_eq!(store.len(), 1);
    let saved = store.get("zezima").unwrap();
    assert_eq!(saved.position, DEFAULT_SPAWN);
    assert!(saved.last_login.is_some());
    assert!(session.is_closed());
    assert_eq!(state.world.players.len(), 0);
    assert_eq!(state.session_manager.count(), 0);
}
