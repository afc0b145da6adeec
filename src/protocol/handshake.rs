//! Handshake protocol handler
//!
//! Drives a session from connect to world entry:
//! - `Connected`: the connect request, answered with a fresh server key
//! - `LoggingIn`: the login block, answered with a three-byte status reply
//! - `LoggedIn`/`LoggedOut`: reaching the handshake again is a protocol violation
//!
//! `disconnect` is the single teardown path for every session, whatever its stage.

use std::sync::Arc;

use bytes::BytesMut;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, error, info, warn};

use crate::crypto::IsaacPair;
use crate::error::{AuthError, FerroscapeError, GameError, LoginResponse, ProtocolError, Result};
use crate::game::entity::{PendingAction, Player};
use crate::game::persistence::PlayerState;
use crate::net::session::{Session, Stage};
use crate::protocol::login::{decode_login_block, login_response, Credentials, LoginBlock};
use crate::state::AppState;

/// Request code a client opens a game connection with
pub const CONNECT_REQUEST: u8 = 14;

/// Size of the reply to the connect request
pub const CONNECT_REPLY_SIZE: usize = 17;

/// Consume the two-byte connect request. Returns false until both bytes are buffered.
pub fn decode_connect(buffer: &mut BytesMut) -> Result<bool> {
    if buffer.len() < 2 {
        return Ok(false);
    }
    let request = buffer[0];
    if request != CONNECT_REQUEST {
        return Err(ProtocolError::InvalidRequest(request).into());
    }
    // Request code and the padding byte
    let _ = buffer.split_to(2);
    Ok(true)
}

/// Eight ignored bytes, a zero status and the server's key half
pub fn connect_reply(server_key: u64) -> [u8; CONNECT_REPLY_SIZE] {
    let mut reply = [0u8; CONNECT_REPLY_SIZE];
    reply[9..].copy_from_slice(&server_key.to_be_bytes());
    reply
}

/// Advance the handshake as far as the buffered bytes allow
pub async fn progress(state: &AppState, session: &Arc<Session>) -> Result<()> {
    loop {
        match session.stage() {
            Stage::Connected => {
                let ready = session.with_inbound(|inbound| decode_connect(&mut inbound.buffer))?;
                if !ready {
                    return Ok(());
                }
                let server_key = OsRng.next_u64();
                session.send(connect_reply(server_key).to_vec())?;
                session.advance(Stage::LoggingIn);
                debug!(session_id = session.id, "Connect request accepted");
            }
            Stage::LoggingIn => {
                let block = session
                    .with_inbound(|inbound| decode_login_block(&mut inbound.buffer, &state.rsa))?;
                return match block {
                    Some(block) => complete_login(state, session, block).await,
                    None => Ok(()),
                };
            }
            stage => return Err(ProtocolError::UnexpectedStage(stage.name()).into()),
        }
    }
}

/// Decide the login outcome, reply, and either admit the player or disconnect
pub async fn complete_login(state: &AppState, session: &Arc<Session>, block: LoginBlock) -> Result<()> {
    session.set_cipher(IsaacPair::new(&block.seeds()))?;
    let credentials = block.credentials;

    let mut admitted = admit(state, session, &credentials).await;
    if state.world.is_full() {
        admitted = Err(AuthError::WorldFull);
    }

    // The connection may have dropped while the load was running
    if session.is_disconnecting() {
        state
            .session_manager
            .release_username(session.id, &credentials.username);
        return Ok(());
    }

    let mut player: Option<Arc<Player>> = None;
    let rejection = match admitted {
        Ok(saved) => match state.world.register_player(session.id, &saved) {
            Ok(registered) => {
                player = Some(registered);
                None
            }
            Err(FerroscapeError::Game(GameError::NoFreeSlot(_))) => Some(AuthError::WorldFull),
            Err(e) => {
                error!(session_id = session.id, error = %e, "Failed to register player");
                Some(AuthError::CouldNotComplete)
            }
        },
        Err(rejection) => Some(rejection),
    };
    let code = rejection
        .clone()
        .map(LoginResponse::from)
        .unwrap_or(LoginResponse::Success);

    let rights = player.as_ref().map(|p| p.rights().protocol_value()).unwrap_or(0);
    let reply = session.send(login_response(code, rights).to_vec());

    let Some(player) = player else {
        reply?;
        warn!(
            session_id = session.id,
            host = %session.host(),
            username = %credentials.username,
            code = code.as_u8(),
            reason = ?rejection,
            "Login rejected"
        );
        disconnect(state, session);
        return Ok(());
    };

    if let Err(e) = reply {
        abandon_entry(state, session, &player);
        return Err(e);
    }
    if !enter_world(state, session, &player) {
        return Ok(());
    }

    info!(
        session_id = session.id,
        username = %player.username,
        slot = player.slot,
        rights = ?player.rights(),
        location = %player.location(),
        "Player logged in"
    );
    Ok(())
}

/// Policy checks in priority order. The username claim taken here is held
/// by the session until it disconnects.
async fn admit(
    state: &AppState,
    session: &Session,
    credentials: &Credentials,
) -> std::result::Result<PlayerState, AuthError> {
    if !credentials.is_valid() {
        return Err(AuthError::InvalidCredentials);
    }
    if state.gate.is_banned(session.host()) {
        return Err(AuthError::AccountDisabled);
    }
    if !state
        .session_manager
        .claim_username(session.id, &credentials.username)
    {
        return Err(AuthError::AlreadyLoggedIn);
    }

    // A save from this account's last session must land before the load
    state.workers.settled(&credentials.username).await;
    let store = state.store.clone();
    let username = credentials.username.clone();
    match state.workers.run(move || store.load(&username)).await {
        Ok(Some(saved)) if saved.password != credentials.password => {
            Err(AuthError::InvalidCredentials)
        }
        Ok(Some(saved)) if saved.banned => Err(AuthError::AccountDisabled),
        Ok(Some(saved)) => Ok(saved),
        Ok(None) => Ok(PlayerState::new(&credentials.username, &credentials.password)),
        Err(e) => {
            error!(session_id = session.id, username = %credentials.username, error = %e, "Failed to load player");
            Err(AuthError::CouldNotComplete)
        }
    }
}

/// Bind a registered player to its session and move the session in-world.
/// Returns false, undoing the registration, when a disconnect began first:
/// that disconnect saw a `LoggingIn` session and had no player to remove.
fn enter_world(state: &AppState, session: &Session, player: &Player) -> bool {
    session.set_player_slot(player.slot);
    player.queue_action(PendingAction::Appearance);
    if session.advance(Stage::LoggedIn) {
        session.touch();
        return true;
    }
    abandon_entry(state, session, player);
    false
}

/// Remove a player registered for a session that never reached `LoggedIn`
fn abandon_entry(state: &AppState, session: &Session, player: &Player) {
    state.world.unregister_player(player.slot);
    state
        .session_manager
        .release_username(session.id, &player.username);
    warn!(
        session_id = session.id,
        username = %player.username,
        "Session closed during world entry"
    );
}

/// Tear a session down. Safe to call any number of times from any task;
/// only the first call has an effect.
pub fn disconnect(state: &AppState, session: &Session) {
    let Some(stage) = session.begin_disconnect() else {
        return;
    };

    if stage == Stage::LoggedIn {
        if let Some(player) = state.world.player_for(session) {
            let snapshot = player.snapshot();
            let store = state.store.clone();
            state
                .workers
                .spawn("save player", player.username.clone(), move || store.save(&snapshot));
            state.world.tasks.cancel_tasks(player.uid);
            state.world.unregister_player(player.slot);
        }
    }
    if let Some(username) = session.username() {
        state.session_manager.release_username(session.id, &username);
    }

    session.close();
    state.gate.exit(session.host());
    session.advance(Stage::LoggedOut);
    state.session_manager.remove(session.id);

    info!(
        session_id = session.id,
        host = %session.host(),
        stage = %stage,
        username = ?session.username(),
        "Session disconnected"
    );
}
