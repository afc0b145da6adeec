//! Frame decoding for logged-in sessions
//!
//! Inbound bytes are cut into frames (opcode, optional length byte, payload)
//! and routed through the handler table. At most `packets_per_cycle` frames
//! are decoded per session per world tick; anything beyond stays buffered
//! until the tick wakes the connection task again.

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::net::buffer::PacketBuffer;
use crate::net::session::{Inbound, Session};
use crate::protocol::packets::{Frame, PacketContext, PacketSize};
use crate::state::AppState;

/// Decode and dispatch as many buffered frames as this cycle allows.
/// Returns the number of frames decoded.
pub fn decode_frames(state: &AppState, session: &Session) -> Result<usize> {
    let cap = state.config.packets_per_cycle;
    let mut decoded = 0;

    while session.packet_count() < cap {
        let Some(mut frame) = session.with_inbound(|inbound| next_frame(session, inbound)) else {
            break;
        };
        session.increment_packet_count();
        session.touch();
        decoded += 1;

        let Some(player) = state.world.player_for(session) else {
            debug!(session_id = session.id, opcode = frame.opcode, "Frame without a player dropped");
            continue;
        };
        let ctx = PacketContext {
            state,
            session,
            player: &player,
        };

        match state.handlers.dispatch(&ctx, &mut frame) {
            Ok(true) => {
                trace!(session_id = session.id, opcode = frame.opcode, length = frame.length, "Frame handled");
            }
            Ok(false) => {
                debug!(session_id = session.id, opcode = frame.opcode, length = frame.length, "Unhandled opcode");
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(session_id = session.id, opcode = frame.opcode, error = %e, "Frame rejected");
            }
        }
    }

    Ok(decoded)
}

/// Cut the next complete frame off the inbound buffer. A frame whose length
/// or payload has not fully arrived is remembered across calls so the
/// opcode is only run through the keystream once.
fn next_frame(session: &Session, inbound: &mut Inbound) -> Option<Frame> {
    let opcode = match inbound.opcode {
        Some(opcode) => opcode,
        None => {
            if inbound.buffer.is_empty() {
                return None;
            }
            let encoded = inbound.buffer[0];
            let _ = inbound.buffer.split_to(1);
            let opcode = match session.cipher() {
                Some(cipher) => encoded.wrapping_sub(cipher.decode.lock().next_byte()),
                None => encoded,
            };
            inbound.opcode = Some(opcode);
            opcode
        }
    };

    let length = match inbound.length {
        Some(length) => length,
        None => {
            let length = match PacketSize::for_opcode(opcode) {
                PacketSize::Fixed(size) => size,
                PacketSize::VariableByte => {
                    if inbound.buffer.is_empty() {
                        return None;
                    }
                    let length = inbound.buffer[0] as usize;
                    let _ = inbound.buffer.split_to(1);
                    length
                }
            };
            inbound.length = Some(length);
            length
        }
    };

    if inbound.buffer.len() < length {
        return None;
    }
    let payload: BytesMut = inbound.buffer.split_to(length);
    inbound.opcode = None;
    inbound.length = None;

    Some(Frame {
        opcode,
        length,
        payload: PacketBuffer::wrap(payload),
    })
}
