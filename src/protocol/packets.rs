//! Packet definitions module
//!
//! Defines the incoming frame sizes and the opcode handler table:
//! - `INCOMING_PACKET_SIZES`, the length policy of every client opcode
//! - `Frame`, one assembled inbound message
//! - `PacketHandler` and `HandlerTable`, built once at startup by `HandlerTable::init`
//! - the handlers for keep-alive, focus, walking, commands and player requests

use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::error::{ProtocolError, Result};
use crate::game::entity::{Location, PendingAction, Player};
use crate::net::buffer::{ByteOrder, PacketBuffer, ValueType};
use crate::net::session::Session;
use crate::state::AppState;

/// Payload size of each client opcode: a fixed byte count, or -1 when a
/// length byte follows the opcode
#[rustfmt::skip]
pub const INCOMING_PACKET_SIZES: [i8; 256] = [
    0, 0, 0, 1, -1, 0, 0, 0, 0, 0,          // 0
    0, 0, 0, 0, 8, 0, 6, 2, 2, 0,           // 10
    0, 2, 0, 6, 0, 12, 0, 0, 0, 0,          // 20
    0, 0, 0, 0, 0, 8, 4, 0, 0, 2,           // 30
    2, 6, 0, 6, 0, -1, 0, 0, 0, 0,          // 40
    0, 0, 0, 12, 0, 0, 0, 8, 8, 12,         // 50
    8, 8, 0, 0, 0, 0, 0, 0, 0, 0,           // 60
    6, 0, 2, 2, 8, 6, 0, -1, 0, 6,          // 70
    0, 0, 0, 0, 0, 1, 4, 6, 0, 0,           // 80
    0, 0, 0, 0, 0, 3, 0, 0, -1, 0,          // 90
    0, 13, 0, -1, 0, 0, 0, 0, 0, 0,         // 100
    0, 0, 0, 0, 0, 0, 0, 6, 0, 0,           // 110
    1, 0, 6, 0, 0, 0, -1, 0, 2, 6,          // 120
    0, 4, 6, 8, 0, 6, 0, 0, 0, 2,           // 130
    0, 0, 0, 0, 0, 6, 0, 0, 0, 0,           // 140
    0, 0, 1, 2, 0, 2, 6, 0, 0, 0,           // 150
    0, 0, 0, 0, -1, -1, 0, 0, 0, 0,         // 160
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0,           // 170
    0, 8, 0, 3, 0, 2, 0, 0, 8, 1,           // 180
    0, 0, 12, 0, 0, 0, 0, 0, 0, 0,          // 190
    2, 0, 0, 0, 0, 0, 0, 0, 4, 0,           // 200
    4, 0, 0, 0, 7, 8, 0, 0, 10, 0,          // 210
    0, 0, 0, 0, 0, 0, -1, 0, 6, 0,          // 220
    1, 0, 0, 0, 6, 0, 6, 8, 1, 0,           // 230
    0, 4, 0, 0, 0, 0, -1, 0, -1, 4,         // 240
    0, 0, 6, 6, 0, 0,                       // 250
];

/// Packet size type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSize {
    /// Fixed size packet (possibly empty)
    Fixed(usize),
    /// Variable size (1 byte length prefix)
    VariableByte,
}

impl PacketSize {
    pub fn for_opcode(opcode: u8) -> Self {
        match INCOMING_PACKET_SIZES[opcode as usize] {
            -1 => PacketSize::VariableByte,
            size => PacketSize::Fixed(size.max(0) as usize),
        }
    }
}

pub mod opcodes {
    pub const KEEP_ALIVE: u8 = 0;
    pub const FOCUS_CHANGE: u8 = 3;
    pub const WALK_MINIMAP: u8 = 248;
    pub const WALK: u8 = 164;
    pub const WALK_ON_COMMAND: u8 = 98;
    pub const COMMAND: u8 = 103;
    pub const REQUEST: u8 = 139;
}

/// Anti-cheat bytes trailing a minimap walk
const MINIMAP_TRAILER: i32 = 14;

/// Offset added to a player index when an entity faces a player
const FACE_PLAYER_OFFSET: u16 = 32768;

/// One assembled inbound message
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: u8,
    /// Declared payload length
    pub length: usize,
    pub payload: PacketBuffer,
}

/// What a handler sees besides the frame itself
pub struct PacketContext<'a> {
    pub state: &'a AppState,
    pub session: &'a Session,
    pub player: &'a Arc<Player>,
}

/// Handler for one or more client opcodes. Handlers never block.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, ctx: &PacketContext<'_>, frame: &mut Frame) -> Result<()>;
}

/// Opcode to handler table
pub struct HandlerTable {
    handlers: Vec<Option<Arc<dyn PacketHandler>>>,
}

impl HandlerTable {
    pub fn empty() -> Self {
        Self {
            handlers: vec![None; 256],
        }
    }

    /// Table with every handler this server implements
    pub fn init() -> Self {
        let mut table = Self::empty();
        table.register(&[opcodes::KEEP_ALIVE], Arc::new(KeepAliveHandler));
        table.register(&[opcodes::FOCUS_CHANGE], Arc::new(FocusChangeHandler));
        table.register(
            &[opcodes::WALK, opcodes::WALK_MINIMAP, opcodes::WALK_ON_COMMAND],
            Arc::new(WalkHandler),
        );
        table.register(&[opcodes::COMMAND], Arc::new(CommandHandler));
        table.register(&[opcodes::REQUEST], Arc::new(RequestHandler));
        table
    }

    pub fn register(&mut self, opcodes: &[u8], handler: Arc<dyn PacketHandler>) {
        for &opcode in opcodes {
            self.handlers[opcode as usize] = Some(handler.clone());
        }
    }

    pub fn get(&self, opcode: u8) -> Option<&Arc<dyn PacketHandler>> {
        self.handlers[opcode as usize].as_ref()
    }

    pub fn registered(&self) -> usize {
        self.handlers.iter().filter(|h| h.is_some()).count()
    }

    /// Route a frame to its handler. Returns false when no handler is registered.
    pub fn dispatch(&self, ctx: &PacketContext<'_>, frame: &mut Frame) -> Result<bool> {
        match self.get(frame.opcode) {
            Some(handler) => {
                handler.handle(ctx, frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::init()
    }
}

/// Opcode 0
pub struct KeepAliveHandler;

impl PacketHandler for KeepAliveHandler {
    fn handle(&self, _ctx: &PacketContext<'_>, _frame: &mut Frame) -> Result<()> {
        Ok(())
    }
}

/// Opcode 3: client window gained or lost focus
pub struct FocusChangeHandler;

impl PacketHandler for FocusChangeHandler {
    fn handle(&self, ctx: &PacketContext<'_>, frame: &mut Frame) -> Result<()> {
        let focused = frame.payload.read_ubyte()? == 1;
        trace!(session_id = ctx.session.id, focused = focused, "Focus changed");
        Ok(())
    }
}

/// Opcodes 164, 248 and 98: a path of waypoints
pub struct WalkHandler;

impl PacketHandler for WalkHandler {
    fn handle(&self, ctx: &PacketContext<'_>, frame: &mut Frame) -> Result<()> {
        let mut size = frame.length as i32;
        if frame.opcode == opcodes::WALK_MINIMAP {
            size -= MINIMAP_TRAILER;
        }
        if size < 5 {
            return Err(ProtocolError::MalformedPacket(format!(
                "walk frame of {} bytes",
                frame.length
            ))
            .into());
        }
        let steps = ((size - 5) / 2) as usize;

        let payload = &mut frame.payload;
        let first_x = payload.read_short_as(ValueType::A, ByteOrder::Little)?;
        let mut deltas = Vec::with_capacity(steps);
        for _ in 0..steps {
            let dx = payload.read_byte()?;
            let dy = payload.read_byte()?;
            deltas.push((dx as i32, dy as i32));
        }
        let first_y = payload.read_ushort_le()?;
        let running = payload.read_byte_as(ValueType::C)? == 1;

        let mut mobile = ctx.player.mobile().write();
        if mobile.has_died {
            return Ok(());
        }
        let first = Location::new(first_x, first_y, mobile.location.z);
        let mut waypoints = Vec::with_capacity(steps + 1);
        waypoints.push(first);
        for (dx, dy) in deltas {
            waypoints.push(first.translate(dx, dy)?);
        }
        let from = mobile.location;
        mobile.walking.set_path(from, &waypoints, running);

        trace!(
            session_id = ctx.session.id,
            waypoints = waypoints.len(),
            running = running,
            "Walk request"
        );
        Ok(())
    }
}

/// Opcode 103: a typed `::command`
pub struct CommandHandler;

impl PacketHandler for CommandHandler {
    fn handle(&self, ctx: &PacketContext<'_>, frame: &mut Frame) -> Result<()> {
        let command = frame.payload.read_string()?;
        info!(
            session_id = ctx.session.id,
            username = %ctx.player.username,
            command = %command,
            "Command entered"
        );
        Ok(())
    }
}

/// Opcode 139: a request aimed at another player
pub struct RequestHandler;

impl PacketHandler for RequestHandler {
    fn handle(&self, ctx: &PacketContext<'_>, frame: &mut Frame) -> Result<()> {
        let index = frame.payload.read_ushort_le()? as i16;
        if index < 0 {
            return Ok(());
        }
        let index = index as u16;
        if index == ctx.player.slot {
            return Ok(());
        }
        let Some(target) = ctx.state.world.players.get(index) else {
            debug!(session_id = ctx.session.id, index = index, "Request for missing player");
            return Ok(());
        };
        if !target.location().is_viewable_from(&ctx.player.location()) {
            return Ok(());
        }
        ctx.player
            .queue_action(PendingAction::FaceEntity(target.slot + FACE_PLAYER_OFFSET));
        Ok(())
    }
}
