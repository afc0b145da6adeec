//! Error handling module
//!
//! Defines custom error types for the Ferroscape server.
//!
//! Errors fall into four families:
//! - policy rejections (`AuthError`), answered with a login status code
//! - protocol violations (`ProtocolError`), answered by disconnecting
//! - framing errors (`ProtocolError::is_fatal`), fatal for the offending session only
//! - collaborator failures (`GameError::Persistence`)

use std::io;

use thiserror::Error;

/// Main error type for the Ferroscape server
#[derive(Error, Debug)]
pub enum FerroscapeError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Game logic errors
    #[error("Game error: {0}")]
    Game(#[from] GameError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FerroscapeError {
    /// Whether this error must tear down the session it was raised on
    pub fn is_fatal(&self) -> bool {
        match self {
            FerroscapeError::Protocol(e) => e.is_fatal(),
            FerroscapeError::Network(_) | FerroscapeError::Io(_) => true,
            _ => false,
        }
    }
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection refused for host {0}")]
    Refused(String),

    #[error("Write buffer full")]
    WriteBufferFull,
}

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid request code: {0}")]
    InvalidRequest(u8),

    #[error("Invalid login type: {0}")]
    InvalidLoginType(u8),

    #[error("Invalid login block size: {0}")]
    InvalidBlockSize(i32),

    #[error("Invalid login block magic: {0}")]
    InvalidMagic(u8),

    #[error("Invalid client version: expected {expected}, got {actual}")]
    InvalidVersion { expected: u16, actual: u16 },

    #[error("Unable to decode login block")]
    InvalidRsaBlock,

    #[error("Handshake invoked in stage {0}")]
    UnexpectedStage(&'static str),

    #[error("Buffer overrun: needed {needed} bytes at {position} (capacity {capacity})")]
    BufferOverrun {
        needed: usize,
        position: usize,
        capacity: usize,
    },

    #[error("Frame length mismatch: header says {declared}, payload has {actual}")]
    FrameLengthMismatch { declared: usize, actual: usize },

    #[error("Not in {0} access mode")]
    WrongAccessMode(&'static str),

    #[error("No variable-length header to finish")]
    NoPendingHeader,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

impl ProtocolError {
    /// Framing errors corrupt the cursor state of a buffer and cannot be recovered
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::BufferOverrun { .. }
                | ProtocolError::FrameLengthMismatch { .. }
                | ProtocolError::WrongAccessMode(_)
                | ProtocolError::NoPendingHeader
        )
    }
}

/// Login policy rejections, each answered with a login status code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled")]
    AccountDisabled,

    #[error("Already logged in")]
    AlreadyLoggedIn,

    #[error("World full")]
    WorldFull,

    #[error("Could not complete login")]
    CouldNotComplete,
}

/// Game logic errors
#[derive(Error, Debug)]
pub enum GameError {
    #[error("No free slot for {0}")]
    NoFreeSlot(&'static str),

    #[error("Invalid location: ({x}, {y}, {z})")]
    InvalidLocation { x: i32, y: i32, z: i32 },

    #[error("Persistence failure: {0}")]
    Persistence(String),
}

/// Result type alias for Ferroscape operations
pub type Result<T> = std::result::Result<T, FerroscapeError>;

/// Response codes for the login protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginResponse {
    /// Successful login
    Success = 2,
    /// Invalid username or password
    InvalidCredentials = 3,
    /// Account (or host) is disabled
    AccountDisabled = 4,
    /// Account is already logged in
    AlreadyLoggedIn = 5,
    /// World is full
    WorldFull = 7,
    /// Could not complete login
    CouldNotCompleteLogin = 13,
}

impl LoginResponse {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<AuthError> for LoginResponse {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => LoginResponse::InvalidCredentials,
            AuthError::AccountDisabled => LoginResponse::AccountDisabled,
            AuthError::AlreadyLoggedIn => LoginResponse::AlreadyLoggedIn,
            AuthError::WorldFull => LoginResponse::WorldFull,
            AuthError::CouldNotComplete => LoginResponse::CouldNotCompleteLogin,
        }
    }
}
