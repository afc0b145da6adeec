//! Login block decoding
//!
//! The login block follows the connect exchange:
//! 1. Login type (normal or reconnection) and the block length
//! 2. Magic byte, client version, memory flag and the archive CRCs
//! 3. An RSA-encrypted secure block holding both ISAAC key halves, the
//!    client uid and the credentials
//!
//! The version is checked before anything inside the secure block is read.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::crypto::isaac::seeds_from_keys;
use crate::crypto::rsa::{RsaEncryptor, LOGIN_BLOCK_OPCODE};
use crate::crypto::RsaDecryptor;
use crate::error::{LoginResponse, ProtocolError, Result};
use crate::net::buffer::PacketBuffer;
use crate::CLIENT_VERSION;

/// Bytes of the block preceding the RSA length byte
pub const LOGIN_BLOCK_OVERHEAD: i32 = 40;

/// Fixed first byte of the block
pub const LOGIN_MAGIC: u8 = 255;

/// Number of archive CRC words the client sends
pub const CRC_COUNT: usize = 9;

/// Longest accepted password
pub const MAX_PASSWORD_LENGTH: usize = 20;

static USERNAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_ ]{1,12}$").expect("username pattern is a valid regex")
});

/// Login types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginType {
    /// Normal login
    Normal = 16,
    /// Reconnection (client already has cached data)
    Reconnect = 18,
}

impl LoginType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            16 => Some(Self::Normal),
            18 => Some(Self::Reconnect),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Normalized username and password
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Lower-case both fields, turn underscores in the username into spaces, and trim
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_lowercase().replace('_', " ").trim().to_string(),
            password: password.to_lowercase().trim().to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        USERNAME_PATTERN.is_match(&self.username)
            && !self.password.is_empty()
            && self.password.chars().count() <= MAX_PASSWORD_LENGTH
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Decoded login block
#[derive(Debug, Clone)]
pub struct LoginBlock {
    pub login_type: LoginType,
    pub version: u16,
    pub low_memory: bool,
    pub client_key: u64,
    pub server_key: u64,
    pub uid: u32,
    pub credentials: Credentials,
}

impl LoginBlock {
    /// ISAAC seed words derived from the two key halves
    pub fn seeds(&self) -> [u32; 4] {
        seeds_from_keys(self.client_key, self.server_key)
    }

    /// Serialize the block the way a client sends it. Credentials are written as given.
    pub fn encode(&self, encryptor: &RsaEncryptor) -> anyhow::Result<Vec<u8>> {
        let mut secure = PacketBuffer::with_capacity(256);
        secure.write_byte(LOGIN_BLOCK_OPCODE)?;
        secure.write_long(self.client_key)?;
        secure.write_long(self.server_key)?;
        secure.write_int(self.uid)?;
        secure.write_string(&self.credentials.username)?;
        secure.write_string(&self.credentials.password)?;
        let encrypted = encryptor.encrypt(secure.as_bytes())?;

        let block_length = LOGIN_BLOCK_OVERHEAD as usize + 1 + encrypted.len();
        if block_length > u8::MAX as usize {
            anyhow::bail!("login block of {} bytes does not fit its length byte", block_length);
        }

        let mut out = PacketBuffer::with_capacity(2 + block_length);
        out.write_byte(self.login_type.as_u8())?;
        out.write_byte(block_length as u8)?;
        out.write_byte(LOGIN_MAGIC)?;
        out.write_short(self.version)?;
        out.write_byte(self.low_memory as u8)?;
        for _ in 0..CRC_COUNT {
            out.write_int(0)?;
        }
        out.write_byte(encrypted.len() as u8)?;
        out.write_bytes(&encrypted)?;
        Ok(out.as_bytes().to_vec())
    }
}

/// Decode a login block from the front of `buffer`.
///
/// Returns `Ok(None)` and leaves the buffer untouched until the whole
/// declared block has arrived.
pub fn decode_login_block(buffer: &mut BytesMut, rsa: &RsaDecryptor) -> Result<Option<LoginBlock>> {
    if buffer.len() < 2 {
        return Ok(None);
    }
    let login_type = LoginType::from_u8(buffer[0]).ok_or(ProtocolError::InvalidLoginType(buffer[0]))?;
    let block_length = buffer[1] as usize;
    let rsa_size = block_length as i32 - LOGIN_BLOCK_OVERHEAD;
    if rsa_size <= 0 {
        return Err(ProtocolError::InvalidBlockSize(rsa_size).into());
    }
    if buffer.len() - 2 < block_length {
        return Ok(None);
    }

    let frame = buffer.split_to(2 + block_length);
    let mut reader = PacketBuffer::from_bytes(&frame[2..]);

    let magic = reader.read_ubyte()?;
    if magic != LOGIN_MAGIC {
        return Err(ProtocolError::InvalidMagic(magic).into());
    }
    let version = reader.read_ushort()?;
    if version != CLIENT_VERSION {
        return Err(ProtocolError::InvalidVersion {
            expected: CLIENT_VERSION,
            actual: version,
        }
        .into());
    }
    let low_memory = reader.read_ubyte()? == 1;
    reader.skip(CRC_COUNT * 4)?;
    // Length of the RSA block, implied by the block length
    reader.skip(1)?;
    let encrypted = reader.read_bytes(rsa_size as usize - 1)?;

    let decrypted = rsa.decrypt_login_block(&encrypted)?;
    let mut secure = PacketBuffer::from_bytes(&decrypted);
    secure.skip(1)?;
    let client_key = secure.read_long()?;
    let server_key = secure.read_long()?;
    let uid = secure.read_int()?;
    let username = secure.read_string()?;
    let password = secure.read_string()?;

    debug!(
        login_type = ?login_type,
        version = version,
        uid = uid,
        "Decoded login block"
    );

    Ok(Some(LoginBlock {
        login_type,
        version,
        low_memory,
        client_key,
        server_key,
        uid,
        credentials: Credentials::new(&username, &password),
    }))
}

/// The three-byte reply to a login block
pub fn login_response(code: LoginResponse, rights: u8) -> [u8; 3] {
    [code.as_u8(), rights, 0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rsa::tests::test_keys;
    use crate::error::FerroscapeError;

    fn block(username: &str, password: &str) -> LoginBlock {
        LoginBlock {
            login_type: LoginType::Normal,
            version: CLIENT_VERSION,
            low_memory: false,
            client_key: 0x0102_0304_0506_0708,
            server_key: 0x1112_1314_1516_1718,
            uid: 42,
            credentials: Credentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        }
    }

    #[test]
    fn test_credentials_normalization() {
        let credentials = Credentials::new("  Mod_Ash ", " HUNTER2 ");
        assert_eq!(credentials.username, "mod ash");
        assert_eq!(credentials.password, "hunter2");
        assert!(credentials.is_valid());
    }

    #[test]
    fn test_credentials_validation() {
        assert!(!Credentials::new("", "pw").is_valid());
        assert!(!Credentials::new("thirteenchars", "pw").is_valid());
        assert!(!Credentials::new("bad-name", "pw").is_valid());
        assert!(!Credentials::new("zezima", "").is_valid());
        assert!(!Credentials::new("zezima", &"x".repeat(21)).is_valid());
        assert!(Credentials::new("zezima", &"x".repeat(20)).is_valid());
    }

    #[test]
    fn test_decode_recovers_keys_and_credentials() {
        let (decryptor, encryptor) = test_keys();
        let bytes = block("Zezima", "Secret").encode(&encryptor).unwrap();
        let mut buffer = BytesMut::from(&bytes[..]);

        let decoded = decode_login_block(&mut buffer, &decryptor).unwrap().unwrap();
        assert!(buffer.is_empty());
        assert_eq!(decoded.client_key, 0x0102_0304_0506_0708);
        assert_eq!(decoded.server_key, 0x1112_1314_1516_1718);
        assert_eq!(decoded.uid, 42);
        assert_eq!(decoded.credentials.username, "zezima");
        assert_eq!(decoded.credentials.password, "secret");
        assert_eq!(decoded.seeds(), [0x0102_0304, 0x0506_0708, 0x1112_1314, 0x1516_1718]);
    }

    #[test]
    fn test_partial_block_left_untouched() {
        let (decryptor, encryptor) = test_keys();
        let bytes = block("zezima", "secret").encode(&encryptor).unwrap();
        let mut buffer = BytesMut::from(&bytes[..bytes.len() - 1]);

        assert!(decode_login_block(&mut buffer, &decryptor).unwrap().is_none());
        assert_eq!(buffer.len(), bytes.len() - 1);

        buffer.extend_from_slice(&bytes[bytes.len() - 1..]);
        assert!(decode_login_block(&mut buffer, &decryptor).unwrap().is_some());
    }

    #[test]
    fn test_invalid_login_type() {
        let (decryptor, _) = test_keys();
        let mut buffer = BytesMut::from(&[17u8, 80][..]);
        let err = decode_login_block(&mut buffer, &decryptor).unwrap_err();
        assert!(matches!(
            err,
            FerroscapeError::Protocol(ProtocolError::InvalidLoginType(17))
        ));
    }

    #[test]
    fn test_non_positive_rsa_size() {
        let (decryptor, _) = test_keys();
        let mut buffer = BytesMut::from(&[16u8, 40][..]);
        let err = decode_login_block(&mut buffer, &decryptor).unwrap_err();
        assert!(matches!(
            err,
            FerroscapeError::Protocol(ProtocolError::InvalidBlockSize(0))
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let (decryptor, encryptor) = test_keys();
        let mut login = block("zezima", "secret");
        login.version = 318;
        let bytes = login.encode(&encryptor).unwrap();
        let mut buffer = BytesMut::from(&bytes[..]);
        let err = decode_login_block(&mut buffer, &decryptor).unwrap_err();
        assert!(matches!(
            err,
            FerroscapeError::Protocol(ProtocolError::InvalidVersion { actual: 318, .. })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let (decryptor, encryptor) = test_keys();
        let mut bytes = block("zezima", "secret").encode(&encryptor).unwrap();
        bytes[2] = 254;
        let mut buffer = BytesMut::from(&bytes[..]);
        let err = decode_login_block(&mut buffer, &decryptor).unwrap_err();
        assert!(matches!(
            err,
            FerroscapeError::Protocol(ProtocolError::InvalidMagic(254))
        ));
    }

    #[test]
    fn test_login_response_bytes() {
        assert_eq!(login_response(LoginResponse::Success, 2), [2, 2, 0]);
        assert_eq!(login_response(LoginResponse::AlreadyLoggedIn, 0), [5, 0, 0]);
    }
}
