//! RSA login block decryption
//!
//! The client encrypts the secure part of its login block (opcode sentinel,
//! keystream halves, credentials) as one big-endian integer. The server
//! recovers it with a single modular exponentiation using its fixed key.
//! No padding scheme is involved.

use std::fmt;

use anyhow::Context;
use num_bigint::BigUint;

use crate::error::{ProtocolError, Result};

/// Leading byte of every correctly decrypted login block
pub const LOGIN_BLOCK_OPCODE: u8 = 10;

/// Modulus of the key shipped with the protocol's clients (decimal)
pub const PROTOCOL_MODULUS: &str = "94306533927366675756465748344550949689550982334568289470527341681445613288505954291473168510012417401156971344988779343797488043615702971738296505168869556915772193568338164756326915583511871429998053169912492097791139829802309908513249248934714848531624001166946082342750924060600795950241816621880914628143";

/// Private exponent paired with [`PROTOCOL_MODULUS`] (decimal)
pub const PROTOCOL_EXPONENT: &str = "58942123322685908809689084302625256728774551587748168286651364002223076520293763732441711633712538400732268844501356343764421742749024359146319836858905124072353297696448255112361453630421295623429362610999525258756790291981270575779800669035081348981858658116089267888135561190976376091835832053427710797233";

/// Key material for the login block
#[derive(Clone)]
pub struct RsaKeyPair {
    /// RSA modulus (N)
    pub modulus: BigUint,
    /// Exponent the server decrypts with (D)
    pub private_exponent: BigUint,
}

impl RsaKeyPair {
    pub fn new(modulus: BigUint, private_exponent: BigUint) -> Self {
        Self {
            modulus,
            private_exponent,
        }
    }

    /// Parse a key pair from decimal strings, the form the key is published in
    pub fn from_decimal(modulus: &str, private_exponent: &str) -> anyhow::Result<Self> {
        let modulus = BigUint::parse_bytes(modulus.trim().as_bytes(), 10)
            .context("Failed to parse RSA modulus")?;
        let private_exponent = BigUint::parse_bytes(private_exponent.trim().as_bytes(), 10)
            .context("Failed to parse RSA private exponent")?;
        Ok(Self::new(modulus, private_exponent))
    }

    /// The key every stock client encrypts with
    pub fn protocol_default() -> anyhow::Result<Self> {
        Self::from_decimal(PROTOCOL_MODULUS, PROTOCOL_EXPONENT)
    }

    pub fn key_size_bits(&self) -> usize {
        self.modulus.bits() as usize
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("key_size_bits", &self.key_size_bits())
            // Don't log the private key!
            .finish()
    }
}

/// RSA decryptor for incoming login blocks
pub struct RsaDecryptor {
    key_pair: RsaKeyPair,
}

impl RsaDecryptor {
    pub fn new(key_pair: RsaKeyPair) -> Self {
        Self { key_pair }
    }

    /// Raw modular exponentiation of a big-endian block
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() {
            return Err(ProtocolError::InvalidRsaBlock.into());
        }
        let cipher_int = BigUint::from_bytes_be(ciphertext);
        let plain_int = cipher_int.modpow(&self.key_pair.private_exponent, &self.key_pair.modulus);
        Ok(plain_int.to_bytes_be())
    }

    /// Decrypt a login block and check its leading opcode sentinel
    pub fn decrypt_login_block(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.decrypt(ciphertext)?;
        match plaintext.first() {
            Some(&LOGIN_BLOCK_OPCODE) => Ok(plaintext),
            _ => Err(ProtocolError::InvalidRsaBlock.into()),
        }
    }

    pub fn key_pair(&self) -> &RsaKeyPair {
        &self.key_pair
    }
}

impl fmt::Debug for RsaDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaDecryptor")
            .field("key_pair", &self.key_pair)
            .finish()
    }
}

/// Public-key side of the exchange, used by test clients and tooling
pub struct RsaEncryptor {
    modulus: BigUint,
    public_exponent: BigUint,
}

impl RsaEncryptor {
    pub fn new(modulus: BigUint, public_exponent: BigUint) -> Self {
        Self {
            modulus,
            public_exponent,
        }
    }

    /// Encrypt a plaintext block; it must be numerically smaller than the modulus
    pub fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        if plaintext.is_empty() {
            anyhow::bail!("Empty plaintext");
        }
        let plain_int = BigUint::from_bytes_be(plaintext);
        if plain_int >= self.modulus {
            anyhow::bail!("Plaintext too large for RSA modulus");
        }
        Ok(plain_int
            .modpow(&self.public_exponent, &self.modulus)
            .to_bytes_be())
    }
}
