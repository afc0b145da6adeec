//! ISAAC (Indirection, Shift, Accumulate, Add, and Count) keystream
//!
//! ISAAC is the pseudorandom generator used by the protocol to obfuscate
//! packet opcodes. Each side of an authenticated session owns two streams:
//! one for what it sends and one for what it receives. The server decodes
//! with the raw handshake seed and encodes with every seed word + 50.
//!
//! Reference: http://www.burtleburtle.net/bob/rand/isaacafa.html

use std::fmt;

/// Size of the ISAAC state array (must be a power of 2)
const SIZE: usize = 256;

/// Mask for array indexing (SIZE - 1)
const MASK: usize = SIZE - 1;

/// Golden ratio constant used in initialization
const GOLDEN_RATIO: u32 = 0x9e3779b9;

/// Offset added to each seed word for the server's outbound stream
pub const ENCODE_SEED_OFFSET: u32 = 50;

/// ISAAC keystream state
#[derive(Clone)]
pub struct Isaac {
    /// Results buffer, consumed from the top down
    results: [u32; SIZE],
    /// Internal state
    memory: [u32; SIZE],
    aa: u32,
    bb: u32,
    cc: u32,
    /// Unconsumed entries left in `results`
    count: usize,
}

impl Isaac {
    /// Create a new stream from the given seed words
    pub fn new(seed: &[u32]) -> Self {
        let mut isaac = Self {
            results: [0u32; SIZE],
            memory: [0u32; SIZE],
            aa: 0,
            bb: 0,
            cc: 0,
            count: 0,
        };
        for (slot, &word) in isaac.results.iter_mut().zip(seed.iter()) {
            *slot = word;
        }
        isaac.init();
        isaac
    }

    fn init(&mut self) {
        let mut state = [GOLDEN_RATIO; 8];
        for _ in 0..4 {
            mix(&mut state);
        }

        // Two diffusion passes: first over the seed, then over the memory it produced
        for pass in 0..2 {
            for i in (0..SIZE).step_by(8) {
                let source = if pass == 0 { &self.results } else { &self.memory };
                for (j, word) in state.iter_mut().enumerate() {
                    *word = word.wrapping_add(source[i + j]);
                }
                mix(&mut state);
                self.memory[i..i + 8].copy_from_slice(&state);
            }
        }

        self.generate();
        self.count = SIZE;
    }

    /// Refill the results buffer with 256 new words
    fn generate(&mut self) {
        self.cc = self.cc.wrapping_add(1);
        self.bb = self.bb.wrapping_add(self.cc);

        for i in 0..SIZE {
            let x = self.memory[i];
            self.aa ^= match i & 3 {
                0 => self.aa << 13,
                1 => self.aa >> 6,
                2 => self.aa << 2,
                _ => self.aa >> 16,
            };
            self.aa = self.memory[(i + 128) & MASK].wrapping_add(self.aa);

            let y = self.memory[(x >> 2) as usize & MASK]
                .wrapping_add(self.aa)
                .wrapping_add(self.bb);
            self.memory[i] = y;
            self.bb = self.memory[(y >> 10) as usize & MASK].wrapping_add(x);
            self.results[i] = self.bb;
        }
    }

    /// Advance the stream by one word
    #[inline]
    pub fn next_word(&mut self) -> u32 {
        if self.count == 0 {
            self.generate();
            self.count = SIZE;
        }
        self.count -= 1;
        self.results[self.count]
    }

    /// Advance the stream and return the low byte, used to shift one opcode
    #[inline]
    pub fn next_byte(&mut self) -> u8 {
        self.next_word() as u8
    }
}

impl fmt::Debug for Isaac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isaac").field("count", &self.count).finish()
    }
}

#[inline]
fn mix(s: &mut [u32; 8]) {
    s[0] ^= s[1] << 11;
    s[3] = s[3].wrapping_add(s[0]);
    s[1] = s[1].wrapping_add(s[2]);

    s[1] ^= s[2] >> 2;
    s[4] = s[4].wrapping_add(s[1]);
    s[2] = s[2].wrapping_add(s[3]);

    s[2] ^= s[3] << 8;
    s[5] = s[5].wrapping_add(s[2]);
    s[3] = s[3].wrapping_add(s[4]);

    s[3] ^= s[4] >> 16;
    s[6] = s[6].wrapping_add(s[3]);
    s[4] = s[4].wrapping_add(s[5]);

    s[4] ^= s[5] << 10;
    s[7] = s[7].wrapping_add(s[4]);
    s[5] = s[5].wrapping_add(s[6]);

    s[5] ^= s[6] >> 4;
    s[0] = s[0].wrapping_add(s[5]);
    s[6] = s[6].wrapping_add(s[7]);

    s[6] ^= s[7] << 8;
    s[1] = s[1].wrapping_add(s[6]);
    s[7] = s[7].wrapping_add(s[0]);

    s[7] ^= s[0] >> 9;
    s[2] = s[2].wrapping_add(s[7]);
    s[0] = s[0].wrapping_add(s[1]);
}

/// Seed words derived from the two 64-bit halves exchanged during login
pub fn seeds_from_keys(client_key: u64, server_key: u64) -> [u32; 4] {
    [
        (client_key >> 32) as u32,
        client_key as u32,
        (server_key >> 32) as u32,
        server_key as u32,
    ]
}

/// Keystream pair owned by one authenticated session
#[derive(Clone)]
pub struct IsaacPair {
    /// Stream added to outgoing opcodes
    pub encode: Isaac,
    /// Stream subtracted from incoming opcodes
    pub decode: Isaac,
}

impl IsaacPair {
    /// Build the server-side pair from the raw handshake seeds
    pub fn new(seeds: &[u32; 4]) -> Self {
        let encode_seeds = seeds.map(|word| word.wrapping_add(ENCODE_SEED_OFFSET));
        Self {
            encode: Isaac::new(&encode_seeds),
            decode: Isaac::new(seeds),
        }
    }

    /// Build the mirror-image pair a client holds
    pub fn for_client(seeds: &[u32; 4]) -> Self {
        let server = Self::new(seeds);
        Self {
            encode: server.decode,
            decode: server.encode,
        }
    }

    #[inline]
    pub fn encode_opcode(&mut self, opcode: u8) -> u8 {
        opcode.wrapping_add(self.encode.next_byte())
    }

    #[inline]
    pub fn decode_opcode(&mut self, encoded: u8) -> u8 {
        encoded.wrapping_sub(self.decode.next_byte())
    }
}

impl fmt::Debug for IsaacPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsaacPair")
            .field("encode", &self.encode)
            .field("decode", &self.decode)
            .finish()
    }
}
