//! Seeded expanding byte stream.
//!
//! Each step hashes the 32-byte state with SHA-512. The first half of the
//! digest becomes the next state and the second half is emitted.

use rand_core::{CryptoRng, Error, RngCore};
use sha2::{Digest, Sha512};

/// Number of hash steps applied to a fresh seed before any byte is emitted.
pub const PRE_EXPAND_ROUNDS: usize = 2048;

/// Byte returned for single-byte reads.
///
/// Some RSA key generators probe their randomness source with a one-byte
/// read and discard it. Answering those probes with a constant keeps the
/// derived key independent of whether the probe happens. If the keygen
/// routine is ever swapped, check again whether it still probes this way.
pub const FILLER_BYTE: u8 = 0;

const STATE_LEN: usize = 32;
const BLOCK_LEN: usize = 32;

/// Deterministic byte source derived from a seed string.
///
/// Two streams built from the same seed produce the same bytes in the same
/// order. The stream is only as strong as the seed's entropy. Use it for
/// reproducible host identities, never for session secrets.
pub struct SeededStream {
    state: [u8; STATE_LEN],
    block: [u8; BLOCK_LEN],
    offset: usize,
}

impl SeededStream {
    /// Builds a stream from `seed` and pre-expands it.
    pub fn new(seed: &[u8]) -> Self {
        let digest = Sha512::digest(seed);
        let mut state = [0u8; STATE_LEN];
        state.copy_from_slice(&digest[..STATE_LEN]);

        let mut stream = Self {
            state,
            block: [0u8; BLOCK_LEN],
            offset: BLOCK_LEN,
        };
        for _ in 0..PRE_EXPAND_ROUNDS {
            stream.step();
        }
        stream.offset = BLOCK_LEN;
        stream
    }

    fn step(&mut self) {
        let digest = Sha512::digest(self.state);
        self.state.copy_from_slice(&digest[..STATE_LEN]);
        self.block.copy_from_slice(&digest[STATE_LEN..]);
        self.offset = 0;
    }

    fn fill(&mut self, dest: &mut [u8]) {
        if dest.len() == 1 {
            dest[0] = FILLER_BYTE;
            return;
        }

        let mut written = 0;
        while written < dest.len() {
            if self.offset == BLOCK_LEN {
                self.step();
            }
            let take = (BLOCK_LEN - self.offset).min(dest.len() - written);
            dest[written..written + take]
                .copy_from_slice(&self.block[self.offset..self.offset + take]);
            self.offset += take;
            written += take;
        }
    }
}

impl std::fmt::Debug for SeededStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeededStream").finish_non_exhaustive()
    }
}

impl RngCore for SeededStream {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.fill(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill(dest);
        Ok(())
    }
}

impl CryptoRng for SeededStream {}
