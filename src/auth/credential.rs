//! Credential Verifier
//!
//! Stored passwords are iterated SHA-1 digests seeded with the subject id,
//! encoded as letters only. A letters-only hash can never contain a numeric
//! seed; a hash that happens to contain the plaintext is re-rounded with a
//! counter until it does not, which keeps the output deterministic.

use sha1::{Digest, Sha1};

/// Length of an encoded credential hash
pub const HASH_LEN: usize = 40;

/// Digest rounds per hash
const STRETCH_ROUNDS: u32 = 1024;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Outcome of comparing a supplied password with a stored credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The stored credential is the hash of the supplied password
    Match,
    /// The stored credential is the unhashed password (legacy rows)
    LegacyMatch,
    Mismatch,
}

impl Verdict {
    pub fn is_match(self) -> bool {
        self != Verdict::Mismatch
    }
}

/// Creates and checks seeded credential hashes
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    rounds: u32,
}

impl Default for CredentialVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialVerifier {
    pub fn new() -> Self {
        Self {
            rounds: STRETCH_ROUNDS,
        }
    }

    /// Hash a plaintext credential for the given seed. Empty plaintexts
    /// must be rejected by the caller.
    pub fn create(&self, plaintext: &str, seed: u32) -> String {
        let mut counter = 0u32;
        loop {
            let encoded = encode(&self.stretch(plaintext, seed, counter));
            if plaintext.is_empty() || !encoded.contains(plaintext) {
                return encoded;
            }
            counter += 1;
        }
    }

    /// Check a supplied plaintext against a stored credential
    pub fn compare(&self, stored: &str, supplied: &str, seed: u32) -> bool {
        self.verify(stored, supplied, seed).is_match()
    }

    /// Like [`compare`](Self::compare), but tells a legacy plaintext match
    /// apart so the caller can rehash the stored value.
    pub fn verify(&self, stored: &str, supplied: &str, seed: u32) -> Verdict {
        if stored.len() == HASH_LEN && self.create(supplied, seed) == stored {
            return Verdict::Match;
        }

        // TODO: drop the plaintext fallback once every legacy row has been
        // rehashed on login.
        if stored.eq_ignore_ascii_case(supplied) {
            return Verdict::LegacyMatch;
        }

        Verdict::Mismatch
    }

    fn stretch(&self, plaintext: &str, seed: u32, counter: u32) -> [u8; 40] {
        let seed_bytes = seed.to_le_bytes();

        let mut hasher = Sha1::new();
        hasher.update(seed_bytes);
        hasher.update(plaintext.as_bytes());
        hasher.update(counter.to_le_bytes());
        let mut state = hasher.finalize_reset();

        for _ in 0..self.rounds {
            hasher.update(state);
            hasher.update(seed_bytes);
            hasher.update(plaintext.as_bytes());
            state = hasher.finalize_reset();
        }

        hasher.update(state);
        let tail = hasher.finalize();

        let mut out = [0u8; 40];
        out[..20].copy_from_slice(&state);
        out[20..].copy_from_slice(&tail);
        out
    }
}

fn encode(bytes: &[u8; 40]) -> String {
    bytes
        .iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}
