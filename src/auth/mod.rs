//! Credential Handling
//!
//! Seeded one-way hashing of stored passwords.

mod credential;

pub use credential::{CredentialVerifier, Verdict, HASH_LEN};
