//! Password hashing primitive.
//!
//! Workers only see the [`PasswordHasher`] trait; the bcrypt implementation
//! is the default plugged in by the server binary.

use thiserror::Error;

/// bcrypt work factor used when none is configured.
pub const DEFAULT_BCRYPT_COST: u32 = 10;

/// Error raised by a hashing primitive.
#[derive(Debug, Error)]
#[error("hashing failed: {0}")]
pub struct HashError(pub String);

/// CPU-bound hash/verify primitive run on worker threads.
///
/// Implementations block the calling thread for the duration of the work.
pub trait PasswordHasher: Send + Sync + 'static {
    /// Produces a new self-describing hash of `password`.
    fn hash(&self, password: &str) -> Result<String, HashError>;

    /// Checks `password` against a hash produced by [`PasswordHasher::hash`].
    fn verify(&self, password: &str, hash: &str) -> Result<bool, HashError>;
}

/// bcrypt-backed hasher producing `$2b$` hashes.
#[derive(Debug, Clone, Copy)]
pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        Self::new(DEFAULT_BCRYPT_COST)
    }
}

impl PasswordHasher for BcryptHasher {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        bcrypt::hash(password, self.cost).map_err(|e| HashError(e.to_string()))
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool, HashError> {
        bcrypt::verify(password, hash).map_err(|e| HashError(e.to_string()))
    }
}
