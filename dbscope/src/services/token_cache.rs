//! TTL cache of positive token validations.
//!
//! While the auth dependency is unreachable, the facade may serve a
//! previously seen positive verdict from this cache, marked `degraded`.
//! Negative verdicts are never cached. Tokens themselves are never stored;
//! entries are keyed by a SHA-256 fingerprint of the token.

use std::collections::HashMap;
use std::time::Duration;

use dbscope_types::auth::AuthVerdict;
use parking_lot::Mutex;
use secrecy::{ExposeSecret as _, SecretString};
use sha2::{Digest as _, Sha256};
use tokio::time::Instant;

/// Opaque token fingerprint used as cache key.
pub type TokenFingerprint = [u8; 32];

/// Computes the fingerprint of a token without retaining the token.
pub fn fingerprint(token: &SecretString) -> TokenFingerprint {
    Sha256::digest(token.expose_secret().as_bytes()).into()
}

struct CachedVerdict {
    verdict: AuthVerdict,
    expires_at: Instant,
}

/// TTL map of positive validation results.
///
/// Readers see a live entry or a miss, never a torn one; expired entries
/// are pruned lazily on access.
pub struct TokenCache {
    ttl: Duration,
    entries: Mutex<HashMap<TokenFingerprint, CachedVerdict>>,
}

impl TokenCache {
    /// A cache whose entries live for `ttl` after insertion.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores a positive verdict. Negative verdicts are ignored.
    pub fn insert(&self, token: &SecretString, verdict: &AuthVerdict) {
        if !verdict.valid {
            return;
        }
        let mut entries = self.entries.lock();
        entries.insert(
            fingerprint(token),
            CachedVerdict {
                verdict: verdict.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Returns the cached verdict for the token, if present and not
    /// expired.
    pub fn lookup(&self, token: &SecretString) -> Option<AuthVerdict> {
        let key = fingerprint(token);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.verdict.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Removes the entry for the token, if any. Used on logout.
    pub fn purge(&self, token: &SecretString) {
        self.entries.lock().remove(&fingerprint(token));
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries, expired ones included until they are touched.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
