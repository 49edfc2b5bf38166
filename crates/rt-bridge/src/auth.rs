//! Authorization of remote users
//!
//! A connect request is allowed when the claimed user is on this device's
//! whitelist and the [`TokenVerifier`] accepts the accompanying token. An
//! empty whitelist rejects everyone.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

/// Checks that an auth token really proves the claimed identity
///
/// Extension point for a relay-issued credential. No scheme is defined
/// yet; [`UnverifiedTokens`] is the only implementation.
pub trait TokenVerifier: Send + Sync {
    /// Whether `token` proves `claimed_user`
    fn verify(&self, token: &Value, claimed_user: &str) -> bool;

    /// Whether this verifier actually checks anything
    fn enforces(&self) -> bool {
        true
    }
}

/// Accepts every token
///
/// Authorization with this verifier is whitelist-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnverifiedTokens;

impl TokenVerifier for UnverifiedTokens {
    fn verify(&self, _token: &Value, _claimed_user: &str) -> bool {
        true
    }

    fn enforces(&self) -> bool {
        false
    }
}

/// Decides whether a remote user may open a session
///
/// Immutable after construction and free of side effects besides logging,
/// so it can be shared across tasks.
#[derive(Clone)]
pub struct AuthGate {
    whitelist: HashSet<String>,
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthGate {
    /// Whitelist-only gate
    pub fn new(whitelist: HashSet<String>) -> Self {
        Self::with_verifier(whitelist, Arc::new(UnverifiedTokens))
    }

    /// Gate with a custom token verifier
    pub fn with_verifier(whitelist: HashSet<String>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            whitelist,
            verifier,
        }
    }

    /// Whether any user could ever be admitted
    pub fn is_open_to_anyone(&self) -> bool {
        !self.whitelist.is_empty()
    }

    /// Whether tokens are actually checked
    pub fn verifies_tokens(&self) -> bool {
        self.verifier.enforces()
    }

    /// Whether `user` may open a session
    pub fn authorize(&self, user: &str, token: &Value) -> bool {
        if self.whitelist.is_empty() {
            tracing::warn!("Rejecting user '{}': whitelist is empty", user);
            return false;
        }

        if !self.whitelist.contains(user) {
            tracing::warn!("Rejecting user '{}': not whitelisted", user);
            return false;
        }

        if !self.verifier.verify(token, user) {
            tracing::warn!("Rejecting user '{}': token verification failed", user);
            return false;
        }

        true
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("whitelist", &self.whitelist)
            .field("verifies_tokens", &self.verifies_tokens())
            .finish()
    }
}
