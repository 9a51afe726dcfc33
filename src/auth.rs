//! Proxy authentication: the verifier capability and the memoized decision.

use base64::{
    Engine, alphabet,
    engine::{GeneralPurpose, general_purpose},
};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};

use crate::cache::TtlCache;

/// How long an authorization outcome is trusted before re-verification.
pub const DECISION_TTL: Duration = Duration::from_secs(60);

/// How often the listener's decision cache drops expired entries.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Standard alphabet with canonical padding, tolerating non-zero trailing bits.
const CREDENTIAL_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    general_purpose::PAD.with_decode_allow_trailing_bits(true),
);

/// Memoized authorization outcomes keyed by the raw credential token.
pub type DecisionCache = TtlCache<String, bool>;

/// Verifies a username/password pair.
pub trait Authenticator: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

#[derive(Clone, Debug, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
}

/// Fixed table of accepted users.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.username, user.password))
                .collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for StaticAuthenticator {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}

/// Decides whether `credential` (the base64 token of a `Proxy-Authorization`
/// header) is authorized, consulting `cache` before `authenticator`.
///
/// Every verification outcome, including failures on undecodable tokens, is
/// cached for [`DECISION_TTL`].
pub fn evaluate(credential: &str, authenticator: &dyn Authenticator, cache: &DecisionCache) -> bool {
    if let Some(authorized) = cache.get(credential) {
        return authorized;
    }

    let authorized = decode_credential(credential)
        .is_some_and(|(username, password)| authenticator.verify(&username, &password));

    cache.put(credential.to_string(), authorized, DECISION_TTL);
    authorized
}

/// Decodes `base64(user:pass)`; anything but exactly one `:` is rejected, and
/// so are decoded bytes that are not UTF-8.
fn decode_credential(credential: &str) -> Option<(String, String)> {
    let decoded = CREDENTIAL_ENGINE.decode(credential).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    let mut parts = decoded.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(username), Some(password), None) => Some((username.to_string(), password.to_string())),
        _ => None,
    }
}
