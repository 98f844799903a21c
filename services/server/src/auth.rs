//! Guest-token verification.
//!
//! Stand-in for the platform's JWT verifier: a token of the form
//! `guest:<username>` yields a stable guest identity derived from the
//! username hash. Anything else is rejected.

use async_trait::async_trait;
use mp_core::collab::{AuthClaims, AuthProvider};
use sha2::{Digest, Sha256};

const MAX_USERNAME_LEN: usize = 32;

pub struct GuestAuth;

fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_USERNAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl AuthProvider for GuestAuth {
    async fn verify_access_token(&self, token: &str) -> Option<AuthClaims> {
        let username = token.strip_prefix("guest:")?.trim();
        if !valid_username(username) {
            return None;
        }
        let digest = Sha256::digest(username.as_bytes());
        Some(AuthClaims {
            user_id: format!("g-{}", hex::encode(&digest[..6])),
            username: username.to_owned(),
            is_guest: true,
        })
    }
}
