use chrono::{DateTime, Utc};

use crate::{
    error::{AppErr, AppResult},
    model::Room,
    utils::digest::{digest_eq, sha256_hex},
};

/// Shared-secret check guarding a room's comments. Holds only the digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordGate {
    digest:     Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl PasswordGate {
    pub fn new(digest: Option<String>, updated_at: Option<DateTime<Utc>>) -> Self {
        Self { digest, updated_at }
    }

    pub fn for_room(room: &Room) -> Self {
        Self::new(room.password_hash.clone(), room.password_updated_at)
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn set_secret(&mut self, plaintext: &str) -> AppResult<()> {
        if plaintext.is_empty() {
            return Err(AppErr::Invalid("password is required".into()));
        }
        self.digest = Some(sha256_hex(plaintext));
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// No digest means no gate.
    pub fn challenge(&self, plaintext: &str) -> bool {
        match &self.digest {
            Some(stored) => digest_eq(&sha256_hex(plaintext), stored),
            None         => true,
        }
    }

    /// Returns the visibility to write. Closing never needs the secret.
    pub fn toggle_visibility(&self, requested_open: bool, plaintext: Option<&str>) -> AppResult<bool> {
        if !requested_open || self.digest.is_none() {
            return Ok(requested_open);
        }
        match plaintext {
            Some(p) if self.challenge(p) => Ok(true),
            _ => Err(AppErr::Denied),
        }
    }

    /// Destructive actions need a stored digest and a matching secret.
    pub fn authorize_destructive(&self, plaintext: &str) -> AppResult<()> {
        match &self.digest {
            Some(stored) if digest_eq(&sha256_hex(plaintext), stored) => Ok(()),
            _ => Err(AppErr::Denied),
        }
    }
}
