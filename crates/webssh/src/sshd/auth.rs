//! Credential lookup for the embedded daemon.
//!
//! The daemon owns no user storage. It asks a [`CredentialLookup`] whether
//! a password matches and which public keys are authorized, then decides
//! accept or deny itself. Remote clients only ever see a plain denial.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::AuthFailure;

/// Default pause before answering a rejected attempt, in milliseconds.
pub const DEFAULT_AUTH_REJECTION_DELAY_MS: u64 = 100;

/// Default number of attempts before the connection is dropped.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 6;

/// Outcome of a password lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordLookup {
    /// Label for the authenticated principal, if the user exists.
    pub identity: Option<String>,
    /// The user exists and the secret matches.
    pub ok: bool,
    /// The account's expiry has passed.
    pub expired: bool,
    /// The account is switched off.
    pub disabled: bool,
}

impl PasswordLookup {
    /// Turns the lookup into an identity or the reason for denial.
    ///
    /// A wrong secret is reported before account state so a guesser learns
    /// nothing about accounts it cannot unlock.
    pub fn verdict(&self, username: &str) -> Result<String, AuthFailure> {
        if !self.ok {
            Err(AuthFailure::BadCredential)
        } else if self.disabled {
            Err(AuthFailure::Disabled)
        } else if self.expired {
            Err(AuthFailure::Expired)
        } else {
            Ok(self
                .identity
                .clone()
                .unwrap_or_else(|| username.to_string()))
        }
    }
}

/// Source of credentials for inbound SSH authentication.
///
/// Implementations must be safe for concurrent reads.
#[async_trait]
pub trait CredentialLookup: Send + Sync {
    /// Checks `secret` for `username`.
    async fn by_password(&self, username: &str, secret: &str) -> PasswordLookup;

    /// Current authorized keys, keyed by SSH wire-format public key bytes,
    /// with the key's comment as value.
    async fn authorized_keys(&self) -> HashMap<Vec<u8>, String>;
}

/// A stored user record.
#[derive(Clone)]
pub struct CredentialRecord {
    pub username: String,
    /// Plain secret. `None` disables password login for this user.
    pub secret: Option<String>,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    /// Label reported on success. Defaults to the username.
    pub identity: Option<String>,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("enabled", &self.enabled)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl CredentialRecord {
    /// An enabled, non-expiring password user.
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Some(secret.into()),
            enabled: true,
            expires_at: None,
            identity: None,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Compares two byte strings without short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// In-memory credentials.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, CredentialRecord>,
    keys: HashMap<Vec<u8>, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an enabled password user.
    pub fn with_user(self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.with_record(CredentialRecord::new(username, secret))
    }

    pub fn with_record(mut self, record: CredentialRecord) -> Self {
        self.users.insert(record.username.clone(), record);
        self
    }

    /// Adds one authorized key by its wire-format bytes.
    pub fn with_key(mut self, key_bytes: Vec<u8>, comment: impl Into<String>) -> Self {
        self.keys.insert(key_bytes, comment.into());
        self
    }

    /// Adds every key in OpenSSH `authorized_keys` text.
    pub fn with_authorized_keys(mut self, content: &str) -> Self {
        for key in parse_authorized_keys(content) {
            let comment = key.comment.unwrap_or_default();
            self.keys.insert(key.key_bytes, comment);
        }
        self
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

#[async_trait]
impl CredentialLookup for StaticCredentials {
    async fn by_password(&self, username: &str, secret: &str) -> PasswordLookup {
        let Some(record) = self.users.get(username) else {
            return PasswordLookup::default();
        };
        let ok = record
            .secret
            .as_deref()
            .is_some_and(|stored| constant_time_eq(stored.as_bytes(), secret.as_bytes()));

        PasswordLookup {
            identity: Some(
                record
                    .identity
                    .clone()
                    .unwrap_or_else(|| record.username.clone()),
            ),
            ok,
            expired: record.is_expired_at(Utc::now()),
            disabled: !record.enabled,
        }
    }

    async fn authorized_keys(&self) -> HashMap<Vec<u8>, String> {
        self.keys.clone()
    }
}

// -----------------------------------------------------------------------------
// authorized_keys parsing
// -----------------------------------------------------------------------------

/// Key types recognized in `authorized_keys` lines.
const KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "ssh-dss",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// A key parsed from an `authorized_keys` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    pub key_type: String,
    /// Decoded SSH wire-format key.
    pub key_bytes: Vec<u8>,
    pub comment: Option<String>,
    /// Leading options such as `no-pty`.
    pub options: Vec<String>,
}

/// Parses OpenSSH `authorized_keys` content.
///
/// Each line is `[options] key-type base64-data [comment]`. Blank lines,
/// `#` comments, and lines that fail to parse are skipped.
pub fn parse_authorized_keys(content: &str) -> Vec<AuthorizedKey> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let parsed = parse_line(line);
            if parsed.is_none() {
                debug!(line = %line, "Skipping unparseable authorized_keys line");
            }
            parsed
        })
        .collect()
}

fn parse_line(line: &str) -> Option<AuthorizedKey> {
    let (first, rest) = split_word(line);
    let (options, key_type, rest) = if KEY_TYPES.contains(&first) {
        (Vec::new(), first, rest)
    } else {
        let (key_type, rest) = split_word(rest);
        if !KEY_TYPES.contains(&key_type) {
            return None;
        }
        let options = first.split(',').map(str::to_string).collect();
        (options, key_type, rest)
    };

    let (data, comment) = split_word(rest);
    if data.is_empty() {
        return None;
    }
    let key_bytes = STANDARD.decode(data).ok()?;
    let comment = (!comment.is_empty()).then(|| comment.to_string());

    Some(AuthorizedKey {
        key_type: key_type.to_string(),
        key_bytes,
        comment,
        options,
    })
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim()),
        None => (s, ""),
    }
}
