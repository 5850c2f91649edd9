use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{MINECRAFT_TOKEN_TTL, SCHEMA_VERSION, VALIDITY_MARGIN};
use crate::errors::{AuthError, Result};
use crate::models::McProfile;
use crate::pkce;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

fn to_chrono(duration: std::time::Duration, fallback: chrono::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(fallback)
}

/// The persisted sign-in record.
///
/// Either every field is populated and consistent, or there is no session
/// at all. Build it with [`AuthSession::issue`], which refuses partial data.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Minecraft bearer token
    pub access_token: String,
    /// Microsoft refresh token
    pub refresh_token: Option<String>,
    pub profile: McProfile,
    #[serde(default)]
    pub account: Option<AccountHandle>,
    pub expires_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

impl AuthSession {
    /// Build a session for a Minecraft token issued at `now`.
    ///
    /// Expiry is always `now + MINECRAFT_TOKEN_TTL`.
    pub fn issue(
        access_token: String,
        refresh_token: Option<String>,
        profile: McProfile,
        account: Option<AccountHandle>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let session = Self {
            schema_version: SCHEMA_VERSION,
            access_token,
            refresh_token,
            profile,
            account,
            expires_at: now + to_chrono(MINECRAFT_TOKEN_TTL, chrono::Duration::hours(24)),
            saved_at: now,
        };

        if !session.is_complete() {
            return Err(AuthError::ChainIntegrity(
                "refusing to build a session with missing fields".to_string(),
            ));
        }

        Ok(session)
    }

    /// All mandatory fields are present
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty()
            && !self.profile.id.is_empty()
            && !self.profile.name.is_empty()
            && self.refresh_token.as_deref().is_none_or(|t| !t.is_empty())
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }

    /// Valid only while more than [`VALIDITY_MARGIN`] remains, so refresh
    /// happens before the token actually runs out.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.time_remaining(now) > to_chrono(VALIDITY_MARGIN, chrono::Duration::hours(1))
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Usable refresh token, if any
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Parameters the process launcher needs
    pub fn launch_credentials(&self) -> LaunchCredentials<'_> {
        LaunchCredentials {
            access_token: &self.access_token,
            username: &self.profile.name,
            uuid: &self.profile.id,
        }
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("schema_version", &self.schema_version)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("profile", &self.profile)
            .field("account", &self.account)
            .field("expires_at", &self.expires_at)
            .field("saved_at", &self.saved_at)
            .finish()
    }
}

/// Borrowed launch parameters of a session
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LaunchCredentials<'a> {
    pub access_token: &'a str,
    pub username: &'a str,
    pub uuid: &'a str,
}

impl fmt::Debug for LaunchCredentials<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchCredentials")
            .field("access_token", &"[REDACTED]")
            .field("username", &self.username)
            .field("uuid", &self.uuid)
            .finish()
    }
}

/// Identity-provider account a session was obtained with.
///
/// Persisted with the session; silent refresh only accepts a handle issued
/// for the same client and authority.
///
/// `home_account_id` is a random id generated locally when the handle is
/// created. It is not the provider's account id and carries no identity:
/// refresh correlates a handle by client id and authority only, and the
/// refresh token itself decides which Microsoft account is signed in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountHandle {
    pub home_account_id: String,
    pub client_id: String,
    pub authority: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl AccountHandle {
    pub fn new(client_id: &str, authority: &str) -> Result<Self> {
        Ok(Self {
            home_account_id: pkce::generate_account_id()?,
            client_id: client_id.to_string(),
            authority: authority.to_string(),
            username: None,
        })
    }

    pub fn belongs_to(&self, client_id: &str, authority: &str) -> bool {
        !self.home_account_id.is_empty()
            && self.client_id.eq_ignore_ascii_case(client_id)
            && self.authority.trim_end_matches('/') == authority.trim_end_matches('/')
    }
}

/// Microsoft OAuth tokens
#[derive(Clone, PartialEq, Eq)]
pub struct MsTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl MsTokens {
    pub fn new(access_token: String, refresh_token: Option<String>) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }
}

impl fmt::Debug for MsTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsTokens")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Result of a Microsoft-layer sign-in
#[derive(Debug, Clone)]
pub struct MicrosoftGrant {
    pub tokens: MsTokens,
    pub account: AccountHandle,
}
