use std::time::Duration;
use url::Url;

use crate::errors::Result;

/// Microsoft, Xbox Live and Minecraft Services endpoints
pub mod endpoints {
    pub const MS_AUTHORITY: &str = "https://login.microsoftonline.com/consumers";
    pub const MS_DEVICE_CODE: &str =
        "https://login.microsoftonline.com/consumers/oauth2/v2.0/devicecode";
    pub const MS_AUTHORIZE: &str =
        "https://login.microsoftonline.com/consumers/oauth2/v2.0/authorize";
    pub const MS_TOKEN: &str = "https://login.microsoftonline.com/consumers/oauth2/v2.0/token";
    pub const XBL_AUTHENTICATE: &str = "https://user.auth.xboxlive.com/user/authenticate";
    pub const XSTS_AUTHORIZE: &str = "https://xsts.auth.xboxlive.com/xsts/authorize";
    pub const MC_LOGIN: &str = "https://api.minecraftservices.com/authentication/login_with_xbox";
    pub const MC_ENTITLEMENTS: &str = "https://api.minecraftservices.com/entitlements/mcstore";
    pub const MC_PROFILE: &str = "https://api.minecraftservices.com/minecraft/profile";
}

/// Azure application registered for the launcher
pub const CLIENT_ID: &str = "54fd49e4-2103-4044-9603-2b028c814ec3";

/// Xbox Live sign-in plus a refresh token for silent refresh
pub const SCOPES: &[&str] = &["XboxLive.signin", "offline_access"];

/// Relying parties
pub const RP_XBOXLIVE_AUTH: &str = "http://auth.xboxlive.com";
pub const RP_MINECRAFT: &str = "rp://api.minecraftservices.com/";

/// Loopback port used as the redirect target of the browser flow
pub const REDIRECT_PORT: u16 = 53682;

/// Lifetime assumed for every Minecraft access token, counted from issuance.
///
/// The `expires_in` returned by Minecraft Services is deliberately ignored.
pub const MINECRAFT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A session with this much time (or less) left is no longer valid and
/// goes through refresh instead.
pub const VALIDITY_MARGIN: Duration = Duration::from_secs(60 * 60);

/// Version written into every persisted session
pub const SCHEMA_VERSION: u32 = 1;

/// Endpoint set used by the authentication chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub device_code: Url,
    pub authorize: Url,
    pub token: Url,
    pub xbl_authenticate: Url,
    pub xsts_authorize: Url,
    pub mc_login: Url,
    pub mc_entitlements: Url,
    pub mc_profile: Url,
}

impl Endpoints {
    /// Place every endpoint under `base`, keeping the production paths.
    ///
    /// Meant for pointing the whole chain at a single mock server.
    pub fn rooted_at(base: &str) -> Result<Self> {
        let base = Url::parse(base)?;
        Ok(Self {
            device_code: base.join("consumers/oauth2/v2.0/devicecode")?,
            authorize: base.join("consumers/oauth2/v2.0/authorize")?,
            token: base.join("consumers/oauth2/v2.0/token")?,
            xbl_authenticate: base.join("user/authenticate")?,
            xsts_authorize: base.join("xsts/authorize")?,
            mc_login: base.join("authentication/login_with_xbox")?,
            mc_entitlements: base.join("entitlements/mcstore")?,
            mc_profile: base.join("minecraft/profile")?,
        })
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        let parse = |url: &str| Url::parse(url).expect("valid endpoint URL");
        Self {
            device_code: parse(endpoints::MS_DEVICE_CODE),
            authorize: parse(endpoints::MS_AUTHORIZE),
            token: parse(endpoints::MS_TOKEN),
            xbl_authenticate: parse(endpoints::XBL_AUTHENTICATE),
            xsts_authorize: parse(endpoints::XSTS_AUTHORIZE),
            mc_login: parse(endpoints::MC_LOGIN),
            mc_entitlements: parse(endpoints::MC_ENTITLEMENTS),
            mc_profile: parse(endpoints::MC_PROFILE),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Configuration shared by every stage of the chain
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// OAuth client ID of the Azure application
    pub client_id: String,

    /// Identity provider authority; recorded in account handles
    pub authority: String,

    /// Requested scopes
    pub scopes: Vec<String>,

    /// Loopback port for the browser flow redirect (0 picks a free port)
    pub redirect_port: u16,

    /// How long the browser flow waits for the redirect
    pub browser_timeout: Duration,

    pub endpoints: Endpoints,

    /// HTTP client timeouts
    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,
}

impl AuthConfig {
    /// Configuration talking to a single base URL, see [`Endpoints::rooted_at`].
    pub fn rooted_at(base: &str) -> Result<Self> {
        let endpoints = Endpoints::rooted_at(base)?;
        let authority = Url::parse(base)?.join("consumers")?.to_string();
        Ok(Self {
            authority,
            endpoints,
            ..Self::default()
        })
    }

    /// Space separated scope string as sent to the provider
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// Build the HTTP client every stage uses
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let http = reqwest::Client::builder()
            .connect_timeout(self.http_timeouts.connect)
            .timeout(self.http_timeouts.request)
            .user_agent(self.user_agent.as_deref().unwrap_or("lodestone"))
            .build()?;
        Ok(http)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: CLIENT_ID.to_string(),
            authority: endpoints::MS_AUTHORITY.to_string(),
            scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
            redirect_port: REDIRECT_PORT,
            browser_timeout: Duration::from_secs(300),
            endpoints: Endpoints::default(),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("lodestone".to_string()),
        }
    }
}
