use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use url::Url;

/// Stage of the sign-in chain an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthStage {
    MicrosoftSignIn,
    MicrosoftRefresh,
    XboxLive,
    Xsts,
    MinecraftLogin,
    Ownership,
    Profile,
}

impl fmt::Display for AuthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MicrosoftSignIn => "Microsoft sign-in",
            Self::MicrosoftRefresh => "Microsoft token refresh",
            Self::XboxLive => "Xbox Live authentication",
            Self::Xsts => "XSTS authorization",
            Self::MinecraftLogin => "Minecraft login",
            Self::Ownership => "Game ownership check",
            Self::Profile => "Profile fetch",
        })
    }
}

/// Authentication error types
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Sign-in was cancelled")]
    UserCancelled,

    #[error("The sign-in code expired or was cancelled, please retry")]
    ExpiredChallenge,

    #[error("Network error, check your internet connection: {0}")]
    Network(#[source] reqwest::Error),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("Identity provider rejected the request ({code}): {description}")]
    ProviderRejection { code: String, description: String },

    #[error("XSTS authorization denied: {0}")]
    Xsts(#[from] XstsError),

    #[error("This account does not own Minecraft")]
    OwnershipMissing,

    #[error("Minecraft profile not found - the account has no profile yet")]
    ProfileMissing,

    #[error("Token storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Chain integrity violated: {0}")]
    ChainIntegrity(String),

    #[error("No saved session to refresh")]
    NoSession,

    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Provider account handle unavailable for silent refresh")]
    AccountUnavailable,

    #[error("Redirect listener error: {0}")]
    Listener(#[source] std::io::Error),

    #[error("Invalid redirect or missing authorization code")]
    InvalidRedirect,

    #[error("OAuth state mismatch - possible CSRF attack")]
    StateMismatch,

    #[error("Automatic sign-in failed, sign in manually at {url}")]
    ManualSignInRequired {
        url: Url,
        device_code: Box<AuthError>,
        browser: Box<AuthError>,
    },

    #[error("{stage} failed: {source}")]
    Stage {
        stage: AuthStage,
        #[source]
        source: Box<AuthError>,
    },

    #[error("System random source unavailable: {0}")]
    Random(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err)
        }
    }
}

impl AuthError {
    /// Consume an unsuccessful response into an `Http` error
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::Http {
            status,
            body_snippet: body.chars().take(200).collect(),
        }
    }

    /// Wrap with the stage that produced the error
    pub fn at(self, stage: AuthStage) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through stage wrappers
    pub fn root(&self) -> &AuthError {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Outermost stage, if the error was wrapped
    pub fn stage(&self) -> Option<AuthStage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Machine-checkable cause code (the XSTS `XErr` value)
    pub fn cause_code(&self) -> Option<u64> {
        match self.root() {
            Self::Xsts(xsts) => Some(xsts.code()),
            _ => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self.root(), Self::Network(_))
    }

    /// Single readable message for the user, without stage diagnostics
    pub fn user_message(&self) -> String {
        match self.root() {
            Self::Xsts(xsts) => xsts.to_string(),
            Self::Http { status, .. } => format!("The sign-in service answered with {status}"),
            Self::ManualSignInRequired { url, .. } => format!(
                "Automatic sign-in failed. Open {url} in a browser and sign in manually."
            ),
            other => other.to_string(),
        }
    }
}

/// XSTS-specific error codes from XErr field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XstsError {
    #[error("This account is banned from Xbox (XErr: 2148916227)")]
    AccountBlocked,

    #[error(
        "This Microsoft account has no Xbox account, create one on xbox.com first (XErr: 2148916233)"
    )]
    NoXboxAccount,

    #[error("Xbox Live is not available in your country (XErr: 2148916235)")]
    RegionNotSupported,

    #[error("Adult verification required on the Xbox page (XErr: {0})")]
    AdultVerificationRequired(u64),

    #[error(
        "Child account must be added to a Family by an adult before signing in (XErr: 2148916238)"
    )]
    ChildAccountRequiresFamily,

    #[error("Unknown XSTS error code: {0}")]
    Unknown(u64),
}

impl XstsError {
    /// Parse XErr code from XSTS response
    pub fn from_xerr(code: u64) -> Self {
        match code {
            2148916227 => Self::AccountBlocked,
            2148916233 => Self::NoXboxAccount,
            2148916235 => Self::RegionNotSupported,
            2148916236 | 2148916237 => Self::AdultVerificationRequired(code),
            2148916238 => Self::ChildAccountRequiresFamily,
            code => Self::Unknown(code),
        }
    }

    /// Raw XErr value
    pub fn code(&self) -> u64 {
        match self {
            Self::AccountBlocked => 2148916227,
            Self::NoXboxAccount => 2148916233,
            Self::RegionNotSupported => 2148916235,
            Self::AdultVerificationRequired(code) => *code,
            Self::ChildAccountRequiresFamily => 2148916238,
            Self::Unknown(code) => *code,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
