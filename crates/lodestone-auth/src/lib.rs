//! Microsoft account sign-in for Minecraft launchers
//!
//! This crate signs a player in through the Microsoft identity platform and
//! turns the result into a Minecraft session that can be persisted, reused
//! across launches and silently refreshed.
//!
//! # Authentication Flow
//!
//! 1. Microsoft OAuth2 device code flow, with a browser based authorization
//!    code flow (loopback redirect, PKCE) as fallback
//! 2. Xbox Live authentication
//! 3. XSTS authorization for Minecraft services
//! 4. Minecraft Services login
//! 5. Ownership check and profile retrieval
//!
//! [`AuthOrchestrator`] runs the whole chain, stores the resulting
//! [`AuthSession`] in a [`TokenStore`] and refreshes it before it expires.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lodestone_auth::{AuthConfig, AuthOrchestrator, FileTokenStore, SignInContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = FileTokenStore::new(FileTokenStore::default_storage_dir()?).await?;
//!     let auth = AuthOrchestrator::new(AuthConfig::default(), Arc::new(store))?;
//!
//!     let session = match auth.load_saved_auth().await {
//!         Some(session) => session,
//!         None => {
//!             let ctx = SignInContext::new().on_challenge(|challenge| {
//!                 println!("{}", challenge.message);
//!             });
//!             auth.authenticate(&ctx).await?
//!         }
//!     };
//!     println!("Logged in as: {}", session.profile.name);
//!     Ok(())
//! }
//! ```
//!
//! # Token Storage
//!
//! Sessions are kept by a [`TokenStore`]. [`FileTokenStore`] writes a single
//! `auth.json` in the platform data directory, [`MemoryTokenStore`] is meant
//! for tests and embedding.
//!
//! ```
//! use lodestone_auth::{AuthSession, McProfile, MemoryTokenStore, TokenStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = MemoryTokenStore::new();
//! let profile = McProfile {
//!     id: "069a79f444e94726a5befca90e38aaf5".to_string(),
//!     name: "Steve".to_string(),
//!     skins: vec![],
//!     capes: vec![],
//! };
//! let now = chrono::Utc::now();
//! let session = AuthSession::issue("mc_token".to_string(), None, profile, None, now)?;
//! store.save(&session).await?;
//!
//! let loaded = store.load().await;
//! assert!(store.is_valid(loaded.as_ref()));
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! # Important Notes
//!
//! - The default client id is the one of the official launcher, a
//!   distributed launcher needs its own approved Azure application
//! - Tokens are never logged, `Debug` output of sessions redacts them
//! - The Minecraft access token is treated as valid for 24 hours and is
//!   refreshed once less than an hour is left

pub mod browser;
pub mod client;
pub mod config;
pub mod device_code;
pub mod errors;
pub mod file_store;
pub mod flow;
pub mod minecraft;
pub mod models;
pub mod opener;
pub mod orchestrator;
pub mod pkce;
pub mod session;
pub mod store;
pub mod xbox;

// Re-export main types
pub use browser::BrowserAuthenticator;
pub use client::MicrosoftClient;
pub use config::{AuthConfig, Endpoints, HttpTimeouts};
pub use device_code::{DeviceCodeAuthenticator, DeviceCodeChallenge};
pub use errors::{AuthError, AuthStage, Result, XstsError};
pub use file_store::FileTokenStore;
pub use flow::{MicrosoftFlow, SignInContext};
pub use minecraft::{MinecraftIdentity, MinecraftToken};
pub use models::McProfile;
pub use opener::{SystemBrowser, UrlOpener};
pub use orchestrator::{AuthOrchestrator, AuthState};
pub use session::{AccountHandle, AuthSession, LaunchCredentials, MicrosoftGrant, MsTokens};
pub use store::{MemoryTokenStore, TokenStore};
pub use xbox::{XboxChain, XboxToken};
