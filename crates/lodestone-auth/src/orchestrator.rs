use std::sync::{Arc, PoisonError};

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::browser::BrowserAuthenticator;
use crate::client::MicrosoftClient;
use crate::config::AuthConfig;
use crate::device_code::DeviceCodeAuthenticator;
use crate::errors::{AuthError, AuthStage, Result};
use crate::flow::{MicrosoftFlow, SignInContext};
use crate::minecraft::MinecraftIdentity;
use crate::models::McProfile;
use crate::opener::{SystemBrowser, UrlOpener};
use crate::session::{AccountHandle, AuthSession, MicrosoftGrant};
use crate::store::TokenStore;
use crate::xbox::XboxChain;

/// Where the orchestrator currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    DeviceCodePending,
    BrowserAuthPending,
    XboxLiveAuth,
    XstsAuth,
    MinecraftAuth,
    OwnershipCheck,
    ProfileFetch,
    Refreshing,
    Authenticated,
    /// Readable reason of the last failure
    Failed(String),
}

/// Drives sign-in, silent refresh and logout over a [`TokenStore`].
///
/// Every public operation holds one in-flight lock for its whole duration,
/// so concurrent calls run one after the other.
pub struct AuthOrchestrator {
    store: Arc<dyn TokenStore>,
    device_code: Arc<dyn MicrosoftFlow>,
    browser: Arc<dyn MicrosoftFlow>,
    microsoft: MicrosoftClient,
    xbox: XboxChain,
    minecraft: MinecraftIdentity,
    in_flight: Mutex<()>,
    current_account: std::sync::Mutex<Option<AccountHandle>>,
    state: watch::Sender<AuthState>,
}

impl AuthOrchestrator {
    /// Orchestrator opening URLs in the system browser
    pub fn new(config: AuthConfig, store: Arc<dyn TokenStore>) -> Result<Self> {
        Self::with_opener(config, store, Arc::new(SystemBrowser))
    }

    pub fn with_opener(
        config: AuthConfig,
        store: Arc<dyn TokenStore>,
        opener: Arc<dyn UrlOpener>,
    ) -> Result<Self> {
        let http = config.http_client()?;
        let xbox = XboxChain::new(http.clone(), config.endpoints.clone());
        let minecraft = MinecraftIdentity::new(http.clone(), config.endpoints.clone());
        let microsoft = MicrosoftClient::with_http(config, http);

        Ok(Self {
            store,
            device_code: Arc::new(DeviceCodeAuthenticator::new(
                microsoft.clone(),
                Arc::clone(&opener),
            )),
            browser: Arc::new(BrowserAuthenticator::new(microsoft.clone(), opener)),
            microsoft,
            xbox,
            minecraft,
            in_flight: Mutex::new(()),
            current_account: std::sync::Mutex::new(None),
            state: watch::Sender::new(AuthState::Idle),
        })
    }

    /// Replace the interactive Microsoft flows
    pub fn with_flows(
        mut self,
        device_code: Arc<dyn MicrosoftFlow>,
        browser: Arc<dyn MicrosoftFlow>,
    ) -> Self {
        self.device_code = device_code;
        self.browser = browser;
        self
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Watch state changes, e.g. to drive a login window
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Provider account of the active session, if any
    pub fn current_account(&self) -> Option<AccountHandle> {
        self.current_account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Interactive sign-in through the full chain; the new session is persisted
    #[instrument(skip_all)]
    pub async fn authenticate(&self, ctx: &SignInContext) -> Result<AuthSession> {
        let _guard = self.in_flight.lock().await;

        let result = self.authenticate_locked(ctx).await;
        self.finish(&result);
        result
    }

    /// Saved session ready for launch, refreshing it when close to expiry.
    ///
    /// Returns `None` when the caller has to run [`Self::authenticate`].
    #[instrument(skip_all)]
    pub async fn load_saved_auth(&self) -> Option<AuthSession> {
        let _guard = self.in_flight.lock().await;

        let Some(session) = self.store.load().await else {
            debug!("No saved session");
            return None;
        };

        if self.store.is_valid(Some(&session)) {
            info!(
                "Using saved session for {}, {} minutes left",
                session.profile.name,
                session.time_remaining(Utc::now()).num_minutes()
            );
            self.remember(session.account.clone());
            self.set_state(AuthState::Authenticated);
            return Some(session);
        }

        info!("Saved session is about to expire, refreshing");
        let result = self.refresh_locked(Some(session)).await;
        self.finish(&result);
        match result {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Silent refresh failed, sign-in required: {}", e);
                if let Err(e) = self.store.clear().await {
                    warn!("Failed to clear the stale session: {}", e);
                }
                self.remember(None);
                self.set_state(AuthState::Idle);
                None
            }
        }
    }

    /// Mint a new session from the saved refresh token without user interaction
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<AuthSession> {
        let _guard = self.in_flight.lock().await;

        let stored = self.store.load().await;
        let result = self.refresh_locked(stored).await;
        self.finish(&result);
        result
    }

    /// Forget the provider account and remove the saved session
    #[instrument(skip_all)]
    pub async fn logout(&self) -> Result<()> {
        let _guard = self.in_flight.lock().await;

        if let Some(account) = self
            .current_account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            debug!("Dropped provider account {}", account.home_account_id);
        }
        self.store.clear().await?;
        self.set_state(AuthState::Idle);

        info!("Logged out");
        Ok(())
    }

    async fn authenticate_locked(&self, ctx: &SignInContext) -> Result<AuthSession> {
        let grant = self.sign_in_microsoft(ctx).await?;

        let session = self
            .complete_chain(
                &grant.tokens.access_token,
                grant.tokens.refresh_token.clone(),
                None,
                grant.account.clone(),
            )
            .await?;

        self.remember(Some(grant.account));
        self.persist(&session).await;
        info!("Signed in as {}", session.profile.name);
        Ok(session)
    }

    /// Device code first, the browser once if that fails, then manual instructions
    async fn sign_in_microsoft(&self, ctx: &SignInContext) -> Result<MicrosoftGrant> {
        self.set_state(AuthState::DeviceCodePending);
        let device_code_err = match self.device_code.authenticate(ctx).await {
            Ok(grant) => return Ok(grant),
            Err(e) => e,
        };
        warn!("{} sign-in failed: {}", self.device_code.name(), device_code_err);

        if ctx.is_cancelled() {
            return Err(AuthError::UserCancelled.at(AuthStage::MicrosoftSignIn));
        }

        self.set_state(AuthState::BrowserAuthPending);
        let browser_err = match self.browser.authenticate(ctx).await {
            Ok(grant) => return Ok(grant),
            Err(e) => e,
        };
        warn!("{} sign-in failed: {}", self.browser.name(), browser_err);

        if ctx.is_cancelled() {
            return Err(AuthError::UserCancelled.at(AuthStage::MicrosoftSignIn));
        }

        Err(AuthError::ManualSignInRequired {
            url: self.microsoft.manual_sign_in_url(),
            device_code: Box::new(device_code_err),
            browser: Box::new(browser_err),
        }
        .at(AuthStage::MicrosoftSignIn))
    }

    async fn refresh_locked(&self, stored: Option<AuthSession>) -> Result<AuthSession> {
        let session = stored.ok_or(AuthError::NoSession)?;
        let refresh_token = session
            .refresh_token()
            .ok_or_else(|| AuthError::MissingRefreshToken.at(AuthStage::MicrosoftRefresh))?;
        let account = self
            .usable_account(&session)
            .ok_or_else(|| AuthError::AccountUnavailable.at(AuthStage::MicrosoftRefresh))?;

        self.set_state(AuthState::Refreshing);
        let tokens = self
            .microsoft
            .refresh(refresh_token, &account)
            .await
            .map_err(|e| e.at(AuthStage::MicrosoftRefresh))?;

        // Keep the old refresh token unless the provider rotated it
        let refresh_token = tokens
            .refresh_token
            .clone()
            .or_else(|| session.refresh_token.clone());

        let refreshed = self
            .complete_chain(
                &tokens.access_token,
                refresh_token,
                Some(session.profile),
                account.clone(),
            )
            .await?;

        self.remember(Some(account));
        self.persist(&refreshed).await;
        info!("Refreshed session for {}", refreshed.profile.name);
        Ok(refreshed)
    }

    /// Xbox Live, XSTS, Minecraft login, ownership and profile, strictly in order
    async fn complete_chain(
        &self,
        ms_access_token: &str,
        refresh_token: Option<String>,
        known_profile: Option<McProfile>,
        account: AccountHandle,
    ) -> Result<AuthSession> {
        self.set_state(AuthState::XboxLiveAuth);
        let xbl = self
            .xbox
            .sign_in_xbox_live(ms_access_token)
            .await
            .map_err(|e| e.at(AuthStage::XboxLive))?;

        self.set_state(AuthState::XstsAuth);
        let xsts = self
            .xbox
            .get_xsts_token(&xbl)
            .await
            .map_err(|e| e.at(AuthStage::Xsts))?;

        self.set_state(AuthState::MinecraftAuth);
        let mc = self
            .minecraft
            .login_with_xbox(&xsts.token, &xsts.user_hash)
            .await
            .map_err(|e| e.at(AuthStage::MinecraftLogin))?;

        self.set_state(AuthState::OwnershipCheck);
        let owned = self
            .minecraft
            .check_ownership(&mc.access_token)
            .await
            .map_err(|e| e.at(AuthStage::Ownership))?;
        if !owned {
            return Err(AuthError::OwnershipMissing.at(AuthStage::Ownership));
        }

        let profile = match known_profile {
            Some(profile) => profile,
            None => {
                self.set_state(AuthState::ProfileFetch);
                self.minecraft
                    .get_profile(&mc.access_token)
                    .await
                    .map_err(|e| e.at(AuthStage::Profile))?
            }
        };

        AuthSession::issue(
            mc.access_token,
            refresh_token,
            profile,
            Some(account),
            Utc::now(),
        )
    }

    /// Account handle for silent refresh, only if it belongs to this client
    fn usable_account(&self, session: &AuthSession) -> Option<AccountHandle> {
        let config = self.microsoft.config();
        session
            .account
            .clone()
            .or_else(|| self.current_account())
            .filter(|account| account.belongs_to(&config.client_id, &config.authority))
    }

    /// A session that cannot be saved is still usable for this run
    async fn persist(&self, session: &AuthSession) {
        if let Err(e) = self.store.save(session).await {
            error!("Failed to save session: {}", e);
        }
    }

    fn remember(&self, account: Option<AccountHandle>) {
        *self
            .current_account
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = account;
    }

    fn set_state(&self, state: AuthState) {
        debug!("Auth state: {:?}", state);
        self.state.send_replace(state);
    }

    fn finish(&self, result: &Result<AuthSession>) {
        match result {
            Ok(_) => self.set_state(AuthState::Authenticated),
            Err(e) => {
                error!("Authentication failed: {}", e);
                self.set_state(AuthState::Failed(e.user_message()));
            }
        }
    }
}

impl std::fmt::Debug for AuthOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthOrchestrator")
            .field("device_code", &self.device_code.name())
            .field("browser", &self.browser.name())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}
