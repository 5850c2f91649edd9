use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::client::{DevicePoll, MicrosoftClient, PendingDeviceCode};
use crate::errors::{AuthError, Result};
use crate::flow::{MicrosoftFlow, SignInContext};
use crate::opener::{UrlOpener, open_or_warn};
use crate::session::{MicrosoftGrant, MsTokens};

/// Added to the poll interval every time the provider asks to slow down
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Cap on how long a device code is waited for, whatever the provider says
const MAX_CHALLENGE_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// What the user needs to complete a device code sign-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCodeChallenge {
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub message: String,
    pub expires_in_seconds: u64,
}

impl DeviceCodeChallenge {
    /// URL to open for the user, prefilled with the code when possible
    pub fn browser_url(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }
}

/// Microsoft OAuth2 device code flow
#[derive(Debug, Clone)]
pub struct DeviceCodeAuthenticator {
    client: MicrosoftClient,
    opener: Arc<dyn UrlOpener>,
}

impl DeviceCodeAuthenticator {
    pub fn new(client: MicrosoftClient, opener: Arc<dyn UrlOpener>) -> Self {
        Self { client, opener }
    }

    async fn wait_for_grant(&self, pending: &PendingDeviceCode) -> Result<MsTokens> {
        let mut interval = pending.interval;
        loop {
            tokio::time::sleep(interval).await;
            match self.client.poll_device_token(&pending.device_code).await? {
                DevicePoll::Pending => debug!("Waiting for the user to enter the code"),
                DevicePoll::SlowDown => {
                    interval += SLOW_DOWN_STEP;
                    debug!("Provider asked to slow down, polling every {:?}", interval);
                }
                DevicePoll::Granted(tokens) => return Ok(tokens),
            }
        }
    }
}

#[async_trait::async_trait]
impl MicrosoftFlow for DeviceCodeAuthenticator {
    fn name(&self) -> &'static str {
        "device code"
    }

    #[instrument(skip_all)]
    async fn authenticate(&self, ctx: &SignInContext) -> Result<MicrosoftGrant> {
        if ctx.is_cancelled() {
            return Err(AuthError::UserCancelled);
        }

        let pending = self.client.request_device_code().await?;
        info!(
            "Device code issued, enter {} at {}",
            pending.challenge.user_code, pending.challenge.verification_uri
        );
        ctx.notify(&pending.challenge);

        let opener = Arc::clone(&self.opener);
        let url = pending.challenge.browser_url().to_string();
        tokio::task::spawn_blocking(move || open_or_warn(opener.as_ref(), &url));

        let lifetime =
            Duration::from_secs(pending.challenge.expires_in_seconds).min(MAX_CHALLENGE_LIFETIME);
        let deadline = Instant::now() + lifetime;
        let tokens = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                info!("Device code sign-in cancelled");
                return Err(AuthError::UserCancelled);
            }
            result = tokio::time::timeout_at(deadline, self.wait_for_grant(&pending)) => {
                match result {
                    Ok(tokens) => tokens?,
                    Err(_) => {
                        warn!("Device code expired before the sign-in was completed");
                        return Err(AuthError::ExpiredChallenge);
                    }
                }
            }
        };

        info!("Device code sign-in completed");
        Ok(MicrosoftGrant {
            tokens,
            account: self.client.new_account()?,
        })
    }
}
