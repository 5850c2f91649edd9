use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::device_code::DeviceCodeChallenge;
use crate::errors::Result;
use crate::session::MicrosoftGrant;

/// Receives the device code challenge so the UI can display it
pub type ChallengeCallback = Arc<dyn Fn(&DeviceCodeChallenge) + Send + Sync>;

/// Per-attempt inputs of an interactive sign-in
#[derive(Clone, Default)]
pub struct SignInContext {
    on_challenge: Option<ChallengeCallback>,
    cancel: CancellationToken,
}

impl SignInContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the provider hands out a device code
    pub fn on_challenge<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DeviceCodeChallenge) + Send + Sync + 'static,
    {
        self.on_challenge = Some(Arc::new(callback));
        self
    }

    /// Use a token the UI cancels when the login window is closed
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn notify(&self, challenge: &DeviceCodeChallenge) {
        if let Some(callback) = &self.on_challenge {
            callback(challenge);
        }
    }
}

impl fmt::Debug for SignInContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInContext")
            .field("on_challenge", &self.on_challenge.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// An interactive way of obtaining Microsoft tokens
#[async_trait::async_trait]
pub trait MicrosoftFlow: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self, ctx: &SignInContext) -> Result<MicrosoftGrant>;
}
