use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::errors::{AuthError, Result};
use crate::session::AuthSession;

/// Persistence for the single sign-in session of an installation
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the saved session.
    ///
    /// Anything unreadable is reported as no session.
    async fn load(&self) -> Option<AuthSession>;

    /// Replace the saved session
    async fn save(&self, session: &AuthSession) -> Result<()>;

    /// Remove the saved session, succeeding when there is none
    async fn clear(&self) -> Result<()>;

    /// Whether `session` can be used without refreshing
    fn is_valid(&self, session: Option<&AuthSession>) -> bool {
        session.is_some_and(AuthSession::is_valid)
    }
}

/// In-memory token store for testing and embedding
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    session: Arc<RwLock<Option<AuthSession>>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `session`
    pub fn with_session(session: AuthSession) -> Self {
        Self {
            session: Arc::new(RwLock::new(Some(session))),
            saves: Arc::default(),
        }
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

fn poisoned() -> AuthError {
    AuthError::Storage {
        path: "<memory>".into(),
        source: anyhow::anyhow!("Lock poisoned"),
    }
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Option<AuthSession> {
        self.session.read().ok()?.clone()
    }

    async fn save(&self, session: &AuthSession) -> Result<()> {
        if !session.is_complete() {
            return Err(AuthError::ChainIntegrity(
                "refusing to persist an incomplete session".to_string(),
            ));
        }
        *self.session.write().map_err(|_| poisoned())? = Some(session.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.session.write().map_err(|_| poisoned())?.take();
        Ok(())
    }
}
