use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SCHEMA_VERSION;
use crate::errors::{AuthError, Result};
use crate::session::AuthSession;
use crate::store::TokenStore;

const SESSION_FILE: &str = "auth.json";
const LOCK_FILE: &str = "auth.lock";

/// File-based token store
///
/// Keeps the session as plain JSON in a single file and relies on file
/// permissions for confidentiality.
///
/// # Directory Structure
/// ```text
/// <data dir>/lodestone/
/// ├── auth.json      # The saved session
/// └── auth.lock      # Advisory lock between launcher processes
/// ```
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    lock_file: PathBuf,
    /// Serializes writers inside this process
    write_guard: Mutex<()>,
}

impl FileTokenStore {
    /// Open (and create if needed) a store in `storage_dir`
    pub async fn new(storage_dir: impl AsRef<Path>) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();

        prepare_dir(&storage_dir)
            .await
            .map_err(|source| AuthError::Storage {
                path: storage_dir.clone(),
                source,
            })?;

        Ok(Self {
            path: storage_dir.join(SESSION_FILE),
            lock_file: storage_dir.join(LOCK_FILE),
            write_guard: Mutex::new(()),
        })
    }

    /// Get default storage directory for the current platform
    pub fn default_storage_dir() -> Result<PathBuf> {
        let project_dirs = directories::ProjectDirs::from("", "", "lodestone").ok_or_else(|| {
            AuthError::Storage {
                path: PathBuf::new(),
                source: anyhow::anyhow!("Could not determine the data directory"),
            }
        })?;

        Ok(project_dirs.data_dir().to_path_buf())
    }

    /// Location of the session file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, source: anyhow::Error) -> AuthError {
        AuthError::Storage {
            path: self.path.clone(),
            source,
        }
    }

    /// Take the cross-process lock; released when the file is dropped
    fn acquire_lock(&self) -> anyhow::Result<std::fs::File> {
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)
            .with_context(|| format!("Failed to open lock file {}", self.lock_file.display()))?;

        lock_file
            .try_lock_exclusive()
            .context("Token store is locked by another launcher process")?;

        Ok(lock_file)
    }

    /// Read the session, distinguishing "absent" from "unreadable"
    async fn read_session(&self) -> anyhow::Result<Option<AuthSession>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read session file"),
        };

        let value: serde_json::Value =
            serde_json::from_str(&content).context("Session file is not valid JSON")?;

        let version = value
            .get("schemaVersion")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(u64::from(SCHEMA_VERSION));
        if version > u64::from(SCHEMA_VERSION) {
            warn!(
                "Session file has schema version {} (supported: {}), ignoring it",
                version, SCHEMA_VERSION
            );
            return Ok(None);
        }

        let session: AuthSession =
            serde_json::from_value(value).context("Session file has an invalid shape")?;

        if !session.is_complete() {
            warn!("Saved session is incomplete, ignoring it");
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Write to a temp file, fsync, then rename over the old session
    async fn write_atomically(&self, session: &AuthSession) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(session).context("Failed to serialize session")?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        file.write_all(&json)
            .await
            .context("Failed to write session")?;
        file.sync_all().await.context("Failed to sync session")?;
        drop(file);

        // Set secure permissions (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .await
                .context("Failed to restrict session file permissions")?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e).context("Failed to replace session file");
        }

        Ok(())
    }
}

async fn prepare_dir(dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir)
        .await
        .context("Failed to create storage directory")?;

    // Set secure permissions (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to restrict storage directory permissions")?;
    }

    Ok(())
}

#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Option<AuthSession> {
        match self.read_session().await {
            Ok(Some(session)) => {
                debug!("Loaded saved session for {}", session.profile.name);
                Some(session)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring saved session at {}: {:#}", self.path.display(), e);
                None
            }
        }
    }

    async fn save(&self, session: &AuthSession) -> Result<()> {
        if !session.is_complete() {
            return Err(AuthError::ChainIntegrity(
                "refusing to persist an incomplete session".to_string(),
            ));
        }

        let _guard = self.write_guard.lock().await;
        let _lock = self.acquire_lock().map_err(|e| self.storage_error(e))?;

        self.write_atomically(session)
            .await
            .map_err(|e| self.storage_error(e))?;

        info!("Saved session for {}", session.profile.name);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let _lock = self.acquire_lock().map_err(|e| self.storage_error(e))?;

        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Removed saved session");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.storage_error(
                anyhow::Error::new(e).context("Failed to remove session file"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fixtures::session_expiring_in;
    use tempfile::TempDir;

    async fn create_test_store() -> (FileTokenStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(temp_dir.path()).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store().await;
        assert!(store.load().await.is_none());

        let session = session_expiring_in(chrono::Duration::hours(23));
        store.save(&session).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.expires_at, session.expires_at);
        assert!(store.is_valid(Some(&loaded)));
    }

    #[tokio::test]
    async fn test_file_is_camel_case_json() {
        let (store, _temp) = create_test_store().await;
        store
            .save(&session_expiring_in(chrono::Duration::hours(23)))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["schemaVersion"], 1);
        assert_eq!(value["accessToken"], "mc_token");
        assert_eq!(value["refreshToken"], "refresh");
        assert_eq!(value["profile"]["name"], "Steve");
        assert!(value["expiresAt"].is_string());
        assert!(value["savedAt"].is_string());
    }

    #[tokio::test]
    async fn test_save_overwrites_without_leftovers() {
        let (store, temp) = create_test_store().await;
        store
            .save(&session_expiring_in(chrono::Duration::hours(2)))
            .await
            .unwrap();

        let mut newer = session_expiring_in(chrono::Duration::hours(24));
        newer.access_token = "newer".to_string();
        store.save(&newer).await.unwrap();

        assert_eq!(store.load().await.unwrap().access_token, "newer");

        let names: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{names:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (store, temp) = create_test_store().await;
        store
            .save(&session_expiring_in(chrono::Duration::hours(23)))
            .await
            .unwrap();

        let dir_mode = std::fs::metadata(temp.path()).unwrap().permissions().mode();
        let file_mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (store, _temp) = create_test_store().await;
        store.clear().await.unwrap();

        store
            .save(&session_expiring_in(chrono::Duration::hours(23)))
            .await
            .unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.is_none());
        assert!(!store.path().exists());

        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_file_reads_as_absent() {
        let (store, _temp) = create_test_store().await;
        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_unparsable_expiry_reads_as_absent() {
        let (store, _temp) = create_test_store().await;
        store
            .save(&session_expiring_in(chrono::Duration::hours(23)))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["expiresAt"] = serde_json::json!("next tuesday");
        std::fs::write(store.path(), value.to_string()).unwrap();

        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_schema_versions() {
        let (store, _temp) = create_test_store().await;
        store
            .save(&session_expiring_in(chrono::Duration::hours(23)))
            .await
            .unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        // Written before versioning existed
        value.as_object_mut().unwrap().remove("schemaVersion");
        std::fs::write(store.path(), value.to_string()).unwrap();
        assert_eq!(store.load().await.unwrap().schema_version, SCHEMA_VERSION);

        // Written by a newer launcher
        value["schemaVersion"] = serde_json::json!(SCHEMA_VERSION + 1);
        std::fs::write(store.path(), value.to_string()).unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_incomplete_session_on_disk_reads_as_absent() {
        let (store, _temp) = create_test_store().await;
        let mut session = session_expiring_in(chrono::Duration::hours(23));
        session.access_token.clear();
        std::fs::write(store.path(), serde_json::to_string(&session).unwrap()).unwrap();

        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_refuses_to_save_incomplete_session() {
        let (store, _temp) = create_test_store().await;
        let mut session = session_expiring_in(chrono::Duration::hours(23));
        session.refresh_token = Some(String::new());

        let err = store.save(&session).await.unwrap_err();
        assert!(matches!(err, AuthError::ChainIntegrity(_)));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_locked_by_another_process() {
        let (store, temp) = create_test_store().await;
        let held = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(temp.path().join(LOCK_FILE))
            .unwrap();
        held.try_lock_exclusive().unwrap();

        let err = store
            .save(&session_expiring_in(chrono::Duration::hours(23)))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Storage { .. }));
        assert!(err.to_string().contains("auth.json"));

        drop(held);
        store
            .save(&session_expiring_in(chrono::Duration::hours(23)))
            .await
            .unwrap();
    }
}
