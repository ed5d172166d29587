//! Session credential persistence
//!
//! Exactly one value is stored: the latest session credential. It is
//! overwritten on every refresh and read back once at startup so a
//! restarted instance can serve before its first heartbeat arrives.

use crate::error::{GuardError, Result};
use std::path::{Path, PathBuf};

/// Trait for persisting the session credential
pub trait TokenStore: Send + Sync {
    /// Replace the stored credential
    fn save(&self, token: &str) -> Result<()>;

    /// Load the stored credential, if any
    fn load(&self) -> Result<Option<String>>;
}

/// File-based token store
///
/// Atomic writes via temp file + rename, so readers see either the old
/// credential or the new one, never a partial write.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Create a new file token store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn save(&self, token: &str) -> Result<()> {
        // Atomic write: write to temp file, then rename
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GuardError::Persistence(format!(
                    "Failed to create token directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, token).map_err(|e| {
            GuardError::Persistence(format!(
                "Failed to write token file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            GuardError::Persistence(format!(
                "Failed to rename token file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), "Token saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let token = match std::fs::read_to_string(&self.path) {
            Ok(token) => token,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                tracing::warn!(
                    path = %self.path.display(),
                    "Token file is not valid UTF-8, ignoring it"
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(GuardError::Persistence(format!(
                    "Failed to read token file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }

        tracing::debug!(path = %self.path.display(), "Token loaded");
        Ok(Some(token.to_string()))
    }
}

/// In-memory token store
///
/// Stores the credential in memory. Lost on drop, but useful for tests
/// and for instances that do not need to survive restarts.
#[derive(Default)]
pub struct MemoryTokenStore {
    token: std::sync::RwLock<Option<String>>,
}

impl MemoryTokenStore {
    /// Create a store that already holds a credential
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: std::sync::RwLock::new(Some(token.into())),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, token: &str) -> Result<()> {
        let mut state = self.token.write().map_err(|e| {
            GuardError::Persistence(format!("Failed to acquire token lock: {}", e))
        })?;
        *state = Some(token.to_string());
        Ok(())
    }

    fn load(&self) -> Result<Option<String>> {
        let state = self.token.read().map_err(|e| {
            GuardError::Persistence(format!("Failed to acquire token lock: {}", e))
        })?;
        Ok(state.clone())
    }
}
