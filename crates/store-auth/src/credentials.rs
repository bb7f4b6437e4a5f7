//! Credential storage
//!
//! The store is a small key-value map holding three entries under the keys in
//! `constants`: the access token, the refresh token and the JSON-serialized
//! user profile. Every mutation touches the entries it owns in a single step
//! under one lock, so readers never observe an access token without its
//! refresh token.
//!
//! Each login and each clear starts a new session generation. Updates that
//! belong to an existing session (`store_tokens`, `store_user`) carry the
//! generation they were derived from and are refused once it is stale, so a
//! refresh that finishes after a logout cannot bring the session back.
//!
//! `FileCredentialStore` persists the map as a JSON object, written with an
//! atomic temp-file + rename and 0600 permissions. `MemoryCredentialStore`
//! keeps it in process only.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_DATA_KEY};
use crate::error::{Error, Result};
use crate::token::User;

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Both tokens as read under one lock, with their session generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTokens {
    pub generation: u64,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Owner of the persisted session.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    fn access_token(&self) -> StoreFuture<'_, Option<String>>;

    fn refresh_token(&self) -> StoreFuture<'_, Option<String>>;

    fn tokens(&self) -> StoreFuture<'_, StoredTokens>;

    /// Cached profile. A stored value that no longer parses is an error.
    fn user(&self) -> StoreFuture<'_, Option<User>>;

    /// Replace the token pair of session `generation`. `refresh: None` keeps
    /// the stored refresh token (the server did not rotate it). Fails with
    /// `SessionChanged` when that session is no longer current.
    fn store_tokens(
        &self,
        generation: u64,
        access: String,
        refresh: Option<String>,
    ) -> StoreFuture<'_, ()>;

    /// Replace the cached profile of session `generation`. Fails with
    /// `SessionChanged` like `store_tokens`, and with `NotFound` when no token
    /// pair is stored, since a profile is only meaningful next to its tokens.
    fn store_user(&self, generation: u64, user: User) -> StoreFuture<'_, ()>;

    /// Write all three entries at once and start a new generation (login).
    fn save_session(&self, access: String, refresh: String, user: User) -> StoreFuture<'_, ()>;

    /// Remove all three entries at once and start a new generation (logout,
    /// rejected refresh).
    fn clear(&self) -> StoreFuture<'_, ()>;

    /// `clear()` limited to session `generation`. Returns false, leaving the
    /// store untouched, once another session has started.
    fn clear_session(&self, generation: u64) -> StoreFuture<'_, bool>;
}

/// The key-value map shared by both store implementations.
#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, String>,
    /// In process only; a restart begins at 0.
    generation: u64,
}

impl Entries {
    fn loaded(map: HashMap<String, String>) -> Self {
        Self { map, generation: 0 }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    fn tokens(&self) -> StoredTokens {
        StoredTokens {
            generation: self.generation,
            access_token: self.get(ACCESS_TOKEN_KEY),
            refresh_token: self.get(REFRESH_TOKEN_KEY),
        }
    }

    fn check_generation(&self, generation: u64) -> Result<()> {
        if generation != self.generation {
            return Err(Error::SessionChanged(format!(
                "update for generation {generation}, current is {}",
                self.generation
            )));
        }
        Ok(())
    }

    fn user(&self) -> Result<Option<User>> {
        match self.map.get(USER_DATA_KEY) {
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| Error::CredentialParse(format!("parsing stored user: {e}"))),
            None => Ok(None),
        }
    }

    fn set_tokens(
        &mut self,
        generation: u64,
        access: String,
        refresh: Option<String>,
    ) -> Result<()> {
        self.check_generation(generation)?;
        self.map.insert(ACCESS_TOKEN_KEY.into(), access);
        if let Some(refresh) = refresh {
            self.map.insert(REFRESH_TOKEN_KEY.into(), refresh);
        }
        Ok(())
    }

    fn set_user(&mut self, generation: u64, user: &User) -> Result<()> {
        self.check_generation(generation)?;
        if !self.map.contains_key(ACCESS_TOKEN_KEY) {
            return Err(Error::NotFound("no access token stored for this profile".into()));
        }
        let raw = serialize_user(user)?;
        self.map.insert(USER_DATA_KEY.into(), raw);
        Ok(())
    }

    fn set_session(&mut self, access: String, refresh: String, user: &User) -> Result<()> {
        let raw = serialize_user(user)?;
        self.map.insert(ACCESS_TOKEN_KEY.into(), access);
        self.map.insert(REFRESH_TOKEN_KEY.into(), refresh);
        self.map.insert(USER_DATA_KEY.into(), raw);
        self.generation += 1;
        Ok(())
    }

    /// Returns whether anything was removed.
    fn clear(&mut self) -> bool {
        self.generation += 1;
        let mut removed = false;
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_DATA_KEY] {
            removed |= self.map.remove(key).is_some();
        }
        removed
    }
}

fn serialize_user(user: &User) -> Result<String> {
    serde_json::to_string(user)
        .map_err(|e| Error::CredentialParse(format!("serializing user: {e}")))
}

/// In-process store, used by tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: Mutex<Entries>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(ACCESS_TOKEN_KEY)) })
    }

    fn refresh_token(&self) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(REFRESH_TOKEN_KEY)) })
    }

    fn user(&self) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move { self.state.lock().await.user() })
    }

    fn tokens(&self) -> StoreFuture<'_, StoredTokens> {
        Box::pin(async move { Ok(self.state.lock().await.tokens()) })
    }

    fn store_tokens(
        &self,
        generation: u64,
        access: String,
        refresh: Option<String>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.state.lock().await.set_tokens(generation, access, refresh) })
    }

    fn store_user(&self, generation: u64, user: User) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.state.lock().await.set_user(generation, &user) })
    }

    fn save_session(&self, access: String, refresh: String, user: User) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.state.lock().await.set_session(access, refresh, &user) })
    }

    fn clear(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.clear();
            Ok(())
        })
    }

    fn clear_session(&self, generation: u64) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.check_generation(generation).is_err() {
                return Ok(false);
            }
            state.clear();
            Ok(true)
        })
    }
}

/// JSON-file store.
///
/// The Mutex serializes all writes; each mutation is persisted before the
/// lock is released, so the file never lags the in-memory state.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<Entries>,
}

impl FileCredentialStore {
    /// Load credentials from `path`.
    ///
    /// A missing file is a cold start: it is created as `{}` and the store
    /// reports no session.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let map: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), entries = map.len(), "loaded credentials");
            Entries::loaded(map)
        } else {
            info!(path = %path.display(), "credential file not found, starting without a session");
            let entries = Entries::default();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn access_token(&self) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(ACCESS_TOKEN_KEY)) })
    }

    fn refresh_token(&self) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(REFRESH_TOKEN_KEY)) })
    }

    fn user(&self) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move { self.state.lock().await.user() })
    }

    fn tokens(&self) -> StoreFuture<'_, StoredTokens> {
        Box::pin(async move { Ok(self.state.lock().await.tokens()) })
    }

    fn store_tokens(
        &self,
        generation: u64,
        access: String,
        refresh: Option<String>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let rotated = refresh.is_some();
            state.set_tokens(generation, access, refresh)?;
            debug!(rotated, "updated tokens");
            write_atomic(&self.path, &state).await
        })
    }

    fn store_user(&self, generation: u64, user: User) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.set_user(generation, &user)?;
            debug!(user_id = user.id_user, "updated user profile");
            write_atomic(&self.path, &state).await
        })
    }

    fn save_session(&self, access: String, refresh: String, user: User) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.set_session(access, refresh, &user)?;
            debug!(user_id = user.id_user, "saved session");
            write_atomic(&self.path, &state).await
        })
    }

    fn clear(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.clear() {
                debug!("cleared session");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }

    fn clear_session(&self, generation: u64) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.check_generation(generation).is_err() {
                debug!(generation, "session already replaced, not clearing");
                return Ok(false);
            }
            if state.clear() {
                debug!("cleared session");
                write_atomic(&self.path, &state).await?;
            }
            Ok(true)
        })
    }
}

/// Write the entries to `path` atomically.
///
/// Writes a temporary file in the same directory, then renames it over the
/// target. File permissions are 0600 (owner read/write only).
async fn write_atomic(path: &Path, entries: &Entries) -> Result<()> {
    let json = serde_json::to_string_pretty(&entries.map)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
