//! Durable storage for the access token, refresh token and cached profile.
//!
//! `CredentialStore` keeps an in-memory snapshot behind a single lock and writes
//! through to a `StoreBackend`. Readers only ever see the snapshot, so a
//! credential is replaced as a whole. Backend failures are logged and do not
//! fail the operation.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use keyring::Entry;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::models::UserProfile;

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const USER_KEY: &str = "user";

/// Keyring service prefix; the API origin is appended
const SERVICE_PREFIX: &str = "symcheck";

/// Credentials file name in the per-origin cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Bearer credentials for the current session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Key/value persistence under the credential store.
pub trait StoreBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local backend, used by tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// JSON file in the per-origin cache directory.
pub struct FileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            path: dir.join(CREDENTIALS_FILE),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read credentials file")?;
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    fn write_all(&self, entries: &HashMap<String, String>) -> Result<()> {
        if entries.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).context("Failed to remove credentials file")?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, contents).context("Failed to write credentials file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

impl StoreBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

/// OS keychain, one service per API origin.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new(origin: &str) -> Self {
        Self {
            service: format!("{}:{}", SERVICE_PREFIX, origin),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl StoreBackend for KeyringBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve secret from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store secret in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete secret from keychain"),
        }
    }
}

#[derive(Default)]
struct Snapshot {
    credential: Option<Credential>,
    user: Option<UserProfile>,
    /// Bumped by every `set` and `clear`
    generation: u64,
}

pub struct CredentialStore {
    backend: Box<dyn StoreBackend>,
    state: RwLock<Snapshot>,
}

impl CredentialStore {
    /// Load whatever the backend holds and keep it as the in-memory snapshot.
    pub fn open(backend: impl StoreBackend + 'static) -> Self {
        let read = |key: &str| match backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read credential entry");
                None
            }
        };

        let credential = read(ACCESS_TOKEN_KEY)
            .map(|access| Credential::new(access, read(REFRESH_TOKEN_KEY)));
        let user = read(USER_KEY).and_then(|raw| match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable cached profile");
                None
            }
        });
        debug!(
            has_credential = credential.is_some(),
            has_user = user.is_some(),
            "Credential store opened"
        );

        Self {
            backend: Box::new(backend),
            state: RwLock::new(Snapshot {
                credential,
                user,
                generation: 0,
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::open(MemoryBackend::new())
    }

    pub fn get(&self) -> Option<Credential> {
        self.state.read().credential.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state
            .read()
            .credential
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    pub fn user_profile(&self) -> Option<UserProfile> {
        self.state.read().user.clone()
    }

    /// Credential, profile and generation read under one lock
    pub fn cached_session(&self) -> (Option<Credential>, Option<UserProfile>, u64) {
        let state = self.state.read();
        (state.credential.clone(), state.user.clone(), state.generation)
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn credential_with_generation(&self) -> (Option<Credential>, u64) {
        let state = self.state.read();
        (state.credential.clone(), state.generation)
    }

    /// Replace both tokens.
    pub fn set(&self, credential: Credential) {
        let mut state = self.state.write();
        self.persist_tokens(&credential.access_token, credential.refresh_token.as_deref());
        state.credential = Some(credential);
        state.generation += 1;
    }

    /// Start a new session: both tokens and the profile, written together.
    /// A missing profile removes any cached one from the previous session.
    pub fn replace(&self, credential: Credential, profile: Option<&UserProfile>) {
        let mut state = self.state.write();
        self.persist_tokens(&credential.access_token, credential.refresh_token.as_deref());
        match profile.map(serde_json::to_string) {
            Some(Ok(raw)) => self.write_entry(USER_KEY, &raw),
            Some(Err(e)) => warn!(error = %e, "Failed to serialize user profile"),
            None => {
                if let Err(e) = self.backend.remove(USER_KEY) {
                    warn!(error = %e, "Failed to remove cached profile");
                }
            }
        }
        state.credential = Some(credential);
        state.user = profile.cloned();
        state.generation += 1;
    }

    /// Cache a profile fetched under `generation`. Returns false, leaving the
    /// store untouched, if the session was replaced or cleared since.
    pub fn set_user_profile_if(&self, generation: u64, profile: &UserProfile) -> bool {
        let mut state = self.state.write();
        if state.generation != generation || state.credential.is_none() {
            return false;
        }
        match serde_json::to_string(profile) {
            Ok(raw) => self.write_entry(USER_KEY, &raw),
            Err(e) => warn!(error = %e, "Failed to serialize user profile"),
        }
        state.user = Some(profile.clone());
        true
    }

    /// Commit the outcome of a refresh started at `generation`.
    ///
    /// Returns false, leaving the store untouched, if the credential was set or
    /// cleared since. A missing `refresh_token` keeps the current one.
    pub fn update_tokens(&self, generation: u64, access_token: &str, refresh_token: Option<&str>) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            return false;
        }
        let Some(current) = state.credential.as_mut() else {
            return false;
        };

        current.access_token = access_token.to_string();
        if let Some(rotated) = refresh_token {
            current.refresh_token = Some(rotated.to_string());
        }
        let persisted = current.clone();
        self.persist_tokens(&persisted.access_token, persisted.refresh_token.as_deref());
        true
    }

    /// Drop everything. Safe to call repeatedly.
    pub fn clear(&self) {
        let mut state = self.state.write();
        self.clear_locked(&mut state);
    }

    /// Clear only if nothing has set or cleared the credential since `generation`.
    pub fn clear_if(&self, generation: u64) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            return false;
        }
        self.clear_locked(&mut state);
        true
    }

    fn clear_locked(&self, state: &mut Snapshot) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY] {
            if let Err(e) = self.backend.remove(key) {
                warn!(key, error = %e, "Failed to remove credential entry");
            }
        }
        state.credential = None;
        state.user = None;
        state.generation += 1;
    }

    fn persist_tokens(&self, access_token: &str, refresh_token: Option<&str>) {
        self.write_entry(ACCESS_TOKEN_KEY, access_token);
        match refresh_token {
            Some(token) => self.write_entry(REFRESH_TOKEN_KEY, token),
            None => {
                if let Err(e) = self.backend.remove(REFRESH_TOKEN_KEY) {
                    warn!(error = %e, "Failed to remove refresh token entry");
                }
            }
        }
    }

    fn write_entry(&self, key: &str, value: &str) {
        if let Err(e) = self.backend.set(key, value) {
            warn!(key, error = %e, "Failed to persist credential entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Backend handle shared between a store and the test
    #[derive(Clone, Default)]
    struct SharedBackend(Arc<MemoryBackend>);

    impl StoreBackend for SharedBackend {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key)
        }
        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.0.set(key, value)
        }
        fn remove(&self, key: &str) -> Result<()> {
            self.0.remove(key)
        }
    }

    fn profile(name: &str) -> UserProfile {
        UserProfile {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_set_get_clear() {
        let store = CredentialStore::in_memory();
        assert!(store.get().is_none());

        store.set(Credential::new("a1", Some("r1".into())));
        assert!(store.set_user_profile_if(store.generation(), &profile("Ada")));
        assert_eq!(store.access_token().as_deref(), Some("a1"));
        assert_eq!(store.get().unwrap().refresh_token.as_deref(), Some("r1"));
        assert_eq!(store.user_profile().unwrap().name.as_deref(), Some("Ada"));

        store.clear();
        assert!(store.get().is_none());
        assert!(store.user_profile().is_none());
        store.clear();
        assert!(store.get().is_none());
    }

    #[test]
    fn test_persists_through_backend() {
        let backend = SharedBackend::default();
        let store = CredentialStore::open(backend.clone());
        store.replace(Credential::new("a1", Some("r1".into())), Some(&profile("Ada")));

        let reopened = CredentialStore::open(backend.clone());
        assert_eq!(reopened.get(), Some(Credential::new("a1", Some("r1".into()))));
        assert_eq!(reopened.user_profile(), Some(profile("Ada")));

        reopened.clear();
        assert_eq!(backend.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(backend.get(USER_KEY).unwrap(), None);
    }

    #[test]
    fn test_corrupt_profile_is_discarded() {
        let backend = SharedBackend::default();
        backend.set(ACCESS_TOKEN_KEY, "a1").unwrap();
        backend.set(USER_KEY, "{not json").unwrap();

        let store = CredentialStore::open(backend);
        assert!(store.get().is_some());
        assert!(store.get().unwrap().refresh_token.is_none());
        assert!(store.user_profile().is_none());
    }

    #[test]
    fn test_replace_drops_previous_profile() {
        let backend = SharedBackend::default();
        let store = CredentialStore::open(backend.clone());
        store.replace(Credential::new("a1", Some("r1".into())), Some(&profile("Ada")));
        let generation = store.generation();

        store.replace(Credential::new("b1", None), None);
        assert!(store.generation() > generation);
        assert_eq!(store.get(), Some(Credential::new("b1", None)));
        assert!(store.user_profile().is_none());
        assert_eq!(backend.get(USER_KEY).unwrap(), None);
        assert_eq!(backend.get(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[test]
    fn test_profile_not_cached_for_replaced_session() {
        let backend = SharedBackend::default();
        let store = CredentialStore::open(backend.clone());
        store.set(Credential::new("alice-a", Some("alice-r".into())));
        let generation = store.generation();

        store.replace(Credential::new("bob-a", Some("bob-r".into())), Some(&profile("Bob")));
        assert!(!store.set_user_profile_if(generation, &profile("Alice")));
        assert_eq!(store.user_profile(), Some(profile("Bob")));

        store.clear();
        assert!(!store.set_user_profile_if(store.generation(), &profile("Alice")));
        assert!(store.user_profile().is_none());
        assert_eq!(backend.get(USER_KEY).unwrap(), None);
    }

    #[test]
    fn test_update_tokens_keeps_or_rotates_refresh() {
        let store = CredentialStore::in_memory();
        store.set(Credential::new("a1", Some("r1".into())));
        let generation = store.generation();

        assert!(store.update_tokens(generation, "a2", None));
        assert_eq!(store.get(), Some(Credential::new("a2", Some("r1".into()))));

        assert!(store.update_tokens(generation, "a3", Some("r2")));
        assert_eq!(store.get(), Some(Credential::new("a3", Some("r2".into()))));
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let store = CredentialStore::in_memory();
        store.set(Credential::new("a1", Some("r1".into())));
        let generation = store.generation();

        store.clear();
        assert!(!store.update_tokens(generation, "a2", None));
        assert!(store.get().is_none());

        store.set(Credential::new("b1", Some("s1".into())));
        assert!(!store.clear_if(generation));
        assert_eq!(store.access_token().as_deref(), Some("b1"));
        assert!(store.clear_if(store.generation()));
        assert!(store.get().is_none());
    }

    #[test]
    fn test_file_backend_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("http_localhost_5000");
        let backend = FileBackend::new(dir.clone());
        assert_eq!(backend.get(ACCESS_TOKEN_KEY).unwrap(), None);

        backend.set(ACCESS_TOKEN_KEY, "a1").unwrap();
        backend.set(REFRESH_TOKEN_KEY, "r1").unwrap();
        assert_eq!(backend.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("a1"));

        let store = CredentialStore::open(FileBackend::new(dir.clone()));
        assert_eq!(store.get(), Some(Credential::new("a1", Some("r1".into()))));

        store.clear();
        assert!(!dir.join(CREDENTIALS_FILE).exists());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let debug = format!("{:?}", Credential::new("secret-access", Some("secret-refresh".into())));
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
    }
}
