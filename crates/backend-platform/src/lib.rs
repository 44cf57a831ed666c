//! Credential persistence for the duochat client.
//!
//! The runtime only talks to [`CredentialVault`]; the concrete
//! [`SecretStore`] decides whether the bearer token lives in memory, in a
//! JSON file under the data directory, or in the OS keyring.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretStoreError {
    #[error("secret not found")]
    NotFound,
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store backend failure: {0}")]
    Backend(String),
}

pub trait SecretStore: Send + Sync {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError>;

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError>;

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}

impl<T: SecretStore + ?Sized> SecretStore for Arc<T> {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        (**self).set_secret(service, account, secret)
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        (**self).get_secret(service, account)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        (**self).delete_secret(service, account)
    }
}

#[derive(Clone, Default)]
pub struct InMemorySecretStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl SecretStore for InMemorySecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SecretStoreError::Backend("poisoned lock".to_owned()))?;
        data.insert((service.to_owned(), account.to_owned()), secret.to_owned());
        Ok(())
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| SecretStoreError::Backend("poisoned lock".to_owned()))?;
        data.get(&(service.to_owned(), account.to_owned()))
            .cloned()
            .ok_or(SecretStoreError::NotFound)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SecretStoreError::Backend("poisoned lock".to_owned()))?;
        if data
            .remove(&(service.to_owned(), account.to_owned()))
            .is_none()
        {
            return Err(SecretStoreError::NotFound);
        }
        Ok(())
    }
}

/// Secrets kept in one JSON file, rewritten atomically on every change.
pub struct FileSecretStore {
    path: PathBuf,
    guard: Mutex<()>,
}

type SecretFile = BTreeMap<String, BTreeMap<String, String>>;

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<SecretFile, SecretStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SecretFile::new());
            }
            Err(err) => {
                return Err(SecretStoreError::Unavailable(format!(
                    "failed reading {}: {err}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_str(&raw).map_err(|err| {
            SecretStoreError::Backend(format!("failed parsing {}: {err}", self.path.display()))
        })
    }

    fn write_all(&self, secrets: &SecretFile) -> Result<(), SecretStoreError> {
        if secrets.is_empty() {
            return remove_file_if_present(&self.path).map_err(SecretStoreError::Unavailable);
        }
        let encoded =
            serde_json::to_vec(secrets).map_err(|err| SecretStoreError::Backend(err.to_string()))?;
        write_atomically(&self.path, &encoded).map_err(SecretStoreError::Unavailable)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, SecretStoreError> {
        self.guard
            .lock()
            .map_err(|_| SecretStoreError::Backend("poisoned lock".to_owned()))
    }
}

impl SecretStore for FileSecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        let _guard = self.lock()?;
        let mut secrets = self.read_all()?;
        secrets
            .entry(service.to_owned())
            .or_default()
            .insert(account.to_owned(), secret.to_owned());
        self.write_all(&secrets)
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        let _guard = self.lock()?;
        self.read_all()?
            .get(service)
            .and_then(|accounts| accounts.get(account))
            .cloned()
            .ok_or(SecretStoreError::NotFound)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        let _guard = self.lock()?;
        let mut secrets = self.read_all()?;
        let Some(accounts) = secrets.get_mut(service) else {
            return Err(SecretStoreError::NotFound);
        };
        if accounts.remove(account).is_none() {
            return Err(SecretStoreError::NotFound);
        }
        if accounts.is_empty() {
            secrets.remove(service);
        }
        self.write_all(&secrets)
    }
}

#[cfg(feature = "os-keyring")]
#[derive(Default, Clone, Copy)]
pub struct OsKeyringSecretStore;

#[cfg(feature = "os-keyring")]
impl SecretStore for OsKeyringSecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))?;
        entry
            .set_password(secret)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))?;
        entry.get_password().map_err(|err| match err {
            keyring::Error::NoEntry => SecretStoreError::NotFound,
            other => SecretStoreError::Backend(other.to_string()),
        })
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))?;
        entry.delete_credential().map_err(|err| match err {
            keyring::Error::NoEntry => SecretStoreError::NotFound,
            other => SecretStoreError::Backend(other.to_string()),
        })
    }
}

#[derive(Clone)]
pub struct ScopedSecretStore<S: SecretStore> {
    inner: S,
    service: String,
}

impl<S: SecretStore> ScopedSecretStore<S> {
    pub fn new(inner: S, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn set(&self, account: &str, secret: &str) -> Result<(), SecretStoreError> {
        self.inner.set_secret(&self.service, account, secret)
    }

    pub fn get(&self, account: &str) -> Result<String, SecretStoreError> {
        self.inner.get_secret(&self.service, account)
    }

    pub fn delete(&self, account: &str) -> Result<(), SecretStoreError> {
        self.inner.delete_secret(&self.service, account)
    }
}

/// Bearer credential as persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCredential {
    pub access_token: String,
    pub token_type: String,
}

/// Persists one credential per API base.
#[derive(Clone)]
pub struct CredentialVault {
    store: ScopedSecretStore<Arc<dyn SecretStore>>,
    account: String,
}

impl CredentialVault {
    pub const SERVICE: &'static str = "duochat";

    pub fn new(store: Arc<dyn SecretStore>, api_base: &str) -> Self {
        Self {
            store: ScopedSecretStore::new(store, Self::SERVICE),
            account: format!("access-token:{}", api_base.trim_end_matches('/')),
        }
    }

    pub fn save(&self, credential: &StoredCredential) -> Result<(), SecretStoreError> {
        let encoded = serde_json::to_string(credential)
            .map_err(|err| SecretStoreError::Backend(err.to_string()))?;
        self.store.set(&self.account, &encoded)?;
        debug!(account = %self.account, "stored access token");
        Ok(())
    }

    /// `Ok(None)` when nothing is stored.
    pub fn load(&self) -> Result<Option<StoredCredential>, SecretStoreError> {
        let raw = match self.store.get(&self.account) {
            Ok(raw) => raw,
            Err(SecretStoreError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| SecretStoreError::Backend(format!("corrupt stored credential: {err}")))
    }

    /// Forget the credential. Missing entries are not an error.
    pub fn clear(&self) -> Result<(), SecretStoreError> {
        match self.store.delete(&self.account) {
            Ok(()) | Err(SecretStoreError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Write `bytes` through a temp file and rename it over `path`, creating
/// parent directories when needed.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| {
            format!("failed creating directory {}: {err}", parent.display())
        })?;
    }

    let temp_path = temp_path_for(path);
    fs::write(&temp_path, bytes)
        .map_err(|err| format!("failed writing temp file {}: {err}", temp_path.display()))?;

    if let Err(rename_err) = fs::rename(&temp_path, path) {
        // Windows does not allow replacing existing files via rename.
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(format!(
                    "failed replacing {} after rename error ({rename_err}): {err}",
                    path.display()
                ));
            }
        }
        fs::rename(&temp_path, path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            format!("failed writing {} after temp write: {err}", path.display())
        })?;
    }

    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_present(path: &Path) -> Result<(), String> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!("failed deleting {}: {err}", path.display())),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("duochat-store.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}
