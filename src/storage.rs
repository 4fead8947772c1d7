//! Secure Storage Module
//!
//! Token and preference persistence behind platform-neutral traits.
//! Native builds encrypt the token with Windows DPAPI; browser builds keep
//! it in origin-scoped `localStorage`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

#[cfg(windows)]
use windows::Win32::Security::Cryptography::CRYPT_INTEGER_BLOB;
#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN,
};

use crate::config::Config;

const TOKEN_KEY: &str = "session";
const PREFERENCES_FILE: &str = "preferences.json";

/// Holder of the single opaque session token.
///
/// Only the session manager writes through this trait.
pub trait TokenStore: Send + Sync {
    fn get(&self) -> Result<Option<String>, StorageError>;
    fn set(&self, token: &str) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// Plain persisted preferences (no secrets)
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Token store for the current build target
#[cfg(not(target_arch = "wasm32"))]
pub fn platform_token_store(config: &Config) -> Arc<dyn TokenStore> {
    Arc::new(SecureStorage::new(&config.data_dir))
}

/// Preference store for the current build target
#[cfg(not(target_arch = "wasm32"))]
pub fn platform_preferences(config: &Config) -> Arc<dyn PreferenceStore> {
    Arc::new(FilePreferences::new(&config.data_dir))
}

#[cfg(target_arch = "wasm32")]
pub fn platform_token_store(_config: &Config) -> Arc<dyn TokenStore> {
    Arc::new(BrowserStorage::new("sentio"))
}

#[cfg(target_arch = "wasm32")]
pub fn platform_preferences(_config: &Config) -> Arc<dyn PreferenceStore> {
    Arc::new(BrowserStorage::new("sentio"))
}

/// Token as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    saved_at: chrono::DateTime<chrono::Utc>,
}

/// Secure storage using Windows DPAPI for encryption
pub struct SecureStorage {
    storage_path: PathBuf,
}

impl SecureStorage {
    /// Create new secure storage rooted at `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let storage_path = dir.as_ref().to_path_buf();

        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            error!("Failed to create storage directory: {}", e);
        }

        debug!("Secure storage initialized at: {:?}", storage_path);

        Self { storage_path }
    }

    /// Save data securely using DPAPI
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<(), StorageError> {
        let json =
            serde_json::to_string(data).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let encrypted = self.encrypt(json.as_bytes())?;

        let file_path = self.file_path(key);
        std::fs::write(&file_path, encrypted).map_err(|e| StorageError::Io(e.to_string()))?;
        restrict_permissions(&file_path)?;

        info!("Saved encrypted data for key: {}", key);
        Ok(())
    }

    /// Load data, `None` when nothing was stored under `key`
    pub fn load<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let file_path = self.file_path(key);

        let encrypted = match std::fs::read(&file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let decrypted = self.decrypt(&encrypted)?;

        let json =
            String::from_utf8(decrypted).map_err(|e| StorageError::Decryption(e.to_string()))?;

        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Delete stored data
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let file_path = self.file_path(key);

        if file_path.exists() {
            std::fs::remove_file(&file_path).map_err(|e| StorageError::Io(e.to_string()))?;
            info!("Deleted stored data for key: {}", key);
        }

        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key))
    }

    #[cfg(windows)]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptProtectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Encryption("DPAPI encryption failed".into()));
            }

            let encrypted =
                std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();

            // Buffer is owned by DPAPI
            windows::Win32::Foundation::LocalFree(windows::Win32::Foundation::HLOCAL(
                output.pbData as *mut std::ffi::c_void,
            ));

            Ok(encrypted)
        }
    }

    #[cfg(windows)]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        use std::ptr::null_mut;

        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };

        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: null_mut(),
        };

        unsafe {
            let result = CryptUnprotectData(
                &input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut output,
            );

            if result.is_err() {
                return Err(StorageError::Decryption("DPAPI decryption failed".into()));
            }

            let decrypted =
                std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();

            windows::Win32::Foundation::LocalFree(windows::Win32::Foundation::HLOCAL(
                output.pbData as *mut std::ffi::c_void,
            ));

            Ok(decrypted)
        }
    }

    // No DPAPI here: the file is only readable by the owning user
    #[cfg(not(windows))]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(data.to_vec())
    }

    #[cfg(not(windows))]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        Ok(data.to_vec())
    }
}

impl TokenStore for SecureStorage {
    fn get(&self) -> Result<Option<String>, StorageError> {
        Ok(self.load::<StoredToken>(TOKEN_KEY)?.map(|stored| stored.token))
    }

    fn set(&self, token: &str) -> Result<(), StorageError> {
        self.save(
            TOKEN_KEY,
            &StoredToken {
                token: token.to_string(),
                saved_at: chrono::Utc::now(),
            },
        )
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.delete(TOKEN_KEY)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| StorageError::Io(e.to_string()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

/// Preferences kept in a JSON file next to the token
pub struct FilePreferences {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePreferences {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!("Failed to create preferences directory: {}", e);
        }

        Self {
            path: dir.join(PREFERENCES_FILE),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<HashMap<String, String>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    fn write_all(&self, values: &HashMap<String, String>) -> Result<(), StorageError> {
        let json =
            serde_json::to_vec_pretty(values).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StorageError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StorageError::Io(e.to_string()))
    }

    fn update<F>(&self, apply: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut values = self.read_all()?;
        apply(&mut values);
        self.write_all(&values)
    }
}

impl PreferenceStore for FilePreferences {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })?;
        debug!("Saved preference: {}", key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// Browser storage scoped to the page origin
#[cfg(target_arch = "wasm32")]
pub struct BrowserStorage {
    prefix: String,
}

#[cfg(target_arch = "wasm32")]
impl BrowserStorage {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn storage(&self) -> Result<web_sys::Storage, StorageError> {
        web_sys::window()
            .ok_or_else(|| StorageError::Unavailable("no window".into()))?
            .local_storage()
            .map_err(|e| StorageError::Unavailable(format!("{:?}", e)))?
            .ok_or_else(|| StorageError::Unavailable("localStorage disabled".into()))
    }

    fn token_item(&self) -> String {
        format!("{}.token", self.prefix)
    }

    /// Preferences live under their own sub-prefix so no key can shadow the token
    fn item(&self, key: &str) -> String {
        format!("{}.pref.{}", self.prefix, key)
    }
}

#[cfg(target_arch = "wasm32")]
impl TokenStore for BrowserStorage {
    fn get(&self) -> Result<Option<String>, StorageError> {
        self.storage()?
            .get_item(&self.token_item())
            .map_err(|e| StorageError::Io(format!("{:?}", e)))
    }

    fn set(&self, token: &str) -> Result<(), StorageError> {
        self.storage()?
            .set_item(&self.token_item(), token)
            .map_err(|e| StorageError::Io(format!("{:?}", e)))
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.storage()?
            .remove_item(&self.token_item())
            .map_err(|e| StorageError::Io(format!("{:?}", e)))
    }
}

#[cfg(target_arch = "wasm32")]
impl PreferenceStore for BrowserStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage()?
            .get_item(&self.item(key))
            .map_err(|e| StorageError::Io(format!("{:?}", e)))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage()?
            .set_item(&self.item(key), value)
            .map_err(|e| StorageError::Io(format!("{:?}", e)))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.storage()?
            .remove_item(&self.item(key))
            .map_err(|e| StorageError::Io(format!("{:?}", e)))
    }
}

/// Process-local store, lost on exit
#[derive(Default)]
pub struct MemoryStore {
    token: Mutex<Option<String>>,
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> R) -> Result<R, StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(f(&mut values))
    }
}

impl TokenStore for MemoryStore {
    fn get(&self) -> Result<Option<String>, StorageError> {
        Ok(self.token.lock().map_err(|_| StorageError::Poisoned)?.clone())
    }

    fn set(&self, token: &str) -> Result<(), StorageError> {
        *self.token.lock().map_err(|_| StorageError::Poisoned)? = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.token.lock().map_err(|_| StorageError::Poisoned)? = None;
        Ok(())
    }
}

impl PreferenceStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with(|values| values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.with(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.with(|values| {
            values.remove(key);
        })
    }
}

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Stored token does not match the written one")]
    Verification,

    #[error("Storage lock poisoned")]
    Poisoned,
}
