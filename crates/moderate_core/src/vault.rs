#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub const KEYRING_SERVICE: &str = "moderate";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
	#[error("no value stored under key")]
	NotFound,
	#[error("vault backend failure: {0}")]
	Backend(String),
	#[error("vault encoding failure: {0}")]
	Encoding(String),
}

/// Opaque secure key-value store. Each operation is atomic per key;
/// concurrent writers resolve last-writer-wins.
pub trait CredentialVault: Send + Sync + 'static {
	fn save(&self, key: &str, value: &str) -> Result<(), VaultError>;
	fn load(&self, key: &str) -> Result<String, VaultError>;
	/// Deleting a missing key is not an error.
	fn delete(&self, key: &str) -> Result<(), VaultError>;
}

/// In-process store for tests and `--ephemeral` sessions.
#[derive(Debug, Default)]
pub struct MemoryVault {
	entries: Mutex<HashMap<String, String>>,
}

impl MemoryVault {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn contains(&self, key: &str) -> bool {
		self.entries.lock().contains_key(key)
	}
}

impl CredentialVault for MemoryVault {
	fn save(&self, key: &str, value: &str) -> Result<(), VaultError> {
		self.entries.lock().insert(key.to_string(), value.to_string());
		Ok(())
	}

	fn load(&self, key: &str) -> Result<String, VaultError> {
		self.entries.lock().get(key).cloned().ok_or(VaultError::NotFound)
	}

	fn delete(&self, key: &str) -> Result<(), VaultError> {
		self.entries.lock().remove(key);
		Ok(())
	}
}

/// JSON map on disk. Writes go through a sibling temp file and a rename so a
/// crash never leaves a half-written secrets file.
#[derive(Debug)]
pub struct FileVault {
	path: PathBuf,
	lock: Mutex<()>,
}

impl FileVault {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			lock: Mutex::new(()),
		}
	}

	/// `~/.moderate/secrets.json`
	pub fn default_path() -> Option<PathBuf> {
		dirs::home_dir().map(|home| home.join(".moderate").join("secrets.json"))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn read_map(&self) -> Result<HashMap<String, String>, VaultError> {
		match std::fs::read_to_string(&self.path) {
			Ok(data) if data.trim().is_empty() => Ok(HashMap::new()),
			Ok(data) => serde_json::from_str(&data).map_err(|e| VaultError::Encoding(format!("{}: {e}", self.path.display()))),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
			Err(e) => Err(VaultError::Backend(format!("read {}: {e}", self.path.display()))),
		}
	}

	fn write_map(&self, map: &HashMap<String, String>) -> Result<(), VaultError> {
		let data = serde_json::to_string_pretty(map).map_err(|e| VaultError::Encoding(e.to_string()))?;
		let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
		std::fs::create_dir_all(dir).map_err(|e| VaultError::Backend(format!("create {}: {e}", dir.display())))?;

		let tmp = self.path.with_extension("json.tmp");
		let write = || -> std::io::Result<()> {
			let mut file = std::fs::File::create(&tmp)?;
			restrict_permissions(&file)?;
			file.write_all(data.as_bytes())?;
			file.sync_all()?;
			std::fs::rename(&tmp, &self.path)
		};
		write().map_err(|e| {
			let _ = std::fs::remove_file(&tmp);
			VaultError::Backend(format!("write {}: {e}", self.path.display()))
		})
	}
}

#[cfg(unix)]
fn restrict_permissions(file: &std::fs::File) -> std::io::Result<()> {
	use std::os::unix::fs::PermissionsExt as _;
	file.set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &std::fs::File) -> std::io::Result<()> {
	Ok(())
}

impl CredentialVault for FileVault {
	fn save(&self, key: &str, value: &str) -> Result<(), VaultError> {
		let _guard = self.lock.lock();
		let mut map = self.read_map()?;
		map.insert(key.to_string(), value.to_string());
		self.write_map(&map)?;
		debug!(key, path = %self.path.display(), "stored secret in file");
		Ok(())
	}

	fn load(&self, key: &str) -> Result<String, VaultError> {
		let _guard = self.lock.lock();
		self.read_map()?.remove(key).ok_or(VaultError::NotFound)
	}

	fn delete(&self, key: &str) -> Result<(), VaultError> {
		let _guard = self.lock.lock();
		let mut map = self.read_map()?;
		if map.remove(key).is_some() {
			self.write_map(&map)?;
		}
		Ok(())
	}
}

/// System keyring with a file fallback for hosts without a secret service.
pub struct KeyringVault {
	service: String,
	fallback: FileVault,
}

impl KeyringVault {
	pub fn new(service: impl Into<String>, fallback: FileVault) -> Self {
		Self {
			service: service.into(),
			fallback,
		}
	}

	fn entry(&self, key: &str) -> Option<keyring::Entry> {
		match keyring::Entry::new(&self.service, key) {
			Ok(entry) => Some(entry),
			Err(e) => {
				info!(key, error = %e, "keyring entry creation failed, falling back to file");
				None
			}
		}
	}
}

impl CredentialVault for KeyringVault {
	fn save(&self, key: &str, value: &str) -> Result<(), VaultError> {
		if let Some(entry) = self.entry(key) {
			match entry.set_password(value) {
				Ok(()) => {
					debug!(key, "stored secret in system keyring");
					let _ = self.fallback.delete(key);
					return Ok(());
				}
				Err(e) => {
					info!(key, error = %e, "keyring set_password failed, falling back to file");
					// An older keyring value would otherwise win on load.
					let _ = entry.delete_credential();
				}
			}
		}
		self.fallback.save(key, value)
	}

	fn load(&self, key: &str) -> Result<String, VaultError> {
		if let Some(entry) = self.entry(key) {
			match entry.get_password() {
				Ok(value) => return Ok(value),
				Err(keyring::Error::NoEntry) => {}
				Err(e) => debug!(key, error = %e, "keyring get_password failed"),
			}
		}
		self.fallback.load(key)
	}

	fn delete(&self, key: &str) -> Result<(), VaultError> {
		let mut result = Ok(());
		if let Some(entry) = self.entry(key) {
			match entry.delete_credential() {
				Ok(()) | Err(keyring::Error::NoEntry) => {}
				Err(e) => {
					warn!(key, error = %e, "keyring delete_credential failed");
					result = Err(VaultError::Backend(e.to_string()));
				}
			}
		}
		self.fallback.delete(key)?;
		result
	}
}
