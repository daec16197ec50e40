//! Remembered bunker connection
//!
//! After a successful NIP-46 login the bunker URI is kept in a JSON sidecar
//! in the state directory so the next `login bunker` can skip pasting it.
//! The NIP-46 client keypair is not stored; every session gets a new one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::error::AuthResult;
use super::identifier::{parse_bunker_url, BunkerDescriptor, PublicKeyIdentifier};

const CONFIG_FILE: &str = "bunker.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RememberedBunker {
    /// Normalized bunker:// URI, including the secret if there was one
    pub bunker_uri: String,
    /// The remote signer's public key (hex)
    pub remote_signer_pubkey: String,
    /// Relay URLs the bunker listens on
    pub relays: Vec<String>,
    /// The user's public key as confirmed by the bunker (hex)
    pub user_pubkey: Option<String>,
    pub created_at: String,
    pub last_connected: Option<String>,
}

impl RememberedBunker {
    pub fn from_descriptor(descriptor: &BunkerDescriptor) -> Self {
        Self {
            bunker_uri: descriptor.to_uri(),
            remote_signer_pubkey: descriptor.remote_signer_pubkey().to_string(),
            relays: descriptor.relays().map(str::to_string).collect(),
            user_pubkey: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            last_connected: None,
        }
    }

    /// Re-validate the stored URI
    pub fn descriptor(&self) -> AuthResult<BunkerDescriptor> {
        parse_bunker_url(&self.bunker_uri)
    }

    pub fn config_path(state_dir: &Path) -> PathBuf {
        state_dir.join(CONFIG_FILE)
    }

    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = Self::config_path(state_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .context("Failed to read remembered bunker")?;
        let config: RememberedBunker = serde_json::from_str(&content)
            .context("Failed to parse remembered bunker")?;
        Ok(Some(config))
    }

    fn tmp_path(state_dir: &Path) -> PathBuf {
        Self::config_path(state_dir).with_extension("json.tmp")
    }

    /// Save atomically. The file holds the bunker secret, so it is created owner-only.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(state_dir)
            .context("Failed to create state directory")?;
        let path = Self::config_path(state_dir);
        let tmp_path = Self::tmp_path(state_dir);

        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize remembered bunker")?;

        // leftover from an interrupted save
        if let Err(e) = std::fs::remove_file(&tmp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e).context("Failed to clear stale remembered bunker temp file");
            }
        }

        let written = create_private(&tmp_path)
            .and_then(|mut file| {
                file.write_all(content.as_bytes())?;
                file.sync_all()
            })
            .context("Failed to write remembered bunker temp file")
            .and_then(|()| {
                std::fs::rename(&tmp_path, &path)
                    .context("Failed to atomically save remembered bunker")
            });
        if written.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        written
    }

    /// Returns whether there was anything to delete
    pub fn delete(state_dir: &Path) -> Result<bool> {
        let path = Self::config_path(state_dir);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).context("Failed to delete remembered bunker")?;
        Ok(true)
    }

    pub fn update_connected(&mut self, user_pubkey: &PublicKeyIdentifier) {
        self.last_connected = Some(chrono::Utc::now().to_rfc3339());
        self.user_pubkey = Some(user_pubkey.as_str().to_string());
    }

    /// Record a successful connect through `descriptor`, replacing a different bunker
    pub fn remember(
        state_dir: &Path,
        descriptor: &BunkerDescriptor,
        user_pubkey: &PublicKeyIdentifier,
    ) -> Result<Self> {
        let mut config = match Self::load(state_dir)? {
            Some(existing) if existing.bunker_uri == descriptor.to_uri() => existing,
            _ => Self::from_descriptor(descriptor),
        };
        config.update_connected(user_pubkey);
        config.save(state_dir)?;
        Ok(config)
    }
}

/// Create `path` exclusively, readable by the owner only
fn create_private(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
