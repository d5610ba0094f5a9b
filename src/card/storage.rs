//! Card state persistence
//!
//! Serializes the file tree and SAM as one JSON object graph. The
//! format's only contract is that it round-trips the in-memory graph
//! exactly; protecting the file at rest is the embedder's business.

use std::fs;
use std::path::PathBuf;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::fs::FileTree;
use crate::se::SecureAccessModule;

/// The persistable part of a card: everything that survives power-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCard {
    pub fs: FileTree,
    pub sam: SecureAccessModule,
}

/// Handles loading and saving card state.
pub struct CardStore {
    storage_dir: PathBuf,
    state_file: PathBuf,
}

impl CardStore {
    const STATE_FILE: &'static str = "card_state.json";

    fn default_storage_dir() -> PathBuf {
        if let Ok(path) = std::env::var("VCARDOS_STATE_DIR") {
            return PathBuf::from(path);
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".vcardos");
        }
        PathBuf::from("/var/lib/vcardos")
    }

    pub fn new(storage_dir: Option<PathBuf>) -> Self {
        let storage_dir = storage_dir.unwrap_or_else(Self::default_storage_dir);
        let state_file = storage_dir.join(Self::STATE_FILE);
        Self {
            storage_dir,
            state_file,
        }
    }

    /// Load previously saved state; `None` when there is none or it
    /// cannot be read.
    pub fn load(&self) -> Option<PersistedCard> {
        if !self.state_file.exists() {
            info!("no persisted card state at {:?}", self.state_file);
            return None;
        }
        match fs::read_to_string(&self.state_file) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => {
                    info!("loaded card state from {:?}", self.state_file);
                    Some(state)
                }
                Err(err) => {
                    warn!("failed to parse card state: {err}");
                    None
                }
            },
            Err(err) => {
                warn!("failed to read card state: {err}");
                None
            }
        }
    }

    /// Save the card state; returns false (with a log line) on failure.
    pub fn save(&self, state: &PersistedCard) -> bool {
        if let Err(err) = fs::create_dir_all(&self.storage_dir) {
            warn!("failed to create storage directory: {err}");
            return false;
        }
        let json = match serde_json::to_string_pretty(state) {
            Ok(json) => json,
            Err(err) => {
                warn!("failed to serialize card state: {err}");
                return false;
            }
        };
        match fs::write(&self.state_file, json) {
            Ok(()) => {
                debug!("saved card state to {:?}", self.state_file);
                true
            }
            Err(err) => {
                warn!("failed to write card state: {err}");
                false
            }
        }
    }
}
