//! Persistent storage of the paired device
//!
//! Remembers the last paired sensor so the next session can reconnect
//! without scanning, and the Wi-Fi address used for liveness queries.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::identity::ResolvedAddress;

/// Identifying fields of a paired device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedIdentity {
    pub transport_id: String,
    pub resolved_address: ResolvedAddress,
    #[serde(default)]
    pub name: Option<String>,
    pub paired_at: u64,
}

impl PairedIdentity {
    pub fn new(transport_id: &str, resolved_address: ResolvedAddress, name: Option<String>) -> Self {
        Self {
            transport_id: transport_id.to_string(),
            resolved_address,
            name,
            paired_at: now_secs(),
        }
    }
}

/// Key-value persistence the engine consumes
pub trait PersistenceService: Send + Sync {
    fn load_paired(&self) -> Result<Option<PairedIdentity>, StorageError>;

    fn save_paired(&self, identity: &PairedIdentity) -> Result<(), StorageError>;

    /// Address the sensor uses on the Wi-Fi network
    fn load_network_address(&self) -> Result<Option<ResolvedAddress>, StorageError>;

    fn save_network_address(&self, address: &ResolvedAddress) -> Result<(), StorageError>;

    /// Drop the stored network address, keeping the paired identity
    fn forget_network_address(&self) -> Result<(), StorageError>;

    /// Forget everything (explicit unpair)
    fn clear(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredState {
    #[serde(default)]
    paired: Option<PairedIdentity>,
    #[serde(default)]
    network_address: Option<ResolvedAddress>,
}

/// JSON file in the Good Sleep home directory
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoredState>,
}

impl JsonFileStore {
    /// Open `<home>/device.json`, starting empty when it does not exist
    pub fn open(home: &Path) -> Result<Self, StorageError> {
        let path = home.join("device.json");
        let state = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_json::from_str(&data)?
        } else {
            StoredState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update<F>(&self, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut StoredState),
    {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        f(&mut state);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // write then rename so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&*state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&StoredState) -> T) -> Result<T, StorageError> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(f(&state))
    }
}

impl PersistenceService for JsonFileStore {
    fn load_paired(&self) -> Result<Option<PairedIdentity>, StorageError> {
        self.read(|s| s.paired.clone())
    }

    fn save_paired(&self, identity: &PairedIdentity) -> Result<(), StorageError> {
        self.update(|s| s.paired = Some(identity.clone()))
    }

    fn load_network_address(&self) -> Result<Option<ResolvedAddress>, StorageError> {
        self.read(|s| s.network_address.clone())
    }

    fn save_network_address(&self, address: &ResolvedAddress) -> Result<(), StorageError> {
        self.update(|s| s.network_address = Some(address.clone()))
    }

    fn forget_network_address(&self) -> Result<(), StorageError> {
        self.update(|s| s.network_address = None)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.update(|s| *s = StoredState::default())
    }
}

/// Process-local store, nothing survives a restart
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoredState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceService for MemoryStore {
    fn load_paired(&self) -> Result<Option<PairedIdentity>, StorageError> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(state.paired.clone())
    }

    fn save_paired(&self, identity: &PairedIdentity) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        state.paired = Some(identity.clone());
        Ok(())
    }

    fn load_network_address(&self) -> Result<Option<ResolvedAddress>, StorageError> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(state.network_address.clone())
    }

    fn save_network_address(&self, address: &ResolvedAddress) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        state.network_address = Some(address.clone());
        Ok(())
    }

    fn forget_network_address(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        state.network_address = None;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        *state = StoredState::default();
        Ok(())
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
