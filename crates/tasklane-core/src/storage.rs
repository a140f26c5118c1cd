use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const AUTH_TOKEN_KEY: &str = "auth_token";
pub const CONVERSATION_KEY: &str = "conversation_id";

const STATE_FILE_NAME: &str = "client_state.json";

/// Client-local key/value storage: the bearer token and the selected
/// conversation live here across runs.
pub trait ClientStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One JSON object in the data directory, rewritten atomically on every
/// change. The lock serializes writers within the process.
#[derive(Debug)]
pub struct FileStorage {
    pub path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let path = data_dir.join(STATE_FILE_NAME);
        let entries = load_entries(&path)?;

        info!(
            path = %path.display(),
            keys = entries.len(),
            "opened client storage"
        );

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn write_with<F>(&self, mutate: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        mutate(&mut next);
        save_entries_atomic(&self.path, &next)?;
        *entries = next;
        Ok(())
    }
}

impl ClientStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    #[tracing::instrument(skip(self, value))]
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.write_with(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
        .with_context(|| format!("failed to store {key}"))
    }

    #[tracing::instrument(skip(self))]
    fn remove(&self, key: &str) -> anyhow::Result<()> {
        if !self.entries.lock().contains_key(key) {
            return Ok(());
        }
        self.write_with(|entries| {
            entries.remove(key);
        })
        .with_context(|| format!("failed to remove {key}"))
    }
}

#[tracing::instrument(skip(path))]
fn load_entries(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    if !path.exists() {
        debug!(file = %path.display(), "no client state yet");
        return Ok(BTreeMap::new());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    match serde_json::from_str(&raw) {
        Ok(entries) => Ok(entries),
        Err(err) => {
            warn!(
                file = %path.display(),
                error = %err,
                "client state is corrupt; starting empty"
            );
            Ok(BTreeMap::new())
        }
    }
}

#[tracing::instrument(skip(path, entries))]
fn save_entries_atomic(path: &Path, entries: &BTreeMap<String, String>) -> anyhow::Result<()> {
    debug!(file = %path.display(), count = entries.len(), "saving client state atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    let serialized = serde_json::to_string_pretty(entries)?;
    writeln!(temp, "{serialized}")?;
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}
