//! Key-value storage for session data with an in-memory fallback.
//!
//! [`StorageAdapter`] never returns an error to its caller. If the durable
//! backing store fails (at the construction check or on any later call), the
//! failure is logged once and the adapter switches to a process-local map for
//! the rest of its lifetime. Entries the durable store already held are
//! carried over into that map, so a stored session survives the switch.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Storage key holding the current bearer credential.
pub const ACCESS_TOKEN_KEY: &str = "access_token";

const SESSION_FILE: &str = "session.json";
const SENTINEL_KEY: &str = "__feedback_storage_sentinel__";

/// Where the session file lives when no directory is given:
/// `$FEEDBACK_STATE_DIR`, else `$XDG_STATE_HOME/feedback`, else
/// `~/.local/state/feedback`.
pub fn default_state_dir() -> Result<PathBuf> {
    resolve_state_dir(|name| std::env::var(name).ok())
        .context("cannot locate a state directory; set FEEDBACK_STATE_DIR or HOME")
}

fn resolve_state_dir(env: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let lookup = |name: &str| env(name).filter(|value| !value.is_empty());
    if let Some(dir) = lookup("FEEDBACK_STATE_DIR") {
        return Some(PathBuf::from(dir));
    }
    if let Some(xdg) = lookup("XDG_STATE_HOME") {
        return Some(PathBuf::from(xdg).join("feedback"));
    }
    lookup("HOME").map(|home| PathBuf::from(home).join(".local/state/feedback"))
}

/// A durable key-value store. Any call may fail.
pub trait BackingStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
    fn clear(&mut self) -> Result<()>;

    /// Entries still readable without touching the medium. Used to seed the
    /// in-memory fallback when the store is abandoned.
    fn snapshot(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// String map persisted as a single JSON object under the state directory.
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStore {
    /// Like [`open`](Self::open), but creates `state_dir` first if it is
    /// missing. A directory created here is restricted to the owner; an
    /// existing one is left as it is.
    pub fn create(state_dir: &Path) -> Result<Self> {
        if !state_dir.exists() {
            std::fs::create_dir_all(state_dir)
                .with_context(|| format!("failed to create {}", state_dir.display()))?;
            #[cfg(unix)]
            {
                std::fs::set_permissions(state_dir, std::fs::Permissions::from_mode(0o700))
                    .with_context(|| {
                        format!("failed to set permissions on {}", state_dir.display())
                    })?;
            }
        }
        Self::open(state_dir)
    }

    /// Load `session.json` from `state_dir`, or start empty.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(SESSION_FILE);
        let entries = if path.exists() {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("invalid {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        #[cfg(unix)]
        {
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions on {}", tmp.display()))?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))
    }
}

impl BackingStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        self.save()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save()
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

struct Inner {
    durable: Option<Box<dyn BackingStore>>,
    memory: HashMap<String, String>,
}

impl Inner {
    fn demote(&mut self, op: &str, err: &anyhow::Error) {
        let Some(store) = self.durable.take() else {
            return;
        };
        let carried: Vec<_> = store
            .snapshot()
            .into_iter()
            .filter(|(key, _)| key != SENTINEL_KEY)
            .collect();
        tracing::warn!(
            op,
            carried = carried.len(),
            error = %format!("{err:#}"),
            "durable storage unavailable, using in-memory fallback"
        );
        for (key, value) in carried {
            self.memory.entry(key).or_insert(value);
        }
    }
}

/// Storage used by the session layer and the transport guard.
pub struct StorageAdapter {
    inner: Mutex<Inner>,
}

impl StorageAdapter {
    /// Wrap a durable store, checking it first with a sentinel write.
    pub fn new(store: Box<dyn BackingStore>) -> Self {
        let mut inner = Inner {
            durable: Some(store),
            memory: HashMap::new(),
        };
        if let Some(store) = inner.durable.as_mut() {
            let check = store
                .set(SENTINEL_KEY, "1")
                .and_then(|()| store.remove(SENTINEL_KEY));
            if let Err(e) = check {
                inner.demote("sentinel", &e);
            }
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Open (creating if needed) a [`FileStore`] under `state_dir`; falls
    /// back to memory if that fails.
    pub fn open(state_dir: &Path) -> Self {
        match FileStore::create(state_dir) {
            Ok(store) => Self::new(Box::new(store)),
            Err(e) => {
                tracing::warn!(
                    error = %format!("{e:#}"),
                    "failed to open session store, using in-memory fallback"
                );
                Self::in_memory()
            }
        }
    }

    /// An adapter with no durable backing at all.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                durable: None,
                memory: HashMap::new(),
            }),
        }
    }

    /// Whether reads and writes still reach the durable store.
    pub fn is_durable(&self) -> bool {
        self.lock().durable.is_some()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.lock();
        if let Some(store) = inner.durable.as_ref() {
            match store.get(key) {
                Ok(value) => return value,
                Err(e) => inner.demote("get", &e),
            }
        }
        inner.memory.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        let mut inner = self.lock();
        if let Some(store) = inner.durable.as_mut() {
            match store.set(key, value) {
                Ok(()) => return,
                Err(e) => inner.demote("set", &e),
            }
        }
        inner.memory.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.lock();
        if let Some(store) = inner.durable.as_mut()
            && let Err(e) = store.remove(key)
        {
            inner.demote("remove", &e);
        }
        inner.memory.remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        if let Some(store) = inner.durable.as_mut()
            && let Err(e) = store.clear()
        {
            inner.demote("clear", &e);
        }
        inner.memory.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned map is still a valid map.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
