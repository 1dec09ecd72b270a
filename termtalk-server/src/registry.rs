//! Room registry: where a room id can be looked up to find its host.
//!
//! The host puts an entry when its room goes live and deletes it at
//! teardown. A joiner looks the id up; a miss means the room is unknown or
//! expired, and the caller decides what to do next.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use termtalk_core::RoomId;
use thiserror::Error;

/// File name of the per-user registry, relative to the home directory.
pub const REGISTRY_FILE_NAME: &str = ".termtalk_rooms.json";

/// Errors from a registry backend.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backing file could not be read or written.
    #[error("registry i/o: {0}")]
    Io(#[from] io::Error),

    /// An entry could not be serialized.
    #[error("registry encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Where to reach a room's host, and until when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEntry {
    /// Host address as advertised by the host.
    #[serde(rename = "host_ip")]
    pub host_address: String,
    /// Host port.
    pub host_port: u16,
    /// Expiry as Unix seconds.
    pub expires_at: u64,
}

impl RoomEntry {
    /// Entry that expires `ttl` from now.
    pub fn new(host_address: impl Into<String>, host_port: u16, ttl: Duration) -> Self {
        Self {
            host_address: host_address.into(),
            host_port,
            expires_at: unix_now().saturating_add(ttl.as_secs()),
        }
    }

    /// Whether the entry has expired at `now` (Unix seconds).
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// `host:port` to dial.
    pub fn dial_address(&self) -> String {
        format!("{}:{}", self.host_address, self.host_port)
    }
}

/// Current time as Unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Key-value store of live rooms.
pub trait RegistryStore: Send + Sync {
    /// Insert or replace the entry for `room`.
    fn put(&self, room: &RoomId, entry: RoomEntry) -> Result<(), RegistryError>;

    /// Look `room` up. Expired entries are reported as missing.
    fn get(&self, room: &RoomId) -> Result<Option<RoomEntry>, RegistryError>;

    /// Remove `room`. Removing a missing room is not an error.
    fn delete(&self, room: &RoomId) -> Result<(), RegistryError>;

    /// Whether `room` has a live entry. Backend errors count as absent.
    fn contains(&self, room: &RoomId) -> bool {
        matches!(self.get(room), Ok(Some(_)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    rooms: Mutex<HashMap<RoomId, RoomEntry>>,
}

impl MemoryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        lock(&self.rooms).len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryStore for MemoryRegistry {
    fn put(&self, room: &RoomId, entry: RoomEntry) -> Result<(), RegistryError> {
        lock(&self.rooms).insert(*room, entry);
        Ok(())
    }

    fn get(&self, room: &RoomId) -> Result<Option<RoomEntry>, RegistryError> {
        let mut rooms = lock(&self.rooms);
        match rooms.get(room) {
            Some(entry) if entry.is_expired_at(unix_now()) => {
                rooms.remove(room);
                Ok(None)
            }
            found => Ok(found.cloned()),
        }
    }

    fn delete(&self, room: &RoomId) -> Result<(), RegistryError> {
        lock(&self.rooms).remove(room);
        Ok(())
    }
}

/// Registry kept in a JSON file, readable only by its owner.
///
/// The whole map is read and rewritten on every change. An unreadable or
/// corrupt file is treated as empty.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileRegistry {
    /// Registry at `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Registry at `~/.termtalk_rooms.json` under `home`.
    pub fn in_home(home: &Path) -> Self {
        Self::new(home.join(REGISTRY_FILE_NAME))
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> HashMap<String, RoomEntry> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "registry unreadable");
                return HashMap::new();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "registry corrupt, ignoring");
            HashMap::new()
        })
    }

    fn write_all(&self, rooms: &HashMap<String, RoomEntry>) -> Result<(), RegistryError> {
        let json = serde_json::to_vec_pretty(rooms)?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        // `mode` only applies on creation.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    }
}

impl RegistryStore for FileRegistry {
    fn put(&self, room: &RoomId, entry: RoomEntry) -> Result<(), RegistryError> {
        let _guard = lock(&self.guard);
        let mut rooms = self.read_all();
        rooms.insert(room.to_string(), entry);
        self.write_all(&rooms)
    }

    fn get(&self, room: &RoomId) -> Result<Option<RoomEntry>, RegistryError> {
        let _guard = lock(&self.guard);
        let mut rooms = self.read_all();
        let key = room.to_string();
        match rooms.get(&key) {
            Some(entry) if entry.is_expired_at(unix_now()) => {
                rooms.remove(&key);
                self.write_all(&rooms)?;
                Ok(None)
            }
            found => Ok(found.cloned()),
        }
    }

    fn delete(&self, room: &RoomId) -> Result<(), RegistryError> {
        let _guard = lock(&self.guard);
        let mut rooms = self.read_all();
        if rooms.remove(&room.to_string()).is_some() {
            self.write_all(&rooms)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(expires_at: u64) -> RoomEntry {
        RoomEntry {
            host_address: "127.0.0.1".into(),
            host_port: 12345,
            expires_at,
        }
    }

    #[test]
    fn test_memory_put_get_delete() {
        let registry = MemoryRegistry::new();
        let room = RoomId::generate();
        let live = RoomEntry::new("127.0.0.1", 4000, Duration::from_secs(60));

        assert_eq!(registry.get(&room).unwrap(), None);
        registry.put(&room, live.clone()).unwrap();
        assert_eq!(registry.get(&room).unwrap(), Some(live));
        assert!(registry.contains(&room));

        registry.delete(&room).unwrap();
        assert!(!registry.contains(&room));
        registry.delete(&room).unwrap();
    }

    #[test]
    fn test_memory_drops_expired() {
        let registry = MemoryRegistry::new();
        let room = RoomId::generate();
        registry.put(&room, entry(unix_now().saturating_sub(1))).unwrap();
        assert_eq!(registry.get(&room).unwrap(), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_entry_helpers() {
        let e = entry(100);
        assert!(!e.is_expired_at(99));
        assert!(e.is_expired_at(100));
        assert_eq!(e.dial_address(), "127.0.0.1:12345");
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::in_home(dir.path());
        let room = RoomId::generate();
        let live = RoomEntry::new("10.0.0.5", 5000, Duration::from_secs(60));

        registry.put(&room, live.clone()).unwrap();

        // A second handle on the same file sees the entry.
        let other = FileRegistry::new(registry.path());
        assert_eq!(other.get(&room).unwrap(), Some(live));

        let raw = fs::read_to_string(registry.path()).unwrap();
        assert!(raw.contains("host_ip"));
        assert!(raw.contains(&room.to_string()));

        other.delete(&room).unwrap();
        assert_eq!(registry.get(&room).unwrap(), None);
    }

    #[test]
    fn test_file_drops_expired_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::in_home(dir.path());
        let stale = RoomId::generate();
        let live = RoomId::generate();

        registry.put(&stale, entry(unix_now().saturating_sub(5))).unwrap();
        registry
            .put(&live, RoomEntry::new("127.0.0.1", 1, Duration::from_secs(60)))
            .unwrap();

        assert_eq!(registry.get(&stale).unwrap(), None);
        let raw = fs::read_to_string(registry.path()).unwrap();
        assert!(!raw.contains(&stale.to_string()));
        assert!(raw.contains(&live.to_string()));
    }

    #[test]
    fn test_file_corrupt_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::in_home(dir.path());
        fs::write(registry.path(), b"{ not json").unwrap();

        let room = RoomId::generate();
        assert_eq!(registry.get(&room).unwrap(), None);

        // Writing replaces the corrupt content.
        registry
            .put(&room, RoomEntry::new("127.0.0.1", 1, Duration::from_secs(60)))
            .unwrap();
        assert!(registry.contains(&room));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::in_home(dir.path());
        fs::write(registry.path(), b"{}").unwrap();
        fs::set_permissions(registry.path(), fs::Permissions::from_mode(0o644)).unwrap();

        registry
            .put(&RoomId::generate(), RoomEntry::new("127.0.0.1", 1, Duration::from_secs(60)))
            .unwrap();
        let mode = fs::metadata(registry.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
