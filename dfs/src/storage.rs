use meshos_common::{MeshError, Result, now_millis};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Stat result from the local storage collaborator
#[derive(Debug, Clone)]
pub struct LocalStat {
    pub size: u64,
    pub modified: u64,
    pub is_directory: bool,
    pub permissions: u32,
    pub owner: String,
}

/// Local storage collaborator. The single-node block/inode engine is out
/// of scope; the distributed filesystem drives it through this surface.
pub trait StorageBackend: Send + Sync {
    fn exists(&self, path: &str) -> bool;
    fn read(&self, path: &str) -> Result<Vec<u8>>;
    /// Create or truncate a file.
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    fn mkdir(&self, path: &str) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn list_dir(&self, path: &str) -> Result<Vec<String>>;
    fn remove(&self, path: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn stat(&self, path: &str) -> Result<LocalStat>;
    fn chmod(&self, path: &str, mode: u32) -> Result<()>;
    fn chown(&self, path: &str, owner: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    is_directory: bool,
    permissions: u32,
    owner: String,
    modified: u64,
}

impl Entry {
    fn file(data: Vec<u8>) -> Self {
        Self {
            data,
            is_directory: false,
            permissions: 0o644,
            owner: "root".into(),
            modified: now_millis(),
        }
    }

    fn directory() -> Self {
        Self {
            data: Vec::new(),
            is_directory: true,
            permissions: 0o755,
            owner: "root".into(),
            modified: now_millis(),
        }
    }
}

/// In-memory storage backend, the default when no host filesystem is
/// wired in.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".into()
    } else {
        trimmed.into()
    }
}

impl StorageBackend for MemoryStorage {
    fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        path == "/" || self.entries.read().contains_key(&path)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path);
        let entries = self.entries.read();
        match entries.get(&path) {
            Some(entry) if entry.is_directory => Err(MeshError::NotADirectory { path }),
            Some(entry) => Ok(entry.data.clone()),
            None => Err(MeshError::FileNotFound { path }),
        }
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = normalize(path);
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&path) {
            if entry.is_directory {
                return Err(MeshError::NotADirectory { path });
            }
            entry.data = data.to_vec();
            entry.modified = now_millis();
            return Ok(());
        }
        entries.insert(path, Entry::file(data.to_vec()));
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut entries = self.entries.write();
        if entries.contains_key(&path) {
            return Err(MeshError::FileExists { path });
        }
        entries.insert(path, Entry::directory());
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut entries = self.entries.write();
        let is_directory = match entries.get(&path) {
            Some(entry) => entry.is_directory,
            None => return Err(MeshError::FileNotFound { path }),
        };
        if !is_directory {
            return Err(MeshError::NotADirectory { path });
        }
        let prefix = format!("{path}/");
        if entries.keys().any(|k| k.starts_with(&prefix)) {
            return Err(MeshError::DirectoryNotEmpty { path });
        }
        entries.remove(&path);
        Ok(())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let path = normalize(path);
        let entries = self.entries.read();
        if path != "/" {
            match entries.get(&path) {
                Some(entry) if entry.is_directory => {}
                Some(_) => return Err(MeshError::NotADirectory { path }),
                None => return Err(MeshError::FileNotFound { path }),
            }
        }

        let prefix = if path == "/" { "/".into() } else { format!("{path}/") };
        let mut names: Vec<String> = entries
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn remove(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut entries = self.entries.write();
        let is_directory = match entries.get(&path) {
            Some(entry) => entry.is_directory,
            None => return Err(MeshError::FileNotFound { path }),
        };
        if is_directory {
            return Err(MeshError::NotADirectory { path });
        }
        entries.remove(&path);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize(from);
        let to = normalize(to);
        let mut entries = self.entries.write();
        let entry = entries
            .remove(&from)
            .ok_or(MeshError::FileNotFound { path: from })?;
        entries.insert(to, entry);
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<LocalStat> {
        let path = normalize(path);
        let entries = self.entries.read();
        let entry = entries
            .get(&path)
            .ok_or(MeshError::FileNotFound { path })?;
        Ok(LocalStat {
            size: entry.data.len() as u64,
            modified: entry.modified,
            is_directory: entry.is_directory,
            permissions: entry.permissions,
            owner: entry.owner.clone(),
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let path = normalize(path);
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&path)
            .ok_or(MeshError::FileNotFound { path })?;
        entry.permissions = mode;
        entry.modified = now_millis();
        Ok(())
    }

    fn chown(&self, path: &str, owner: &str) -> Result<()> {
        let path = normalize(path);
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&path)
            .ok_or(MeshError::FileNotFound { path })?;
        entry.owner = owner.to_string();
        entry.modified = now_millis();
        Ok(())
    }
}
