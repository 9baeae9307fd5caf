use super::SessionError;
use super::state::PersistedSession;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// JSON file holding the last persisted session.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when no session has been persisted yet.
    pub fn load(&self) -> Result<Option<PersistedSession>, SessionError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| SessionError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Replaces the file atomically: write a sibling temp file, sync, rename.
    pub fn save(&self, session: &PersistedSession) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec_pretty(session).map_err(SessionError::Serialize)?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(index: u32) -> PersistedSession {
        PersistedSession {
            user_id: "user-1".to_string(),
            session_id: format!("session-{index}"),
            previous_session_id: None,
            session_index: index,
        }
    }

    #[test]
    fn test_missing_file_loads_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path().join("session.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path().join("nested").join("session.json"));
        store.save(&session(4)).unwrap();
        assert_eq!(store.load().unwrap(), Some(session(4)));
        assert!(!temp_dir.path().join("nested").join("session.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = SessionStore::new(&path);
        assert!(matches!(store.load(), Err(SessionError::Corrupt { .. })));
    }
}
