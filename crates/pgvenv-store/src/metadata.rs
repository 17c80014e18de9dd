use crate::layout::RegistryLayout;
use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EnvState {
    Absent,
    Created,
    Built,
    Installed,
    Initialized,
    Running,
    Stopped,
}

impl EnvState {
    /// Position along the provisioning pipeline. `Running` and `Stopped` share
    /// the last rung: both require an initialized data directory.
    pub fn rank(self) -> u8 {
        match self {
            EnvState::Absent => 0,
            EnvState::Created => 1,
            EnvState::Built => 2,
            EnvState::Installed => 3,
            EnvState::Initialized => 4,
            EnvState::Running | EnvState::Stopped => 5,
        }
    }

    #[inline]
    pub fn at_least(self, other: EnvState) -> bool {
        self.rank() >= other.rank()
    }
}

impl std::fmt::Display for EnvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvState::Absent => write!(f, "absent"),
            EnvState::Created => write!(f, "created"),
            EnvState::Built => write!(f, "built"),
            EnvState::Installed => write!(f, "installed"),
            EnvState::Initialized => write!(f, "initialized"),
            EnvState::Running => write!(f, "running"),
            EnvState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VenvMetadata {
    pub name: String,
    /// Last lifecycle state reached through an explicit action.
    pub state: EnvState,
    pub port: u16,
    pub source_ref: String,
    /// `git describe` of the provisioned revision, when available.
    #[serde(default)]
    pub source_revision: Option<String>,
    pub source_dir: String,
    #[serde(default)]
    pub configure_options: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl VenvMetadata {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Reads and writes `<root>/<name>/pgvenv.json`.
pub struct MetadataStore {
    layout: RegistryLayout,
}

impl MetadataStore {
    pub fn new(layout: RegistryLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, meta: &VenvMetadata) -> Result<(), StoreError> {
        let dir = self.layout.venv_path(&meta.name);
        let dest = self.layout.metadata_file(&meta.name);

        let mut meta_with_checksum = meta.clone();
        meta_with_checksum.checksum = Some(meta_with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&meta_with_checksum)?;

        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<VenvMetadata, StoreError> {
        let path = self.layout.metadata_file(name);
        if !path.exists() {
            return Err(StoreError::NotFound(name.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let meta: VenvMetadata = serde_json::from_str(&content)?;

        if let Some(ref expected) = meta.checksum {
            let actual = meta.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    name: name.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(meta)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.layout.metadata_file(name).exists()
    }

    pub fn update_state(&self, name: &str, new_state: EnvState) -> Result<(), StoreError> {
        let mut meta = self.get(name)?;
        meta.state = new_state;
        meta.updated_at = chrono::Utc::now().to_rfc3339();
        self.put(&meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metadata_store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = RegistryLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, MetadataStore::new(layout))
    }

    fn sample_meta() -> VenvMetadata {
        VenvMetadata {
            name: "alpha".to_owned(),
            state: EnvState::Created,
            port: 24285,
            source_ref: "HEAD".to_owned(),
            source_revision: Some("REL_16_2-12-gabcdef".to_owned()),
            source_dir: "/src/postgresql".to_owned(),
            configure_options: vec!["--enable-debug".to_owned()],
            created_at: "2025-01-01T00:00:00Z".to_owned(),
            updated_at: "2025-01-01T00:00:00Z".to_owned(),
            checksum: None,
        }
    }

    #[test]
    fn metadata_roundtrip() {
        let (_dir, store) = test_metadata_store();
        let meta = sample_meta();
        store.put(&meta).unwrap();
        let retrieved = store.get("alpha").unwrap();
        assert_eq!(retrieved.name, meta.name);
        assert_eq!(retrieved.state, meta.state);
        assert_eq!(retrieved.configure_options, meta.configure_options);
        assert!(retrieved.checksum.is_some(), "put() must embed a checksum");
    }

    #[test]
    fn state_update_persists() {
        let (_dir, store) = test_metadata_store();
        store.put(&sample_meta()).unwrap();
        store.update_state("alpha", EnvState::Built).unwrap();
        assert_eq!(store.get("alpha").unwrap().state, EnvState::Built);
    }

    #[test]
    fn missing_metadata_is_not_found() {
        let (_dir, store) = test_metadata_store();
        assert!(!store.exists("ghost"));
        assert!(matches!(store.get("ghost"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn tampered_metadata_fails_checksum() {
        let (dir, store) = test_metadata_store();
        store.put(&sample_meta()).unwrap();
        let path = dir.path().join("alpha").join(crate::METADATA_FILE);
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"created\"", "\"running\"")).unwrap();
        assert!(matches!(
            store.get("alpha"),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&EnvState::Initialized).unwrap();
        assert_eq!(json, "\"initialized\"");
    }

    #[test]
    fn state_ordering() {
        assert!(EnvState::Installed.at_least(EnvState::Built));
        assert!(EnvState::Stopped.at_least(EnvState::Initialized));
        assert!(EnvState::Running.at_least(EnvState::Stopped));
        assert!(!EnvState::Created.at_least(EnvState::Built));
        assert!(!EnvState::Absent.at_least(EnvState::Created));
    }
}
