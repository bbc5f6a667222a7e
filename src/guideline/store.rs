//! Sled-backed guideline store with a per-key snapshot cache.
//!
//! Each document address owns its own cache slot and write gate. Readers take
//! the slot's read lock only long enough to clone an `Arc`, so a write to one
//! key never stalls readers of another, and a reader of the written key sees
//! either the old snapshot or the new one.

use crate::chain::Stage;
use crate::error::{GuidelineError, StorageError};
use crate::guideline::version::{
    CurrentPointer, GuidelineDiff, GuidelineVersion, VersionBump, VersionNumber,
};
use crate::guideline::{GuidelineKey, GuidelineKind};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Db, Transactional, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TREE_VERSIONS: &str = "guideline_versions";
const TREE_CURRENT: &str = "guideline_current";
const SEED_AUTHOR: &str = "system";

/// Read-only view of the current version of one document
#[derive(Debug, Clone, PartialEq)]
pub struct GuidelineSnapshot {
    pub key: GuidelineKey,
    pub version: VersionNumber,
    pub content: String,
}

#[derive(Default)]
struct KeySlot {
    snapshot: RwLock<Option<Arc<GuidelineSnapshot>>>,
    write_gate: Mutex<()>,
}

pub struct GuidelineStore {
    versions: Tree,
    current: Tree,
    slots: RwLock<HashMap<GuidelineKey, Arc<KeySlot>>>,
}

impl GuidelineStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GuidelineError> {
        let db = sled::open(path).map_err(|e| {
            StorageError::backend(format!("Failed to open guideline database: {}", e))
        })?;
        Self::new(&db)
    }

    pub fn new(db: &Db) -> Result<Self, GuidelineError> {
        let versions = db.open_tree(TREE_VERSIONS).map_err(StorageError::backend)?;
        let current = db.open_tree(TREE_CURRENT).map_err(StorageError::backend)?;
        Ok(Self {
            versions,
            current,
            slots: RwLock::new(HashMap::new()),
        })
    }

    /// In-memory store, discarded on drop.
    pub fn temporary() -> Result<Self, GuidelineError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StorageError::backend)?;
        Self::new(&db)
    }

    /// Content of the current version.
    pub fn load(&self, kind: GuidelineKind, subject: Option<&str>) -> Result<String, GuidelineError> {
        Ok(self.snapshot(&GuidelineKey::new(kind, subject))?.content.clone())
    }

    /// Current snapshot for `key`, served from cache when possible.
    pub fn snapshot(&self, key: &GuidelineKey) -> Result<Arc<GuidelineSnapshot>, GuidelineError> {
        let slot = self.slot(key);
        if let Some(snapshot) = slot.snapshot.read().clone() {
            return Ok(snapshot);
        }

        // Fill under the gate so a concurrent writer cannot be overwritten
        // by a stale read.
        let _gate = slot.write_gate.lock();
        if let Some(snapshot) = slot.snapshot.read().clone() {
            return Ok(snapshot);
        }
        let pointer = self
            .read_pointer(key)?
            .ok_or_else(|| GuidelineError::NotFound(key.storage_key()))?;
        let record = self.read_version(key, pointer.version)?;
        let snapshot = Arc::new(GuidelineSnapshot {
            key: key.clone(),
            version: record.version,
            content: record.content,
        });
        *slot.snapshot.write() = Some(Arc::clone(&snapshot));
        debug!(key = %key, version = %snapshot.version, "Cached guideline snapshot");
        Ok(snapshot)
    }

    /// Documents a stage renders into its prompt: the global general and
    /// stage documents (both required), each followed by its subject-scoped
    /// variant when one exists.
    pub fn documents_for_stage(
        &self,
        stage: Stage,
        subject: Option<&str>,
    ) -> Result<Vec<Arc<GuidelineSnapshot>>, GuidelineError> {
        let mut documents = Vec::new();
        for kind in GuidelineKind::for_stage(stage) {
            documents.push(self.snapshot(&GuidelineKey::global(kind))?);
            if subject.is_some() {
                let scoped = GuidelineKey::new(kind, subject);
                if scoped.subject.is_some() {
                    match self.snapshot(&scoped) {
                        Ok(doc) => documents.push(doc),
                        Err(GuidelineError::NotFound(_)) => {
                            debug!(key = %scoped, "No subject-scoped guideline")
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(documents)
    }

    /// Append a new version (minor bump, or `1.0` for a new document) and make it current.
    pub fn create_version(
        &self,
        kind: GuidelineKind,
        subject: Option<&str>,
        content: impl Into<String>,
        description: impl Into<String>,
        author: impl Into<String>,
    ) -> Result<GuidelineVersion, GuidelineError> {
        self.create_version_with(
            &GuidelineKey::new(kind, subject),
            content.into(),
            description.into(),
            author.into(),
            VersionBump::Minor,
        )
    }

    pub fn create_version_with(
        &self,
        key: &GuidelineKey,
        content: String,
        description: String,
        author: String,
        bump: VersionBump,
    ) -> Result<GuidelineVersion, GuidelineError> {
        let slot = self.slot(key);
        let _gate = slot.write_gate.lock();

        let version = match self.latest_version(key)? {
            Some(latest) => latest.next(bump),
            None => VersionNumber::INITIAL,
        };
        let record = GuidelineVersion::new(version, content, description, author);
        self.commit(key, &record)?;

        *slot.snapshot.write() = Some(Arc::new(GuidelineSnapshot {
            key: key.clone(),
            version: record.version,
            content: record.content.clone(),
        }));

        info!(
            key = %key,
            version = %record.version,
            author = %record.author,
            content_length = record.content_length,
            "Created guideline version"
        );
        Ok(record)
    }

    /// Restore `target`'s content as a new current version.
    pub fn rollback(
        &self,
        kind: GuidelineKind,
        subject: Option<&str>,
        target: VersionNumber,
    ) -> Result<GuidelineVersion, GuidelineError> {
        let key = GuidelineKey::new(kind, subject);
        let target_record = self.read_version(&key, target)?;
        self.create_version_with(
            &key,
            target_record.content,
            format!("Rollback to version {}", target),
            SEED_AUTHOR.to_string(),
            VersionBump::Minor,
        )
    }

    pub fn compare(
        &self,
        kind: GuidelineKind,
        subject: Option<&str>,
        from: VersionNumber,
        to: VersionNumber,
    ) -> Result<GuidelineDiff, GuidelineError> {
        let key = GuidelineKey::new(kind, subject);
        let from = self.read_version(&key, from)?;
        let to = self.read_version(&key, to)?;
        Ok(GuidelineDiff::between(&from, &to))
    }

    /// Remove a historical version. The current version cannot be deleted.
    pub fn delete_version(
        &self,
        kind: GuidelineKind,
        subject: Option<&str>,
        version: VersionNumber,
    ) -> Result<(), GuidelineError> {
        let key = GuidelineKey::new(kind, subject);
        let slot = self.slot(&key);
        let _gate = slot.write_gate.lock();

        if let Some(pointer) = self.read_pointer(&key)? {
            if pointer.version == version {
                return Err(GuidelineError::DeleteCurrentVersion {
                    key: key.storage_key(),
                    version: version.to_string(),
                });
            }
        }
        let removed = self
            .versions
            .remove(version_key(&key, version).as_bytes())
            .map_err(StorageError::backend)?;
        if removed.is_none() {
            return Err(GuidelineError::VersionNotFound {
                key: key.storage_key(),
                version: version.to_string(),
            });
        }
        self.versions.flush().map_err(StorageError::backend)?;
        info!(key = %key, version = %version, "Deleted guideline version");
        Ok(())
    }

    /// Full history, oldest first.
    pub fn history(
        &self,
        kind: GuidelineKind,
        subject: Option<&str>,
    ) -> Result<Vec<GuidelineVersion>, GuidelineError> {
        let key = GuidelineKey::new(kind, subject);
        let mut out = Vec::new();
        for item in self.versions.scan_prefix(history_prefix(&key).as_bytes()) {
            let (_, value) = item.map_err(StorageError::backend)?;
            let record: GuidelineVersion =
                serde_json::from_slice(&value).map_err(StorageError::encoding)?;
            out.push(record);
        }
        Ok(out)
    }

    pub fn current_version(
        &self,
        kind: GuidelineKind,
        subject: Option<&str>,
    ) -> Result<VersionNumber, GuidelineError> {
        let key = GuidelineKey::new(kind, subject);
        Ok(self.snapshot(&key)?.version)
    }

    pub fn load_version(
        &self,
        kind: GuidelineKind,
        subject: Option<&str>,
        version: VersionNumber,
    ) -> Result<GuidelineVersion, GuidelineError> {
        self.read_version(&GuidelineKey::new(kind, subject), version)
    }

    /// Seed documents from `<dir>/<kind>.md` and `<dir>/subjects/<subject>/<kind>.md`.
    /// Keys that already have history are left untouched.
    pub fn import_directory<P: AsRef<Path>>(&self, dir: P) -> Result<usize, GuidelineError> {
        let dir = dir.as_ref();
        let mut imported = 0usize;
        imported += self.import_files(dir, None)?;

        let subjects_dir = dir.join("subjects");
        if subjects_dir.is_dir() {
            let entries = std::fs::read_dir(&subjects_dir).map_err(StorageError::from)?;
            for entry in entries {
                let entry = entry.map_err(StorageError::from)?;
                if entry.path().is_dir() {
                    let subject = entry.file_name().to_string_lossy().to_string();
                    imported += self.import_files(&entry.path(), Some(&subject))?;
                }
            }
        }
        info!(dir = %dir.display(), imported, "Imported guideline documents");
        Ok(imported)
    }

    fn import_files(&self, dir: &Path, subject: Option<&str>) -> Result<usize, GuidelineError> {
        let mut imported = 0usize;
        for kind in GuidelineKind::ALL {
            let path = dir.join(format!("{}.md", kind.as_str()));
            if !path.is_file() {
                continue;
            }
            let key = GuidelineKey::new(kind, subject);
            if self.latest_version(&key)?.is_some() {
                debug!(key = %key, "Guideline already has history, skipping import");
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(StorageError::from)?;
            if content.trim().is_empty() {
                warn!(path = %path.display(), "Skipping empty guideline file");
                continue;
            }
            self.create_version_with(
                &key,
                content,
                format!("Imported from {}", path.display()),
                SEED_AUTHOR.to_string(),
                VersionBump::Minor,
            )?;
            imported += 1;
        }
        Ok(imported)
    }

    fn slot(&self, key: &GuidelineKey) -> Arc<KeySlot> {
        if let Some(slot) = self.slots.read().get(key) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(key.clone()).or_default())
    }

    fn commit(&self, key: &GuidelineKey, record: &GuidelineVersion) -> Result<(), GuidelineError> {
        let version_bytes = serde_json::to_vec(record).map_err(StorageError::encoding)?;
        let pointer = CurrentPointer {
            version: record.version,
            updated_at: Utc::now(),
        };
        let pointer_bytes = serde_json::to_vec(&pointer).map_err(StorageError::encoding)?;
        let vkey = version_key(key, record.version);
        let ckey = key.storage_key();

        (&self.versions, &self.current)
            .transaction(|(versions, current)| -> ConflictableTransactionResult<(), ()> {
                versions.insert(vkey.as_bytes(), version_bytes.clone())?;
                current.insert(ckey.as_bytes(), pointer_bytes.clone())?;
                Ok(())
            })
            .map_err(|e: TransactionError<()>| StorageError::backend(format!("{:?}", e)))?;
        self.versions.flush().map_err(StorageError::backend)?;
        self.current.flush().map_err(StorageError::backend)?;
        Ok(())
    }

    fn read_pointer(&self, key: &GuidelineKey) -> Result<Option<CurrentPointer>, GuidelineError> {
        let Some(raw) = self
            .current
            .get(key.storage_key().as_bytes())
            .map_err(StorageError::backend)?
        else {
            return Ok(None);
        };
        let pointer = serde_json::from_slice(&raw).map_err(StorageError::encoding)?;
        Ok(Some(pointer))
    }

    fn read_version(
        &self,
        key: &GuidelineKey,
        version: VersionNumber,
    ) -> Result<GuidelineVersion, GuidelineError> {
        let raw = self
            .versions
            .get(version_key(key, version).as_bytes())
            .map_err(StorageError::backend)?
            .ok_or_else(|| GuidelineError::VersionNotFound {
                key: key.storage_key(),
                version: version.to_string(),
            })?;
        Ok(serde_json::from_slice(&raw).map_err(StorageError::encoding)?)
    }

    fn latest_version(&self, key: &GuidelineKey) -> Result<Option<VersionNumber>, GuidelineError> {
        let pointer = self.read_pointer(key)?.map(|p| p.version);
        let newest_record = match self
            .versions
            .scan_prefix(history_prefix(key).as_bytes())
            .next_back()
        {
            Some(item) => {
                let (_, value) = item.map_err(StorageError::backend)?;
                let record: GuidelineVersion =
                    serde_json::from_slice(&value).map_err(StorageError::encoding)?;
                Some(record.version)
            }
            None => None,
        };
        Ok(pointer.max(newest_record))
    }
}

fn history_prefix(key: &GuidelineKey) -> String {
    format!("{}\u{1f}", key.storage_key())
}

fn version_key(key: &GuidelineKey, version: VersionNumber) -> String {
    format!("{}{}", history_prefix(key), version.sort_key())
}
