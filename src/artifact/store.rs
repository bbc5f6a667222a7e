//! Artifact persistence boundary.
//!
//! The pipeline only saves and loads; every save is durable before it returns.

use crate::artifact::types::{CurriculumScheme, LessonContent, LessonPlanSet};
use crate::error::StorageError;
use crate::types::{LessonId, RunKey};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const TREE_CURRICULA: &str = "curricula";
const TREE_LESSON_PLANS: &str = "lesson_plans";
const TREE_LESSON_CONTENT: &str = "lesson_content";
const LESSON_KEY_PAD: usize = 10;

pub trait ArtifactStore: Send + Sync {
    fn save_curriculum(&self, key: &RunKey, scheme: &CurriculumScheme)
        -> Result<(), StorageError>;

    fn load_curriculum(&self, key: &RunKey) -> Result<Option<CurriculumScheme>, StorageError>;

    fn save_lesson_plans(&self, key: &RunKey, plans: &LessonPlanSet) -> Result<(), StorageError>;

    fn load_lesson_plans(&self, key: &RunKey) -> Result<Option<LessonPlanSet>, StorageError>;

    fn save_lesson_content(
        &self,
        key: &RunKey,
        lesson_id: LessonId,
        content: &LessonContent,
    ) -> Result<(), StorageError>;

    fn load_lesson_content(
        &self,
        key: &RunKey,
        lesson_id: LessonId,
    ) -> Result<Option<LessonContent>, StorageError>;

    /// All saved lesson content for a key, ordered by lesson id.
    fn list_lesson_content(&self, key: &RunKey) -> Result<Vec<LessonContent>, StorageError>;

    /// Drop every lesson content record of a key; returns how many were removed.
    fn clear_lesson_content(&self, key: &RunKey) -> Result<usize, StorageError>;
}

/// Sled-backed artifact store
#[derive(Clone)]
pub struct SledArtifactStore {
    curricula: Tree,
    plans: Tree,
    contents: Tree,
}

impl SledArtifactStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| {
            StorageError::backend(format!("Failed to open artifact database: {}", e))
        })?;
        Self::new(db)
    }

    pub fn new(db: Db) -> Result<Self, StorageError> {
        let curricula = db.open_tree(TREE_CURRICULA).map_err(StorageError::backend)?;
        let plans = db.open_tree(TREE_LESSON_PLANS).map_err(StorageError::backend)?;
        let contents = db
            .open_tree(TREE_LESSON_CONTENT)
            .map_err(StorageError::backend)?;
        Ok(Self {
            curricula,
            plans,
            contents,
        })
    }

    fn put<T: Serialize>(&self, tree: &Tree, key: &[u8], value: &T) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(value).map_err(StorageError::encoding)?;
        tree.insert(key, encoded).map_err(StorageError::backend)?;
        tree.flush().map_err(StorageError::backend)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, tree: &Tree, key: &[u8]) -> Result<Option<T>, StorageError> {
        let Some(raw) = tree.get(key).map_err(StorageError::backend)? else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&raw).map_err(StorageError::encoding)?;
        Ok(Some(parsed))
    }
}

fn owner_key(key: &RunKey) -> String {
    format!("{}\u{1f}{}", key.user, key.subject)
}

fn content_prefix(key: &RunKey) -> String {
    format!("{}\u{1f}", owner_key(key))
}

fn lesson_key(key: &RunKey, lesson_id: LessonId) -> String {
    format!("{}{lesson_id:0LESSON_KEY_PAD$}", content_prefix(key))
}

impl ArtifactStore for SledArtifactStore {
    fn save_curriculum(
        &self,
        key: &RunKey,
        scheme: &CurriculumScheme,
    ) -> Result<(), StorageError> {
        self.put(&self.curricula, owner_key(key).as_bytes(), scheme)
    }

    fn load_curriculum(&self, key: &RunKey) -> Result<Option<CurriculumScheme>, StorageError> {
        self.get(&self.curricula, owner_key(key).as_bytes())
    }

    fn save_lesson_plans(&self, key: &RunKey, plans: &LessonPlanSet) -> Result<(), StorageError> {
        self.put(&self.plans, owner_key(key).as_bytes(), plans)
    }

    fn load_lesson_plans(&self, key: &RunKey) -> Result<Option<LessonPlanSet>, StorageError> {
        self.get(&self.plans, owner_key(key).as_bytes())
    }

    fn save_lesson_content(
        &self,
        key: &RunKey,
        lesson_id: LessonId,
        content: &LessonContent,
    ) -> Result<(), StorageError> {
        if content.lesson_id != lesson_id {
            return Err(StorageError::InvalidKey(format!(
                "content for lesson {} saved under lesson {}",
                content.lesson_id, lesson_id
            )));
        }
        self.put(&self.contents, lesson_key(key, lesson_id).as_bytes(), content)
    }

    fn load_lesson_content(
        &self,
        key: &RunKey,
        lesson_id: LessonId,
    ) -> Result<Option<LessonContent>, StorageError> {
        self.get(&self.contents, lesson_key(key, lesson_id).as_bytes())
    }

    fn list_lesson_content(&self, key: &RunKey) -> Result<Vec<LessonContent>, StorageError> {
        let prefix = content_prefix(key);
        let mut out = Vec::new();
        for item in self.contents.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item.map_err(StorageError::backend)?;
            let content: LessonContent =
                serde_json::from_slice(&value).map_err(StorageError::encoding)?;
            out.push(content);
        }
        out.sort_by_key(|c| c.lesson_id);
        Ok(out)
    }

    fn clear_lesson_content(&self, key: &RunKey) -> Result<usize, StorageError> {
        let prefix = content_prefix(key);
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for item in self.contents.scan_prefix(prefix.as_bytes()) {
            let (stored_key, _) = item.map_err(StorageError::backend)?;
            batch.remove(stored_key);
            removed += 1;
        }
        self.contents
            .apply_batch(batch)
            .map_err(StorageError::backend)?;
        self.contents.flush().map_err(StorageError::backend)?;
        Ok(removed)
    }
}

/// In-process artifact store
#[derive(Default)]
pub struct MemoryArtifactStore {
    curricula: RwLock<HashMap<RunKey, CurriculumScheme>>,
    plans: RwLock<HashMap<RunKey, LessonPlanSet>>,
    contents: RwLock<HashMap<RunKey, BTreeMap<LessonId, LessonContent>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lesson_content_count(&self, key: &RunKey) -> usize {
        self.contents.read().get(key).map(|m| m.len()).unwrap_or(0)
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn save_curriculum(
        &self,
        key: &RunKey,
        scheme: &CurriculumScheme,
    ) -> Result<(), StorageError> {
        self.curricula.write().insert(key.clone(), scheme.clone());
        Ok(())
    }

    fn load_curriculum(&self, key: &RunKey) -> Result<Option<CurriculumScheme>, StorageError> {
        Ok(self.curricula.read().get(key).cloned())
    }

    fn save_lesson_plans(&self, key: &RunKey, plans: &LessonPlanSet) -> Result<(), StorageError> {
        self.plans.write().insert(key.clone(), plans.clone());
        Ok(())
    }

    fn load_lesson_plans(&self, key: &RunKey) -> Result<Option<LessonPlanSet>, StorageError> {
        Ok(self.plans.read().get(key).cloned())
    }

    fn save_lesson_content(
        &self,
        key: &RunKey,
        lesson_id: LessonId,
        content: &LessonContent,
    ) -> Result<(), StorageError> {
        if content.lesson_id != lesson_id {
            return Err(StorageError::InvalidKey(format!(
                "content for lesson {} saved under lesson {}",
                content.lesson_id, lesson_id
            )));
        }
        self.contents
            .write()
            .entry(key.clone())
            .or_default()
            .insert(lesson_id, content.clone());
        Ok(())
    }

    fn load_lesson_content(
        &self,
        key: &RunKey,
        lesson_id: LessonId,
    ) -> Result<Option<LessonContent>, StorageError> {
        Ok(self
            .contents
            .read()
            .get(key)
            .and_then(|m| m.get(&lesson_id))
            .cloned())
    }

    fn list_lesson_content(&self, key: &RunKey) -> Result<Vec<LessonContent>, StorageError> {
        Ok(self
            .contents
            .read()
            .get(key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn clear_lesson_content(&self, key: &RunKey) -> Result<usize, StorageError> {
        Ok(self
            .contents
            .write()
            .remove(key)
            .map(|m| m.len())
            .unwrap_or(0))
    }
}
