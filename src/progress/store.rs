//! Durable sled-backed run records and run event log.

use chrono::Utc;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use crate::error::{FailureKind, RunError, StorageError};
use crate::progress::event::{now_millis, RunEvent};
use crate::progress::tracker::{PipelineRun, RunStatus};
use crate::types::RunId;

const TREE_RUNS: &str = "pipeline_runs";
const TREE_EVENTS: &str = "pipeline_run_events";
const EVENT_KEY_PAD: usize = 20;

/// Retention for terminal runs
#[derive(Debug, Clone, Copy)]
pub struct PrunePolicy {
    pub max_terminal: usize,
    pub max_age_ms: u64,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            max_terminal: 500,
            max_age_ms: 1000 * 60 * 60 * 24 * 14,
        }
    }
}

#[derive(Clone)]
pub struct RunStore {
    db: Db,
    runs: Tree,
    events: Tree,
}

impl RunStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)
            .map_err(|e| StorageError::backend(format!("Failed to open run database: {}", e)))?;
        Self::new(db)
    }

    pub fn new(db: Db) -> Result<Self, StorageError> {
        let runs = db.open_tree(TREE_RUNS).map_err(StorageError::backend)?;
        let events = db.open_tree(TREE_EVENTS).map_err(StorageError::backend)?;
        Ok(Self { db, runs, events })
    }

    pub fn shared(db: Db) -> Result<Arc<Self>, StorageError> {
        Ok(Arc::new(Self::new(db)?))
    }

    pub fn put_run(&self, run: &PipelineRun) -> Result<(), StorageError> {
        let value = serde_json::to_vec(run).map_err(StorageError::encoding)?;
        self.runs
            .insert(run.run_id.as_str().as_bytes(), value)
            .map_err(StorageError::backend)?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Option<PipelineRun>, StorageError> {
        let Some(raw) = self
            .runs
            .get(run_id.as_str().as_bytes())
            .map_err(StorageError::backend)?
        else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&raw).map_err(StorageError::encoding)?;
        Ok(Some(parsed))
    }

    /// Every stored run, newest first.
    pub fn list_runs(&self) -> Result<Vec<PipelineRun>, StorageError> {
        let mut out = Vec::new();
        for result in self.runs.iter() {
            let (_, value) = result.map_err(StorageError::backend)?;
            let run: PipelineRun = serde_json::from_slice(&value).map_err(StorageError::encoding)?;
            out.push(run);
        }
        out.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        Ok(out)
    }

    pub fn list_runs_for_user(&self, user: &str) -> Result<Vec<PipelineRun>, StorageError> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|r| r.user == user)
            .collect())
    }

    pub fn append_event(&self, event: &RunEvent) -> Result<(), StorageError> {
        let key = encode_event_key(&event.run_id, event.seq);
        let value = serde_json::to_vec(event).map_err(StorageError::encoding)?;
        self.events
            .insert(key.as_bytes(), value)
            .map_err(StorageError::backend)?;
        Ok(())
    }

    pub fn read_events(&self, run_id: &RunId) -> Result<Vec<RunEvent>, StorageError> {
        self.read_events_after(run_id, 0)
    }

    pub fn read_events_after(
        &self,
        run_id: &RunId,
        after_seq: u64,
    ) -> Result<Vec<RunEvent>, StorageError> {
        let prefix = format!("{}:", run_id.as_str());
        let mut out = Vec::new();
        for result in self.events.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result.map_err(StorageError::backend)?;
            let parsed: RunEvent = serde_json::from_slice(&value).map_err(StorageError::encoding)?;
            if parsed.seq > after_seq {
                out.push(parsed);
            }
        }
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }

    /// Fail runs a previous process left non-terminal.
    pub fn mark_interrupted_runs(&self) -> Result<usize, StorageError> {
        let mut changed = 0usize;
        for mut run in self.list_runs()? {
            if run.status.is_terminal() {
                continue;
            }
            let previous = run.status;
            run.status = RunStatus::Failed;
            run.current_step = format!("Interrupted while {}", previous.describe());
            run.completed_at = Some(Utc::now());
            run.error = Some(RunError {
                kind: FailureKind::Interrupted,
                message: format!(
                    "run was interrupted by a process restart while {}",
                    previous.describe()
                ),
                attempts: None,
                lesson_id: None,
            });
            self.put_run(&run)?;
            changed += 1;
        }
        self.flush()?;
        Ok(changed)
    }

    /// Drop terminal runs older than the policy age, then keep at most
    /// `max_terminal` of the remaining ones.
    pub fn prune(&self, policy: PrunePolicy) -> Result<usize, StorageError> {
        self.prune_terminal(policy.max_terminal, policy.max_age_ms, now_millis())
    }

    pub fn prune_terminal(
        &self,
        max_terminal: usize,
        max_age_ms: u64,
        now_ms: u64,
    ) -> Result<usize, StorageError> {
        let terminal = |runs: Vec<PipelineRun>| -> Vec<PipelineRun> {
            runs.into_iter().filter(|r| r.status.is_terminal()).collect()
        };

        let mut removed = 0usize;
        for run in terminal(self.list_runs()?) {
            let ended = run.completed_at.unwrap_or(run.started_at).timestamp_millis();
            let age = now_ms.saturating_sub(ended.max(0) as u64);
            if age > max_age_ms {
                self.delete_run(&run.run_id)?;
                removed += 1;
            }
        }

        // list_runs is newest first
        let remaining = terminal(self.list_runs()?);
        for run in remaining.iter().skip(max_terminal) {
            self.delete_run(&run.run_id)?;
            removed += 1;
        }

        self.flush()?;
        Ok(removed)
    }

    pub fn delete_run(&self, run_id: &RunId) -> Result<(), StorageError> {
        self.runs
            .remove(run_id.as_str().as_bytes())
            .map_err(StorageError::backend)?;
        let prefix = format!("{}:", run_id.as_str());
        let keys: Vec<Vec<u8>> = self
            .events
            .scan_prefix(prefix.as_bytes())
            .filter_map(|r| r.ok().map(|(k, _)| k.to_vec()))
            .collect();
        for key in keys {
            self.events.remove(key).map_err(StorageError::backend)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(StorageError::backend)?;
        Ok(())
    }

    pub fn encode_event_key(run_id: &str, seq: u64) -> String {
        encode_event_key(run_id, seq)
    }
}

fn encode_event_key(run_id: &str, seq: u64) -> String {
    format!("{run_id}:{seq:0EVENT_KEY_PAD$}")
}
