//! Pipeline orchestration
//!
//! [`PipelineOrchestrator`] owns the run registry and hands each run to the
//! [`TaskExecutor`] as one task. The task drives the three stages in order,
//! persists every artifact as soon as it is accepted and reports progress
//! through its [`ProgressTracker`]. Callers only ever read snapshots.

use crate::artifact::{
    validate_curriculum, validate_lesson_plans, ArtifactStore, CurriculumScheme, LessonPlanSet,
    SledArtifactStore,
};
use crate::assessment::AssessmentResult;
use crate::chain::{
    ChainRunner, ContentChain, ContentInput, CurriculumChain, LessonPlanChain, RetryPolicy, Stage,
};
use crate::config::LessonforgeConfig;
use crate::error::{ChainError, PipelineError, RunError, StorageError};
use crate::executor::{
    CancellationToken, ExecutorConfig, ExecutorStats, RunTask, TaskExecutor, WorkerPool,
};
use crate::guideline::GuidelineStore;
use crate::progress::tracker::{CURRICULUM_DONE_PERCENT, PLANS_DONE_PERCENT};
use crate::progress::{
    PipelineRun, ProgressTracker, PrunePolicy, RunEvent, RunStore, StatusView,
};
use crate::provider::{CompletionOptions, ModelProviderClient, ProviderFactory};
use crate::types::{LessonId, RunId, RunKey};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Per-run generation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Lessons in every curriculum
    pub lesson_count: usize,
    /// Lessons generated at the same time within one run
    pub lesson_concurrency: usize,
    /// Shortest acceptable lesson body, in characters
    pub min_content_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            lesson_count: 10,
            lesson_concurrency: 1,
            min_content_chars: 200,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.lesson_count == 0 {
            return Err("pipeline.lesson_count must be at least 1".to_string());
        }
        if self.lesson_concurrency == 0 {
            return Err("pipeline.lesson_concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Collaborators shared by every run task.
struct PipelineContext {
    runner: ChainRunner,
    artifacts: Arc<dyn ArtifactStore>,
    settings: PipelineSettings,
}

struct RunHandle {
    key: RunKey,
    token: CancellationToken,
    updates: watch::Receiver<PipelineRun>,
}

impl RunHandle {
    fn snapshot(&self) -> PipelineRun {
        self.updates.borrow().clone()
    }
}

/// Every run this process started, plus the active run per key.
#[derive(Default)]
struct RunRegistry {
    runs: RwLock<HashMap<RunId, RunHandle>>,
    active: Mutex<HashMap<RunKey, RunId>>,
}

impl RunRegistry {
    /// Free `key` if `run_id` still holds it.
    fn release(&self, key: &RunKey, run_id: &RunId) {
        let mut active = self.active.lock();
        if active.get(key) == Some(run_id) {
            active.remove(key);
        }
    }
}

/// Outcome of a run that did not fail
enum RunOutcome {
    Completed,
    Cancelled,
}

/// Error that ended a run, with the lesson being generated at the time.
struct StageFailure {
    error: PipelineError,
    lesson_id: Option<LessonId>,
}

impl StageFailure {
    fn at_lesson(mut self, lesson_id: LessonId) -> Self {
        self.lesson_id = Some(lesson_id);
        self
    }
}

impl From<PipelineError> for StageFailure {
    fn from(error: PipelineError) -> Self {
        Self {
            error,
            lesson_id: None,
        }
    }
}

impl From<ChainError> for StageFailure {
    fn from(error: ChainError) -> Self {
        PipelineError::Chain(error).into()
    }
}

impl From<StorageError> for StageFailure {
    fn from(error: StorageError) -> Self {
        PipelineError::Storage(error).into()
    }
}

pub struct PipelineOrchestrator {
    context: Arc<PipelineContext>,
    registry: Arc<RunRegistry>,
    executor: Arc<dyn TaskExecutor>,
    run_store: Option<Arc<RunStore>>,
}

pub struct PipelineOrchestratorBuilder {
    provider: Arc<dyn ModelProviderClient>,
    guidelines: Arc<GuidelineStore>,
    artifacts: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
    options: CompletionOptions,
    settings: PipelineSettings,
    executor: Option<Arc<dyn TaskExecutor>>,
    executor_config: ExecutorConfig,
    run_store: Option<Arc<RunStore>>,
}

impl PipelineOrchestratorBuilder {
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn completion_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use an existing executor instead of starting a worker pool.
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Persist run snapshots and events.
    pub fn run_store(mut self, store: Arc<RunStore>) -> Self {
        self.run_store = Some(store);
        self
    }

    /// Must be called inside a tokio runtime unless an executor was supplied.
    pub fn build(self) -> Result<PipelineOrchestrator, PipelineError> {
        self.settings.validate().map_err(PipelineError::Config)?;
        self.retry.validate().map_err(PipelineError::Config)?;

        let executor: Arc<dyn TaskExecutor> = match self.executor {
            Some(executor) => executor,
            None => {
                let pool: Arc<dyn TaskExecutor> = WorkerPool::start(self.executor_config)?;
                pool
            }
        };

        Ok(PipelineOrchestrator {
            context: Arc::new(PipelineContext {
                runner: ChainRunner::new(self.provider, self.guidelines, self.retry, self.options),
                artifacts: self.artifacts,
                settings: self.settings,
            }),
            registry: Arc::new(RunRegistry::default()),
            executor,
            run_store: self.run_store,
        })
    }
}

impl PipelineOrchestrator {
    pub fn builder(
        provider: Arc<dyn ModelProviderClient>,
        guidelines: Arc<GuidelineStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> PipelineOrchestratorBuilder {
        PipelineOrchestratorBuilder {
            provider,
            guidelines,
            artifacts,
            retry: RetryPolicy::default(),
            options: CompletionOptions::default(),
            settings: PipelineSettings::default(),
            executor: None,
            executor_config: ExecutorConfig::default(),
            run_store: None,
        }
    }

    /// Wire every collaborator from configuration: one sled database under
    /// `storage.data_dir` backs guidelines, artifacts and run records.
    ///
    /// Runs a previous process left active are marked failed, and old
    /// terminal runs are pruned.
    pub fn from_config(config: &LessonforgeConfig) -> Result<Self, PipelineError> {
        let provider: Arc<dyn ModelProviderClient> =
            Arc::from(ProviderFactory::create_client(&config.provider).map_err(|e| {
                PipelineError::Config(format!("Failed to create provider client: {}", e))
            })?);

        let data_dir = &config.storage.data_dir;
        std::fs::create_dir_all(data_dir).map_err(StorageError::from)?;
        let db = sled::open(data_dir).map_err(|e| {
            StorageError::backend(format!(
                "Failed to open database at {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let guidelines = Arc::new(GuidelineStore::new(&db)?);
        if let Some(dir) = &config.storage.guidelines_dir {
            guidelines.import_directory(dir)?;
        }

        let artifacts: Arc<dyn ArtifactStore> = Arc::new(SledArtifactStore::new(db.clone())?);

        let run_store = RunStore::shared(db)?;
        let interrupted = run_store.mark_interrupted_runs()?;
        if interrupted > 0 {
            warn!(interrupted, "Marked runs left active by a previous process as failed");
        }
        let pruned = run_store.prune(PrunePolicy::default())?;
        debug!(pruned, "Pruned old terminal runs");

        Self::builder(provider, guidelines, artifacts)
            .retry_policy(config.retry.clone())
            .completion_options(config.provider.default_options.clone())
            .settings(config.pipeline.clone())
            .executor_config(config.executor.clone())
            .run_store(run_store)
            .build()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.context.settings
    }

    /// Queue a new run for `(user, subject)`.
    ///
    /// Rejected with [`PipelineError::DuplicateRun`] while another run for the
    /// same pair is not terminal, and with [`PipelineError::SubjectMismatch`]
    /// when the assessment is for another subject. A provider that is not ready fails the run
    /// immediately; the returned id then refers to a FAILED run.
    pub fn start(
        &self,
        user: &str,
        subject: &str,
        assessment: AssessmentResult,
    ) -> Result<RunId, PipelineError> {
        self.launch(RunKey::new(user, subject), assessment, false)
    }

    /// Start a run that reuses the curriculum, plans and lesson content
    /// already saved for `(user, subject)` and generates only what is missing.
    pub fn resume(
        &self,
        user: &str,
        subject: &str,
        assessment: AssessmentResult,
    ) -> Result<RunId, PipelineError> {
        self.launch(RunKey::new(user, subject), assessment, true)
    }

    fn launch(
        &self,
        key: RunKey,
        assessment: AssessmentResult,
        resumed: bool,
    ) -> Result<RunId, PipelineError> {
        if !assessment.subject.trim().eq_ignore_ascii_case(key.subject.trim()) {
            return Err(PipelineError::SubjectMismatch {
                subject: key.subject,
                assessed: assessment.subject,
            });
        }
        let run_id = self.reserve(&key)?;
        let token = CancellationToken::new();
        let (mut tracker, updates) =
            ProgressTracker::new(PipelineRun::queued(run_id.clone(), &key), self.run_store.clone());

        self.registry.runs.write().insert(
            run_id.clone(),
            RunHandle {
                key: key.clone(),
                token: token.clone(),
                updates,
            },
        );

        if let Err(err) = self.context.runner.provider().check_ready() {
            let failure = PipelineError::Chain(ChainError::FatalConfiguration(err.to_string()));
            error!(run_id = %run_id, key = %key, error = %failure, "Provider is not ready, failing run");
            tracker.fail(RunError::from_pipeline(&failure, None));
            self.registry.release(&key, &run_id);
            return Ok(run_id);
        }
        if let Some(store) = &self.run_store {
            if let Err(err) = store.put_run(tracker.run()) {
                warn!(run_id = %run_id, error = %err, "failed to persist queued run");
            }
        }

        let span = info_span!(
            "pipeline_run",
            run_id = %run_id,
            user = %key.user,
            subject = %key.subject
        );
        let job = run_pipeline(
            Arc::clone(&self.context),
            Arc::clone(&self.registry),
            tracker,
            token.clone(),
            key.clone(),
            assessment,
            resumed,
        )
        .instrument(span);

        if let Err(err) = self
            .executor
            .submit(RunTask::new(run_id.clone(), token, Box::pin(job)))
        {
            warn!(run_id = %run_id, error = %err, "Executor rejected run");
            self.registry.release(&key, &run_id);
            self.registry.runs.write().remove(&run_id);
            return Err(err);
        }

        info!(run_id = %run_id, key = %key, resumed, "Run queued");
        Ok(run_id)
    }

    /// Claim `key` for a new run id, unless a live run holds it.
    fn reserve(&self, key: &RunKey) -> Result<RunId, PipelineError> {
        let mut active = self.registry.active.lock();
        if let Some(existing) = active.get(key) {
            let live = self
                .registry
                .runs
                .read()
                .get(existing)
                .map(|handle| !handle.snapshot().is_terminal())
                // Reserved by a start that has not registered its handle yet.
                .unwrap_or(true);
            if live {
                info!(key = %key, existing = %existing, "Rejected duplicate run");
                return Err(PipelineError::DuplicateRun {
                    user: key.user.clone(),
                    subject: key.subject.clone(),
                    existing: existing.clone(),
                });
            }
        }
        let run_id = RunId::generate();
        active.insert(key.clone(), run_id.clone());
        Ok(run_id)
    }

    /// Best-known status of a run. Never blocks on the run itself.
    pub fn status(&self, run_id: &RunId) -> Option<StatusView> {
        self.snapshot(run_id).map(|run| run.status_view())
    }

    /// Full record of a run: in-memory for runs of this process, otherwise
    /// from the run store.
    pub fn snapshot(&self, run_id: &RunId) -> Option<PipelineRun> {
        if let Some(handle) = self.registry.runs.read().get(run_id) {
            return Some(handle.snapshot());
        }
        let store = self.run_store.as_ref()?;
        match store.get_run(run_id) {
            Ok(run) => run,
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "failed to read run record");
                None
            }
        }
    }

    /// Request cooperative cancellation; the run stops at its next stage or
    /// lesson boundary.
    pub fn cancel(&self, run_id: &RunId) -> Result<(), PipelineError> {
        {
            let runs = self.registry.runs.read();
            if let Some(handle) = runs.get(run_id) {
                if handle.snapshot().is_terminal() {
                    return Err(PipelineError::RunTerminal(run_id.clone()));
                }
                if handle.token.cancel() {
                    info!(run_id = %run_id, key = %handle.key, "Cancellation requested");
                }
                return Ok(());
            }
        }
        // Runs known only from the store belong to an earlier process.
        match self.snapshot(run_id) {
            Some(run) if run.is_terminal() => Err(PipelineError::RunTerminal(run_id.clone())),
            _ => Err(PipelineError::RunNotFound(run_id.clone())),
        }
    }

    /// Wait until the run reaches a terminal state and return its record.
    pub async fn wait(&self, run_id: &RunId) -> Result<PipelineRun, PipelineError> {
        let receiver = self
            .registry
            .runs
            .read()
            .get(run_id)
            .map(|handle| handle.updates.clone());
        let Some(mut receiver) = receiver else {
            return self
                .snapshot(run_id)
                .ok_or_else(|| PipelineError::RunNotFound(run_id.clone()));
        };

        loop {
            let current = receiver.borrow_and_update().clone();
            if current.is_terminal() {
                return Ok(current);
            }
            if receiver.changed().await.is_err() {
                // Tracker dropped; its last snapshot is final.
                return Ok(receiver.borrow().clone());
            }
        }
    }

    /// Every known run of `user`, newest first.
    pub fn list_runs(&self, user: &str) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self
            .registry
            .runs
            .read()
            .values()
            .filter(|handle| handle.key.user == user)
            .map(RunHandle::snapshot)
            .collect();

        if let Some(store) = &self.run_store {
            match store.list_runs_for_user(user) {
                Ok(stored) => {
                    let known: HashSet<RunId> = runs.iter().map(|r| r.run_id.clone()).collect();
                    runs.extend(stored.into_iter().filter(|r| !known.contains(&r.run_id)));
                }
                Err(err) => warn!(user, error = %err, "failed to list stored runs"),
            }
        }

        runs.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        runs
    }

    /// Id of the non-terminal run for `(user, subject)`, if any.
    pub fn active_run(&self, user: &str, subject: &str) -> Option<RunId> {
        let key = RunKey::new(user, subject);
        let run_id = self.registry.active.lock().get(&key).cloned()?;
        let live = self
            .registry
            .runs
            .read()
            .get(&run_id)
            .map(|handle| !handle.snapshot().is_terminal())
            .unwrap_or(false);
        live.then_some(run_id)
    }

    /// Recorded events of a run, in sequence order. Empty without a run store.
    pub fn events(&self, run_id: &RunId) -> Result<Vec<RunEvent>, PipelineError> {
        match &self.run_store {
            Some(store) => Ok(store.read_events(run_id)?),
            None => Ok(Vec::new()),
        }
    }

    /// Trim stored terminal runs and forget finished runs held in memory.
    pub fn prune_runs(&self, policy: PrunePolicy) -> Result<usize, PipelineError> {
        let Some(store) = &self.run_store else {
            return Ok(0);
        };
        let removed = store.prune(policy)?;
        self.registry
            .runs
            .write()
            .retain(|_, handle| !handle.snapshot().is_terminal());
        Ok(removed)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Cancel every run, stop the executor and flush run records.
    pub async fn shutdown(&self) {
        for handle in self.registry.runs.read().values() {
            handle.token.cancel();
        }
        self.executor.shutdown().await;
        if let Some(store) = &self.run_store {
            if let Err(err) = store.flush() {
                warn!(error = %err, "failed to flush run store on shutdown");
            }
        }
    }
}

/// Body of one run task.
async fn run_pipeline(
    context: Arc<PipelineContext>,
    registry: Arc<RunRegistry>,
    mut tracker: ProgressTracker,
    token: CancellationToken,
    key: RunKey,
    assessment: AssessmentResult,
    resumed: bool,
) {
    let run_id = tracker.run().run_id.clone();
    let started = Instant::now();
    tracker.record_started(resumed);

    match execute_stages(&context, &mut tracker, &token, &key, &assessment, resumed).await {
        Ok(RunOutcome::Completed) => {
            tracker.complete();
            info!(
                duration_ms = started.elapsed().as_millis() as u64,
                "Run completed"
            );
        }
        Ok(RunOutcome::Cancelled) => {
            tracker.cancel();
            info!(
                lessons_completed = tracker.run().lessons_completed,
                "Run cancelled"
            );
        }
        Err(failure) => {
            error!(
                error = %failure.error,
                lesson_id = ?failure.lesson_id,
                "Run failed"
            );
            tracker.fail(RunError::from_pipeline(&failure.error, failure.lesson_id));
        }
    }

    registry.release(&key, &run_id);
}

async fn execute_stages(
    context: &PipelineContext,
    tracker: &mut ProgressTracker,
    token: &CancellationToken,
    key: &RunKey,
    assessment: &AssessmentResult,
    resumed: bool,
) -> Result<RunOutcome, StageFailure> {
    let settings = &context.settings;

    if token.is_cancelled() {
        return Ok(RunOutcome::Cancelled);
    }
    tracker.enter_stage(Stage::Curriculum, "Generating curriculum");
    let curriculum = match saved_curriculum(context, key, assessment, resumed)? {
        Some(curriculum) => curriculum,
        None => {
            let chain = CurriculumChain::new(settings.lesson_count);
            let curriculum = context.runner.run(&chain, assessment, &key.subject).await?;
            discard_lesson_content(context, key)?;
            context.artifacts.save_curriculum(key, &curriculum)?;
            curriculum
        }
    };
    tracker.advance(
        CURRICULUM_DONE_PERCENT,
        format!("Curriculum ready ({} lessons)", curriculum.lessons.len()),
    );

    if token.is_cancelled() {
        return Ok(RunOutcome::Cancelled);
    }
    tracker.enter_stage(Stage::LessonPlan, "Generating lesson plans");
    let plans = match saved_plans(context, key, &curriculum, resumed)? {
        Some(plans) => plans,
        None => {
            let plans = context
                .runner
                .run(&LessonPlanChain::new(), &curriculum, &key.subject)
                .await?;
            discard_lesson_content(context, key)?;
            context.artifacts.save_lesson_plans(key, &plans)?;
            plans
        }
    };
    tracker.advance(PLANS_DONE_PERCENT, "Lesson plans ready");

    if token.is_cancelled() {
        return Ok(RunOutcome::Cancelled);
    }
    tracker.enter_stage(Stage::Content, "Generating lesson content");
    generate_content(context, tracker, token, key, &curriculum, &plans, resumed).await
}

fn saved_curriculum(
    context: &PipelineContext,
    key: &RunKey,
    assessment: &AssessmentResult,
    resumed: bool,
) -> Result<Option<CurriculumScheme>, StageFailure> {
    if !resumed {
        return Ok(None);
    }
    let Some(curriculum) = context.artifacts.load_curriculum(key)? else {
        return Ok(None);
    };
    match validate_curriculum(&curriculum, context.settings.lesson_count, assessment) {
        Ok(()) => {
            info!(stage = %Stage::Curriculum, "Reusing saved curriculum");
            Ok(Some(curriculum))
        }
        Err(reason) => {
            info!(stage = %Stage::Curriculum, reason = %reason, "Saved curriculum not reusable, regenerating");
            Ok(None)
        }
    }
}

fn saved_plans(
    context: &PipelineContext,
    key: &RunKey,
    curriculum: &CurriculumScheme,
    resumed: bool,
) -> Result<Option<LessonPlanSet>, StageFailure> {
    if !resumed {
        return Ok(None);
    }
    let Some(plans) = context.artifacts.load_lesson_plans(key)? else {
        return Ok(None);
    };
    if plans.curriculum_digest != curriculum.digest() {
        info!(stage = %Stage::LessonPlan, "Saved lesson plans belong to another curriculum, regenerating");
        return Ok(None);
    }
    match validate_lesson_plans(&plans, curriculum) {
        Ok(()) => {
            info!(stage = %Stage::LessonPlan, "Reusing saved lesson plans");
            Ok(Some(plans))
        }
        Err(reason) => {
            info!(stage = %Stage::LessonPlan, reason = %reason, "Saved lesson plans not reusable, regenerating");
            Ok(None)
        }
    }
}

/// Content written for earlier plans no longer matches; remove it before the
/// new artifacts are saved.
fn discard_lesson_content(context: &PipelineContext, key: &RunKey) -> Result<(), StageFailure> {
    let removed = context.artifacts.clear_lesson_content(key)?;
    if removed > 0 {
        info!(removed, "Discarded lesson content of a previous curriculum");
    }
    Ok(())
}

/// Stage 3. Lessons are generated in curriculum order, up to
/// `lesson_concurrency` at a time, and persisted in that same order. Each
/// lesson checks the token before its service call; once it is set no new
/// lesson starts, while lessons already in flight are still saved.
async fn generate_content(
    context: &PipelineContext,
    tracker: &mut ProgressTracker,
    token: &CancellationToken,
    key: &RunKey,
    curriculum: &CurriculumScheme,
    plans: &LessonPlanSet,
    resumed: bool,
) -> Result<RunOutcome, StageFailure> {
    let digest = curriculum.digest();
    let lesson_ids: BTreeSet<LessonId> = curriculum.lesson_ids().into_iter().collect();
    let existing: BTreeSet<LessonId> = if resumed {
        context
            .artifacts
            .list_lesson_content(key)?
            .into_iter()
            .filter(|content| content.belongs_to(&digest))
            .map(|content| content.lesson_id)
            .filter(|id| lesson_ids.contains(id))
            .collect()
    } else {
        BTreeSet::new()
    };
    let total = curriculum.lessons.len() as u32;
    tracker.set_lessons(existing.len() as u32, total);
    if !existing.is_empty() {
        info!(reused = existing.len(), total, "Reusing saved lesson content");
    }

    let mut pending = Vec::new();
    let mut upcoming = Vec::new();
    for (index, lesson) in curriculum
        .lessons
        .iter()
        .enumerate()
        .filter(|(_, l)| !existing.contains(&l.id))
    {
        let plan = plans.plan(lesson.id).ok_or_else(|| {
            StageFailure::from(ChainError::Validation {
                stage: Stage::LessonPlan,
                message: format!("no plan for lesson {}", lesson.id),
            })
            .at_lesson(lesson.id)
        })?;
        upcoming.push((lesson.id, index + 1));
        pending.push(ContentInput {
            subject: curriculum.subject.clone(),
            skill_level: curriculum.skill_level,
            lesson: lesson.clone(),
            plan: plan.clone(),
            curriculum_digest: digest.clone(),
        });
    }

    let chain = ContentChain::new(
        context.settings.min_content_chars,
        context.runner.provider().model_name(),
    );
    let runner = &context.runner;
    let subject = key.subject.as_str();
    let mut results = stream::iter(pending.into_iter().map(|input| {
        let chain = &chain;
        async move {
            if token.is_cancelled() {
                return None;
            }
            let lesson_id = input.lesson.id;
            let started = Instant::now();
            debug!(lesson_id, "Generating lesson content");
            let result = runner.run(chain, &input, subject).await;
            Some((lesson_id, started.elapsed().as_millis() as u64, result))
        }
    }))
    .buffered(context.settings.lesson_concurrency.max(1));

    // The stream yields lessons in curriculum order, so the next item is
    // always the next entry of `upcoming`.
    let mut upcoming = upcoming.into_iter();
    let mut cancelled = false;
    loop {
        if let Some((lesson_id, position)) = upcoming.next() {
            if !token.is_cancelled() {
                tracker.set_step(format!(
                    "Generating lesson {lesson_id} content ({position}/{total})"
                ));
            }
        }
        let Some(item) = results.next().await else {
            break;
        };
        let Some((lesson_id, duration_ms, result)) = item else {
            cancelled = true;
            continue;
        };
        let content = result.map_err(|e| StageFailure::from(e).at_lesson(lesson_id))?;
        context
            .artifacts
            .save_lesson_content(key, lesson_id, &content)
            .map_err(|e| StageFailure::from(e).at_lesson(lesson_id))?;
        tracker.lesson_completed(lesson_id, Some(duration_ms));
        info!(lesson_id, duration_ms, "Lesson content saved");
    }

    if cancelled {
        return Ok(RunOutcome::Cancelled);
    }
    Ok(RunOutcome::Completed)
}
