//! Generation chains
//!
//! A chain wraps one pipeline stage: it renders a prompt from its input and
//! the stage's guideline documents, invokes the generative service under the
//! retry policy, then parses and validates the reply. Stages form a closed
//! set; each has exactly one [`StageChain`] implementation and they all run
//! through the same [`ChainRunner`].

pub mod content;
pub mod curriculum;
pub mod lesson_plan;
pub mod parse;
pub mod prompt;
pub mod retry;

pub use content::{ContentChain, ContentInput};
pub use curriculum::CurriculumChain;
pub use lesson_plan::LessonPlanChain;
pub use retry::RetryPolicy;

use crate::error::{ChainError, ProviderError};
use crate::guideline::{GuidelineSnapshot, GuidelineStore};
use crate::provider::{ChatMessage, CompletionOptions, ModelProviderClient};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Curriculum,
    LessonPlan,
    Content,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Curriculum, Stage::LessonPlan, Stage::Content];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Curriculum => "curriculum",
            Stage::LessonPlan => "lesson_plan",
            Stage::Content => "content",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-specific half of a chain: prompt rendering and output parsing.
///
/// `parse` returns a human-readable reason on failure; the runner feeds it
/// back to the model once before giving up.
pub trait StageChain: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    const STAGE: Stage;

    fn render(&self, input: &Self::Input, guidelines: &[Arc<GuidelineSnapshot>]) -> Vec<ChatMessage>;

    fn parse(&self, raw: &str, input: &Self::Input) -> Result<Self::Output, String>;
}

/// Shared half of every chain: guidelines, provider invocation, retries.
#[derive(Clone)]
pub struct ChainRunner {
    provider: Arc<dyn ModelProviderClient>,
    guidelines: Arc<GuidelineStore>,
    retry: RetryPolicy,
    options: CompletionOptions,
}

impl ChainRunner {
    pub fn new(
        provider: Arc<dyn ModelProviderClient>,
        guidelines: Arc<GuidelineStore>,
        retry: RetryPolicy,
        options: CompletionOptions,
    ) -> Self {
        Self {
            provider,
            guidelines,
            retry,
            options,
        }
    }

    pub fn provider(&self) -> &Arc<dyn ModelProviderClient> {
        &self.provider
    }

    /// Run a stage with the guideline documents currently in the store.
    pub async fn run<C: StageChain>(
        &self,
        chain: &C,
        input: &C::Input,
        subject: &str,
    ) -> Result<C::Output, ChainError> {
        let guidelines = self.guidelines.documents_for_stage(C::STAGE, Some(subject))?;
        self.run_with_guidelines(chain, input, &guidelines).await
    }

    /// Run a stage against an explicit guideline snapshot list.
    pub async fn run_with_guidelines<C: StageChain>(
        &self,
        chain: &C,
        input: &C::Input,
        guidelines: &[Arc<GuidelineSnapshot>],
    ) -> Result<C::Output, ChainError> {
        let stage = C::STAGE;
        let started = Instant::now();
        let messages = chain.render(input, guidelines);
        let raw = self.invoke(stage, messages.clone()).await?;

        let reason = match chain.parse(&raw, input) {
            Ok(output) => {
                info!(
                    stage = %stage,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Stage output accepted"
                );
                return Ok(output);
            }
            Err(reason) => reason,
        };

        warn!(stage = %stage, reason = %reason, "Stage output rejected, retrying with reinforced prompt");
        let reinforced = prompt::reinforce(messages, &raw, &reason);
        let raw = self.invoke(stage, reinforced).await?;
        match chain.parse(&raw, input) {
            Ok(output) => {
                info!(
                    stage = %stage,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Stage output accepted after reinforcement"
                );
                Ok(output)
            }
            Err(message) => Err(ChainError::Validation { stage, message }),
        }
    }

    /// One logical service call: up to `max_attempts` tries, backing off
    /// between transient failures.
    async fn invoke(&self, stage: Stage, messages: Vec<ChatMessage>) -> Result<String, ChainError> {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1u32;
        loop {
            let started = Instant::now();
            let result = self
                .provider
                .complete(messages.clone(), self.options.clone())
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    debug!(
                        stage = %stage,
                        attempt,
                        duration_ms,
                        provider = self.provider.provider_name(),
                        model = %response.model,
                        total_tokens = response.usage.total_tokens,
                        "Provider call succeeded"
                    );
                    return Ok(response.content);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        stage = %stage,
                        attempt,
                        max_attempts,
                        duration_ms,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient provider failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(stage = %stage, attempt, duration_ms, error = %err, "Provider call failed");
                    return Err(classify_failure(stage, attempt, err));
                }
            }
        }
    }
}

fn classify_failure(stage: Stage, attempts: u32, err: ProviderError) -> ChainError {
    match err {
        ProviderError::NotConfigured(message) => ChainError::FatalConfiguration(message),
        ProviderError::ClientError(_) => ChainError::Client { stage, source: err },
        transient => ChainError::Transient {
            stage,
            attempts,
            source: transient,
        },
    }
}
