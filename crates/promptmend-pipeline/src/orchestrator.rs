//! The bounded diagnose, patch, compress and validate loop.

use crate::compression::CompressionAgent;
use crate::diagnosis::DiagnosticAgent;
use crate::parsed::ParsedStep;
use crate::patch::{PatchEngine, PatchFailure};
use crate::prompts::PromptLibrary;
use crate::state::{PipelinePhase, PipelineState};
use crate::tokens::{TokenBudgetManager, TokenEncoder, DEFAULT_MAX_TOKENS};
use crate::validation::ValidationAgent;
use promptmend_ai::LLMGateway;
use promptmend_cache::{Fingerprint, ResultCache};
use promptmend_core::{
    AnalysisRequest, AnalysisResult, AnalysisStatus, AppliedPatch, CompressionConfig,
    Modification, ModificationTarget, PatchReport, PromptMendConfig, PromptMendError,
    PromptVariable, Result, SkippedPatch,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, field, info, instrument, warn, Span};

/// What to do when one modification of a batch cannot be located
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFailurePolicy {
    /// Record the failure and keep applying the rest of the batch
    Skip,
    /// Fail the whole iteration on the first failure
    Abort,
}

impl PatchFailurePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Some(PatchFailurePolicy::Skip),
            "abort" => Some(PatchFailurePolicy::Abort),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_iterations: u32,
    pub confidence_threshold: f64,
    pub patch_policy: PatchFailurePolicy,
    pub fuzzy_match_threshold: f32,
    pub history_window: usize,
    pub prompt_preview_chars: usize,
    pub system_instruction_reserve: usize,
    pub request_timeout: Option<Duration>,
    /// Used when a request carries no `model_config.max_tokens`
    pub default_max_tokens: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            confidence_threshold: 0.85,
            patch_policy: PatchFailurePolicy::Skip,
            fuzzy_match_threshold: crate::patch::DEFAULT_MATCH_THRESHOLD,
            history_window: 3,
            prompt_preview_chars: 6000,
            system_instruction_reserve: 2500,
            request_timeout: None,
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &PromptMendConfig) -> Result<Self> {
        let pipeline = &config.pipeline;
        let patch_policy = PatchFailurePolicy::parse(&pipeline.patch_failure_policy).ok_or_else(|| {
            PromptMendError::Config(format!(
                "unknown patch failure policy: {}",
                pipeline.patch_failure_policy
            ))
        })?;

        Ok(Self {
            max_iterations: pipeline.max_iterations,
            confidence_threshold: pipeline.confidence_threshold,
            patch_policy,
            fuzzy_match_threshold: pipeline.fuzzy_match_threshold,
            history_window: pipeline.history_window,
            prompt_preview_chars: pipeline.prompt_preview_chars,
            system_instruction_reserve: pipeline.system_instruction_reserve,
            request_timeout: pipeline.request_timeout_secs.map(Duration::from_secs),
            default_max_tokens: config.model.max_tokens,
        })
    }
}

enum IterationOutcome {
    Accepted,
    Rejected,
}

/// Candidate produced by the patching phase of one iteration
struct PatchedCandidate {
    prompt: String,
    variables: Vec<PromptVariable>,
    report: PatchReport,
    suggestions: Vec<Modification>,
}

pub struct PipelineOrchestrator {
    diagnostic: DiagnosticAgent,
    patcher: PatchEngine,
    compressor: CompressionAgent,
    validator: ValidationAgent,
    encoder: Arc<dyn TokenEncoder>,
    cache: Option<Arc<dyn ResultCache>>,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        gateway: Arc<LLMGateway>,
        library: Arc<PromptLibrary>,
        encoder: Arc<dyn TokenEncoder>,
        settings: PipelineSettings,
        compression: &CompressionConfig,
    ) -> Self {
        let diagnostic = DiagnosticAgent::new(gateway.clone(), library.clone())
            .with_history_window(settings.history_window)
            .with_preview_chars(settings.prompt_preview_chars)
            .with_instruction_reserve(settings.system_instruction_reserve);
        let validator = ValidationAgent::new(gateway, library)
            .with_instruction_reserve(settings.system_instruction_reserve);

        Self {
            diagnostic,
            patcher: PatchEngine::new(settings.fuzzy_match_threshold),
            compressor: CompressionAgent::new(compression),
            validator,
            encoder,
            cache: None,
            settings,
        }
    }

    /// Wire every component from a loaded configuration
    pub fn from_config(
        config: &PromptMendConfig,
        gateway: Arc<LLMGateway>,
        library: Arc<PromptLibrary>,
        encoder: Arc<dyn TokenEncoder>,
    ) -> Result<Self> {
        let settings = PipelineSettings::from_config(config)?;
        Ok(Self::new(
            gateway,
            library,
            encoder,
            settings,
            &config.compression,
        ))
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run the repair loop for one request.
    ///
    /// Returns `Err` only for fatal errors (invalid request, encoding or
    /// configuration failures). Everything else ends in a result whose status
    /// is either `Succeeded` or `Exhausted`.
    #[instrument(skip_all, fields(fingerprint = field::Empty))]
    pub async fn run_analysis(&self, request: &AnalysisRequest) -> Result<AnalysisResult> {
        request.validate()?;

        let fingerprint = Fingerprint::of(request);
        Span::current().record("fingerprint", fingerprint.as_str());

        if let Some(hit) = self.cached(&fingerprint).await {
            return Ok(hit);
        }

        let budget = TokenBudgetManager::new(
            self.encoder.clone(),
            Some(
                request
                    .model_config
                    .max_tokens
                    .unwrap_or(self.settings.default_max_tokens),
            ),
        );
        let prompt_tokens = budget.count(request.governing_prompt_text())?;
        info!(
            "🩺 Analyzing request {} (prompt: {} tokens, budget: {})",
            fingerprint,
            prompt_tokens,
            budget.budget()
        );

        let mut state = PipelineState::new(fingerprint, request, budget);
        let deadline = self
            .settings
            .request_timeout
            .map(|timeout| Instant::now() + timeout);

        while state.iteration() < self.settings.max_iterations {
            state.begin_iteration();

            let finished = match deadline {
                Some(deadline) => timeout_at(deadline, self.run_iteration(&mut state, request))
                    .await
                    .ok(),
                None => Some(self.run_iteration(&mut state, request).await),
            };
            let Some(attempt) = finished else {
                let err = PromptMendError::Timeout(format!(
                    "request exceeded {:.1}s during iteration {}",
                    self.settings.request_timeout.map_or(0.0, |t| t.as_secs_f64()),
                    state.iteration()
                ));
                warn!("⏱️  {}", err);
                state.record_error(&err);
                break;
            };

            match attempt {
                Ok(IterationOutcome::Accepted) => {
                    state.clear_error();
                    state.transition(PipelinePhase::Succeeded);
                    info!(
                        "✅ Fix accepted after {} iteration(s), {} tokens",
                        state.iteration(),
                        state.total_tokens()
                    );
                    let result = state.into_result(AnalysisStatus::Succeeded);
                    self.store(&result).await;
                    return Ok(result);
                }
                Ok(IterationOutcome::Rejected) => state.transition(PipelinePhase::Retrying),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(iteration = state.iteration(), "Iteration failed: {}", e);
                    state.record_error(&e);
                    state.transition(PipelinePhase::Retrying);
                }
            }
        }

        state.transition(PipelinePhase::Exhausted);
        info!(
            "❌ No accepted fix after {} iteration(s), {} tokens",
            state.iteration(),
            state.total_tokens()
        );
        Ok(state.into_result(AnalysisStatus::Exhausted))
    }

    async fn cached(&self, fingerprint: &Fingerprint) -> Option<AnalysisResult> {
        let cache = self.cache.as_ref()?;
        match cache.get(fingerprint).await {
            Ok(Some(mut hit)) => {
                let stats = cache.stats();
                info!(
                    "💾 Cache hit for {} ({} backend, hit rate {:.0}%)",
                    fingerprint,
                    cache.backend_name(),
                    stats.hit_rate() * 100.0
                );
                hit.from_cache = true;
                Some(hit)
            }
            Ok(None) => {
                debug!(backend = cache.backend_name(), "cache miss");
                None
            }
            Err(e) => {
                warn!("Cache lookup failed, continuing without it: {}", e);
                None
            }
        }
    }

    async fn store(&self, result: &AnalysisResult) {
        let Some(cache) = &self.cache else {
            return;
        };
        let Some(fingerprint) = Fingerprint::parse(&result.fingerprint) else {
            return;
        };
        if let Err(e) = cache.put(&fingerprint, result).await {
            warn!("Failed to cache result for {}: {}", fingerprint, e);
        }
    }

    async fn run_iteration(
        &self,
        state: &mut PipelineState,
        request: &AnalysisRequest,
    ) -> Result<IterationOutcome> {
        let outcome = self.diagnostic.diagnose(state, request).await?;
        state.record_usage(outcome.usage);

        let diagnosis = match outcome.parsed {
            ParsedStep::Structured(diagnosis) => diagnosis,
            ParsedStep::Malformed(raw) => {
                return Err(PromptMendError::Parse(format!(
                    "diagnosis output is not valid JSON ({} chars)",
                    raw.len()
                )))
            }
        };

        state.transition(PipelinePhase::Patching);
        let PatchedCandidate {
            mut prompt,
            variables,
            report,
            suggestions,
        } = self.patch(state, &diagnosis.proposed_modifications)?;

        state.transition(PipelinePhase::Compressing);
        if state.budget().exceeds_budget(&prompt)? {
            let before = state.budget().count(&prompt)?;
            prompt = self.compressor.compress(&prompt);
            let after = state.budget().count(&prompt)?;
            info!(
                "🗜️  Compressed candidate prompt {} -> {} tokens (budget {})",
                before,
                after,
                state.budget().budget()
            );
        }

        state.transition(PipelinePhase::Validating);
        let validation = self
            .validator
            .validate_solution(state.budget(), state.current_prompt(), &prompt, &diagnosis)
            .await?;
        state.record_usage(validation.usage);

        let accepted = validation.verdict.confidence >= self.settings.confidence_threshold;
        debug!(
            confidence = validation.verdict.confidence,
            threshold = self.settings.confidence_threshold,
            accepted,
            "Validation complete"
        );

        // Only a validated iteration replaces what the result reports
        state.diagnosis = Some(diagnosis);
        state.diagnosis_warnings = outcome.warnings;
        state.patch_report = Some(report);
        state.configuration_suggestions = suggestions;
        state.validation = Some(validation.verdict);
        state.adopt(prompt, variables);

        Ok(if accepted {
            IterationOutcome::Accepted
        } else {
            IterationOutcome::Rejected
        })
    }

    /// Route each modification to its artifact and apply it under the
    /// configured failure policy.
    fn patch(
        &self,
        state: &PipelineState,
        modifications: &[Modification],
    ) -> Result<PatchedCandidate> {
        let mut candidate = PatchedCandidate {
            prompt: state.current_prompt().to_string(),
            variables: state.variables().to_vec(),
            report: PatchReport::default(),
            suggestions: Vec::new(),
        };
        let mut text_edits = 0;

        for (index, modification) in modifications.iter().enumerate() {
            let applied = match modification.target {
                ModificationTarget::ModelConfiguration => {
                    candidate.suggestions.push(modification.clone());
                    continue;
                }
                ModificationTarget::GoverningPrompt => {
                    text_edits += 1;
                    self.patcher
                        .apply(&candidate.prompt, modification, index)
                        .map(|outcome| {
                            candidate.prompt = outcome.text;
                            outcome.similarity
                        })
                }
                ModificationTarget::VariablePrompt => {
                    text_edits += 1;
                    self.patch_variable(&mut candidate.variables, modification, index)
                }
            };

            match applied {
                Ok(similarity) => candidate.report.applied.push(AppliedPatch {
                    index,
                    target: modification.target,
                    locator: modification.locator.clone(),
                    similarity,
                }),
                Err(failure) => match self.settings.patch_policy {
                    PatchFailurePolicy::Abort => return Err(failure.into()),
                    PatchFailurePolicy::Skip => {
                        debug!(index, "Skipping modification: {}", failure.reason);
                        candidate.report.skipped.push(SkippedPatch {
                            index,
                            reason: failure.reason,
                        });
                    }
                },
            }
        }

        if text_edits == 0 {
            return Err(PromptMendError::Schema(vec![
                "$.proposed_modifications: no prompt or variable modification proposed".to_string(),
            ]));
        }
        if candidate.report.applied.is_empty() {
            let first = candidate.report.skipped.first();
            return Err(PromptMendError::PatchApplication {
                index: first.map_or(0, |s| s.index),
                reason: format!(
                    "none of the {} modification(s) could be applied{}",
                    text_edits,
                    first.map_or(String::new(), |s| format!(": {}", s.reason))
                ),
            });
        }

        info!(
            "🩹 Applied {} modification(s), skipped {}, {} configuration suggestion(s)",
            candidate.report.applied.len(),
            candidate.report.skipped.len(),
            candidate.suggestions.len()
        );
        Ok(candidate)
    }

    fn patch_variable(
        &self,
        variables: &mut [PromptVariable],
        modification: &Modification,
        index: usize,
    ) -> std::result::Result<f32, PatchFailure> {
        let name = modification.locator.trim();
        let Some(variable) = variables.iter_mut().find(|v| v.name == name) else {
            return Err(PatchFailure {
                index,
                reason: format!("no variable named {:?}", name),
                best_similarity: 0.0,
            });
        };

        // The locator names the variable, not a section inside it
        let scoped = Modification {
            locator: String::new(),
            ..modification.clone()
        };
        let outcome = self.patcher.apply(&variable.content, &scoped, index)?;
        variable.content = outcome.text;
        Ok(outcome.similarity)
    }
}
