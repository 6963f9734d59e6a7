use crate::tokens::TokenBudgetManager;
use promptmend_ai::Completion;
use promptmend_cache::Fingerprint;
use promptmend_core::{
    AnalysisRequest, AnalysisResult, AnalysisStatus, Diagnosis, ErrorReport, Modification,
    PatchReport, PromptMendError, PromptVariable, Result, TokenUsage, ValidationVerdict,
};
use std::fmt;
use tracing::{debug, info};

/// Position of a request in the repair loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Diagnosing,
    Patching,
    Compressing,
    Validating,
    Succeeded,
    Retrying,
    Exhausted,
}

impl PipelinePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelinePhase::Succeeded | PipelinePhase::Exhausted)
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelinePhase::Idle => "idle",
            PipelinePhase::Diagnosing => "diagnosing",
            PipelinePhase::Patching => "patching",
            PipelinePhase::Compressing => "compressing",
            PipelinePhase::Validating => "validating",
            PipelinePhase::Succeeded => "succeeded",
            PipelinePhase::Retrying => "retrying",
            PipelinePhase::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Token usage of one LLM call before it is attributed to an iteration
#[derive(Debug, Clone, PartialEq)]
pub struct StepUsage {
    pub step: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub estimated: bool,
}

impl StepUsage {
    /// Take the service's numbers when it reports them; otherwise count
    /// both sides with the request's encoder.
    pub fn measure(
        budget: &TokenBudgetManager,
        step: &str,
        prompt: &str,
        completion: &Completion,
    ) -> Result<Self> {
        match (completion.prompt_tokens, completion.completion_tokens) {
            (Some(prompt_tokens), Some(completion_tokens)) => Ok(Self {
                step: step.to_string(),
                prompt_tokens,
                completion_tokens,
                estimated: false,
            }),
            _ => Ok(Self {
                step: step.to_string(),
                prompt_tokens: budget.count(prompt)?,
                completion_tokens: budget.count(&completion.text)?,
                estimated: true,
            }),
        }
    }
}

/// Mutable state of one request, owned by the orchestrator for the
/// lifetime of that request.
pub struct PipelineState {
    fingerprint: Fingerprint,
    budget: TokenBudgetManager,
    phase: PipelinePhase,
    iteration: u32,
    current_prompt: String,
    variables: Vec<PromptVariable>,
    token_usage: Vec<TokenUsage>,
    last_error: Option<ErrorReport>,
    pub(crate) diagnosis: Option<Diagnosis>,
    pub(crate) diagnosis_warnings: Vec<String>,
    pub(crate) validation: Option<ValidationVerdict>,
    pub(crate) patch_report: Option<PatchReport>,
    pub(crate) configuration_suggestions: Vec<Modification>,
}

impl PipelineState {
    pub fn new(fingerprint: Fingerprint, request: &AnalysisRequest, budget: TokenBudgetManager) -> Self {
        Self {
            fingerprint,
            budget,
            phase: PipelinePhase::Idle,
            iteration: 0,
            current_prompt: request.governing_prompt_text().to_string(),
            variables: request.variables.clone(),
            token_usage: Vec::new(),
            last_error: None,
            diagnosis: None,
            diagnosis_warnings: Vec::new(),
            validation: None,
            patch_report: None,
            configuration_suggestions: Vec::new(),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn budget(&self) -> &TokenBudgetManager {
        &self.budget
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn current_prompt(&self) -> &str {
        &self.current_prompt
    }

    pub fn variables(&self) -> &[PromptVariable] {
        &self.variables
    }

    pub fn token_usage(&self) -> &[TokenUsage] {
        &self.token_usage
    }

    pub fn last_error(&self) -> Option<&ErrorReport> {
        self.last_error.as_ref()
    }

    pub fn total_tokens(&self) -> usize {
        self.token_usage.iter().map(|u| u.total_tokens).sum()
    }

    pub fn transition(&mut self, next: PipelinePhase) {
        debug!(
            fingerprint = %self.fingerprint,
            iteration = self.iteration,
            "{} -> {}",
            self.phase,
            next
        );
        self.phase = next;
    }

    pub fn begin_iteration(&mut self) {
        self.iteration += 1;
        info!("🔁 Iteration {} for {}", self.iteration, self.fingerprint);
        self.transition(PipelinePhase::Diagnosing);
    }

    pub fn record_usage(&mut self, usage: StepUsage) {
        debug!(
            step = %usage.step,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            estimated = usage.estimated,
            "token usage"
        );
        self.token_usage.push(TokenUsage {
            iteration: self.iteration,
            step: usage.step,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.prompt_tokens + usage.completion_tokens,
            estimated: usage.estimated,
        });
    }

    pub fn record_error(&mut self, error: &PromptMendError) {
        self.last_error = Some(error.report());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// The candidate becomes the input of the next round
    pub fn adopt(&mut self, prompt: String, variables: Vec<PromptVariable>) {
        self.current_prompt = prompt;
        self.variables = variables;
    }

    pub fn into_result(self, status: AnalysisStatus) -> AnalysisResult {
        let total_tokens = self.total_tokens();
        AnalysisResult {
            status,
            fingerprint: self.fingerprint.to_string(),
            final_prompt: self.current_prompt,
            final_variables: self.variables,
            diagnosis: self.diagnosis,
            diagnosis_warnings: self.diagnosis_warnings,
            validation: self.validation,
            patch_report: self.patch_report,
            configuration_suggestions: self.configuration_suggestions,
            iterations: self.iteration,
            total_tokens,
            token_usage: self.token_usage,
            last_error: self.last_error,
            from_cache: false,
        }
    }
}
