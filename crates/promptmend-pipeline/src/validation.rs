//! Second-opinion check of a patched prompt.

use crate::parsed::{parse_completion, ParsedStep};
use crate::prompts::{PromptLibrary, SYSTEM_INSTRUCTION, VALIDATION_TASK};
use crate::schema::verdict_schema;
use crate::state::StepUsage;
use crate::tokens::TokenBudgetManager;
use promptmend_ai::LLMGateway;
use promptmend_core::{Diagnosis, Result, ValidationVerdict};
use std::sync::Arc;
use tracing::{debug, warn};

pub const VALIDATION_STEP: &str = "validation";

const DEFAULT_INSTRUCTION_RESERVE: usize = 2500;

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub verdict: ValidationVerdict,
    pub usage: StepUsage,
}

pub struct ValidationAgent {
    gateway: Arc<LLMGateway>,
    library: Arc<PromptLibrary>,
    instruction_reserve: usize,
}

impl ValidationAgent {
    pub fn new(gateway: Arc<LLMGateway>, library: Arc<PromptLibrary>) -> Self {
        Self {
            gateway,
            library,
            instruction_reserve: DEFAULT_INSTRUCTION_RESERVE,
        }
    }

    pub fn with_instruction_reserve(mut self, tokens: usize) -> Self {
        self.instruction_reserve = tokens;
        self
    }

    pub fn build_prompt(
        &self,
        budget: &TokenBudgetManager,
        original: &str,
        modified: &str,
        diagnosis: &Diagnosis,
    ) -> Result<String> {
        let instruction = budget
            .truncate_to_fit(self.library.template(SYSTEM_INSTRUCTION)?, self.instruction_reserve)?;
        let original_tokens = budget.count(original)?;
        let modified_tokens = budget.count(modified)?;
        let token_report = format!(
            "original: {} tokens, modified: {} tokens, budget: {} tokens",
            original_tokens,
            modified_tokens,
            budget.budget()
        );
        let output_schema = serde_json::to_string_pretty(&verdict_schema().to_json_schema())?;

        self.library.render(
            VALIDATION_TASK,
            &[
                ("system_instruction", instruction.as_str()),
                ("identified_issue", diagnosis.identified_issue.as_str()),
                ("expected_impact", diagnosis.expected_impact.as_str()),
                ("original_prompt", original),
                ("modified_prompt", modified),
                ("token_report", token_report.as_str()),
                ("output_schema", output_schema.as_str()),
            ],
        )
    }

    /// Judge `modified` against `original`. Output that does not parse or
    /// does not satisfy the verdict schema yields `ValidationVerdict::failed()`.
    pub async fn validate_solution(
        &self,
        budget: &TokenBudgetManager,
        original: &str,
        modified: &str,
        diagnosis: &Diagnosis,
    ) -> Result<ValidationOutcome> {
        let prompt = self.build_prompt(budget, original, modified, diagnosis)?;
        let completion = self.gateway.invoke(&prompt, VALIDATION_STEP).await?;
        let usage = StepUsage::measure(budget, VALIDATION_STEP, &prompt, &completion)?;

        let verdict = interpret(&completion.text);
        debug!(
            valid = verdict.valid,
            confidence = verdict.confidence,
            issues = verdict.issues.len(),
            "Validation verdict"
        );

        Ok(ValidationOutcome { verdict, usage })
    }
}

fn interpret(raw: &str) -> ValidationVerdict {
    let value = match parse_completion(raw) {
        ParsedStep::Structured(value) => value,
        ParsedStep::Malformed(_) => {
            warn!("Validation output was not JSON");
            return ValidationVerdict::failed();
        }
    };

    let report = verdict_schema().validate(&value);
    if !report.is_valid() {
        warn!("Validation output violates schema: {}", report.errors.join("; "));
        return ValidationVerdict::failed();
    }

    serde_json::from_value(value).unwrap_or_else(|e| {
        warn!("Validation output could not be read: {}", e);
        ValidationVerdict::failed()
    })
}
