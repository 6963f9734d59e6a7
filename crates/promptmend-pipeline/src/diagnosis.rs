//! First LLM step of an iteration: explain the failure and propose edits.

use crate::parsed::{parse_completion, ParsedStep};
use crate::prompts::{
    PromptLibrary, ARCHITECTURE_REFERENCE, DIAGNOSIS_TASK, FAILURE_TAXONOMY, SYSTEM_INSTRUCTION,
};
use crate::schema::diagnosis_schema;
use crate::state::{PipelineState, StepUsage};
use promptmend_ai::LLMGateway;
use promptmend_core::{
    AnalysisRequest, Diagnosis, Modification, ProblemType, PromptVariable, Result, Skill,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DIAGNOSIS_STEP: &str = "diagnosis";

const DEFAULT_HISTORY_WINDOW: usize = 3;
const DEFAULT_PREVIEW_CHARS: usize = 6000;
const DEFAULT_INSTRUCTION_RESERVE: usize = 2500;

/// Everything one diagnosis call produced
#[derive(Debug, Clone)]
pub struct DiagnosisOutcome {
    pub parsed: ParsedStep<Diagnosis>,
    /// Schema violations and dropped modifications of a best-effort diagnosis
    pub warnings: Vec<String>,
    pub usage: StepUsage,
}

pub struct DiagnosticAgent {
    gateway: Arc<LLMGateway>,
    library: Arc<PromptLibrary>,
    history_window: usize,
    preview_chars: usize,
    instruction_reserve: usize,
}

impl DiagnosticAgent {
    pub fn new(gateway: Arc<LLMGateway>, library: Arc<PromptLibrary>) -> Self {
        Self {
            gateway,
            library,
            history_window: DEFAULT_HISTORY_WINDOW,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            instruction_reserve: DEFAULT_INSTRUCTION_RESERVE,
        }
    }

    pub fn with_history_window(mut self, turns: usize) -> Self {
        self.history_window = turns.max(1);
        self
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }

    /// Tokens kept free for the rest of the prompt when the system
    /// instruction is truncated
    pub fn with_instruction_reserve(mut self, tokens: usize) -> Self {
        self.instruction_reserve = tokens;
        self
    }

    /// Render the diagnosis prompt for the state's current prompt and variables
    pub fn build_prompt(&self, state: &PipelineState, request: &AnalysisRequest) -> Result<String> {
        let instruction = state
            .budget()
            .truncate_to_fit(self.library.template(SYSTEM_INSTRUCTION)?, self.instruction_reserve)?;
        let conversation = request
            .recent_turns(self.history_window)
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect::<Vec<_>>()
            .join("\n");
        let governing_prompt = preview(state.current_prompt(), self.preview_chars);
        let execution_context = render_context(&request.execution_context)?;
        let output_schema = serde_json::to_string_pretty(&diagnosis_schema().to_json_schema())?;

        self.library.render(
            DIAGNOSIS_TASK,
            &[
                ("system_instruction", instruction.as_str()),
                (
                    "architecture_reference",
                    self.library.template(ARCHITECTURE_REFERENCE)?,
                ),
                ("failure_taxonomy", self.library.template(FAILURE_TAXONOMY)?),
                ("conversation", conversation.as_str()),
                ("target_response", request.target_response_text().as_str()),
                ("feedback", request.feedback_text().as_str()),
                ("governing_prompt", governing_prompt.as_str()),
                ("variables", render_variables(state.variables()).as_str()),
                ("skills", render_skills(&request.skills).as_str()),
                ("skill_status", skill_status(request.skill_executed)),
                ("execution_context", execution_context.as_str()),
                ("output_schema", output_schema.as_str()),
            ],
        )
    }

    /// Ask the model for a diagnosis. Unparseable output comes back as
    /// `ParsedStep::Malformed`; only service and encoding failures are errors.
    pub async fn diagnose(
        &self,
        state: &PipelineState,
        request: &AnalysisRequest,
    ) -> Result<DiagnosisOutcome> {
        let prompt = self.build_prompt(state, request)?;
        let completion = self.gateway.invoke(&prompt, DIAGNOSIS_STEP).await?;
        let usage = StepUsage::measure(state.budget(), DIAGNOSIS_STEP, &prompt, &completion)?;

        let (parsed, warnings) = match parse_completion(&completion.text) {
            ParsedStep::Structured(value) => match build_diagnosis(&value) {
                Some((diagnosis, warnings)) => (ParsedStep::Structured(diagnosis), warnings),
                None => (ParsedStep::Malformed(completion.text), Vec::new()),
            },
            ParsedStep::Malformed(raw) => (ParsedStep::Malformed(raw), Vec::new()),
        };

        match &parsed {
            ParsedStep::Structured(diagnosis) => debug!(
                problem_type = ?diagnosis.problem_type,
                modifications = diagnosis.proposed_modifications.len(),
                confidence = diagnosis.confidence_score,
                warnings = warnings.len(),
                "Diagnosis parsed"
            ),
            ParsedStep::Malformed(raw) => {
                warn!("Diagnosis output was not JSON ({} chars)", raw.len())
            }
        }

        Ok(DiagnosisOutcome {
            parsed,
            warnings,
            usage,
        })
    }
}

/// Best-effort conversion of a parsed diagnosis. Every schema violation and
/// every modification that cannot be read is reported as a warning; only a
/// non-object payload is rejected.
pub fn build_diagnosis(value: &Value) -> Option<(Diagnosis, Vec<String>)> {
    let object = value.as_object()?;
    let mut warnings = diagnosis_schema().validate(value).errors;

    let text = |field: &str| -> String {
        object
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let problem_type = object
        .get("problem_type")
        .and_then(Value::as_str)
        .and_then(|raw| ProblemType::parse(&normalize_problem_type(raw)));

    let proposed_modifications = object
        .get("proposed_modifications")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| {
                    match serde_json::from_value::<Modification>(item.clone()) {
                        Ok(modification) => Some(modification),
                        Err(e) => {
                            warnings.push(format!(
                                "$.proposed_modifications[{}]: dropped ({})",
                                i, e
                            ));
                            None
                        }
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let test_scenarios = object
        .get("test_scenarios")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let confidence_score = object
        .get("confidence_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    let diagnosis = Diagnosis {
        identified_issue: text("identified_issue"),
        problem_type,
        root_cause_analysis: text("root_cause_analysis"),
        proposed_modifications,
        expected_impact: text("expected_impact"),
        test_scenarios,
        confidence_score,
    };
    Some((diagnosis, warnings))
}

fn normalize_problem_type(raw: &str) -> String {
    raw.trim().to_lowercase().replace(['-', ' '], "_")
}

fn preview(prompt: &str, max_chars: usize) -> String {
    let total = prompt.chars().count();
    if total <= max_chars {
        return prompt.to_string();
    }
    let head: String = prompt.chars().take(max_chars).collect();
    format!(
        "{}\n\n[... truncated: showing {} of {} characters]",
        head, max_chars, total
    )
}

fn render_variables(variables: &[PromptVariable]) -> String {
    if variables.is_empty() {
        return "(none)".to_string();
    }
    variables
        .iter()
        .map(|v| format!("### {}\n{}", v.name, v.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_skills(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return "(none)".to_string();
    }
    skills
        .iter()
        .map(|s| format!("- {}: {}", s.name, s.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn skill_status(executed: Option<bool>) -> &'static str {
    match executed {
        Some(true) => "a skill was executed while producing the reply under review.",
        Some(false) => "no skill was executed while producing the reply under review.",
        None => "not reported.",
    }
}

fn render_context(context: &Value) -> Result<String> {
    let empty = match context {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if empty {
        return Ok("(none)".to_string());
    }
    Ok(serde_json::to_string_pretty(context)?)
}
