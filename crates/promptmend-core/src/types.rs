use crate::error::{ErrorReport, PromptMendError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Optional LLM-facing fields: an explicit `null` reads the same as a
/// missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One turn of the conversation that led to the unsatisfactory reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Target responses and feedback arrive either as plain text or as a
/// structured object produced by the calling application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOrObject {
    Text(String),
    Structured(Value),
}

impl TextOrObject {
    pub fn is_empty(&self) -> bool {
        match self {
            TextOrObject::Text(text) => text.trim().is_empty(),
            TextOrObject::Structured(Value::Null) => true,
            TextOrObject::Structured(Value::Object(map)) => map.is_empty(),
            TextOrObject::Structured(Value::Array(items)) => items.is_empty(),
            TextOrObject::Structured(Value::String(text)) => text.trim().is_empty(),
            TextOrObject::Structured(_) => false,
        }
    }

    /// Human-readable rendering used in prompts and fingerprints.
    ///
    /// Structured values are rendered with `serde_json`, whose default map is
    /// key-sorted, so the same logical object always renders identically.
    pub fn render(&self) -> String {
        match self {
            TextOrObject::Text(text) => text.clone(),
            TextOrObject::Structured(Value::String(text)) => text.clone(),
            TextOrObject::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

impl From<&str> for TextOrObject {
    fn from(text: &str) -> Self {
        TextOrObject::Text(text.to_string())
    }
}

impl From<String> for TextOrObject {
    fn from(text: String) -> Self {
        TextOrObject::Text(text)
    }
}

/// Named configuration variable injected into the bot's prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptVariable {
    pub name: String,
    pub content: String,
}

/// Named capability the bot may invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Model settings supplied with the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Model identifier, informational only
    #[serde(default)]
    pub model: Option<String>,
    /// Context limit the token budget is derived from
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Default sampling temperature of the bot
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Inbound request: one user complaint about one bot reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(default, alias = "conversationHistory")]
    pub conversation_history: Vec<ConversationTurn>,
    #[serde(default, alias = "targetResponse")]
    pub target_response: Option<TextOrObject>,
    #[serde(default)]
    pub feedback: Option<TextOrObject>,
    #[serde(default, alias = "executionContext")]
    pub execution_context: Value,
    #[serde(default, alias = "governingPrompt", alias = "system_prompt")]
    pub governing_prompt: Option<String>,
    #[serde(default)]
    pub variables: Vec<PromptVariable>,
    #[serde(default)]
    pub skills: Vec<Skill>,
    #[serde(default, alias = "skillExecuted")]
    pub skill_executed: Option<bool>,
    #[serde(default, alias = "modelConfig")]
    pub model_config: ModelSettings,
}

impl AnalysisRequest {
    /// Check the mandatory fields, reporting every missing one at once.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        if self.conversation_history.is_empty() {
            missing.push("conversation_history");
        }
        if self.target_response.as_ref().map_or(true, TextOrObject::is_empty) {
            missing.push("target_response");
        }
        if self.feedback.as_ref().map_or(true, TextOrObject::is_empty) {
            missing.push("feedback");
        }
        if self.governing_prompt.is_none() {
            missing.push("governing_prompt");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PromptMendError::Request(format!(
                "missing mandatory field(s): {}",
                missing.join(", ")
            )))
        }
    }

    pub fn governing_prompt_text(&self) -> &str {
        self.governing_prompt.as_deref().unwrap_or_default()
    }

    pub fn target_response_text(&self) -> String {
        self.target_response
            .as_ref()
            .map(TextOrObject::render)
            .unwrap_or_default()
    }

    pub fn feedback_text(&self) -> String {
        self.feedback
            .as_ref()
            .map(TextOrObject::render)
            .unwrap_or_default()
    }

    /// The trailing `window` turns of the conversation.
    pub fn recent_turns(&self, window: usize) -> &[ConversationTurn] {
        let start = self.conversation_history.len().saturating_sub(window);
        &self.conversation_history[start..]
    }
}

/// Which artifact a proposed modification edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModificationTarget {
    #[serde(alias = "governing_prompt", alias = "system_prompt", alias = "prompt")]
    GoverningPrompt,
    #[serde(alias = "variable_prompt", alias = "variable")]
    VariablePrompt,
    #[serde(alias = "model_configuration", alias = "model_config")]
    ModelConfiguration,
}

impl fmt::Display for ModificationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModificationTarget::GoverningPrompt => write!(f, "governing-prompt"),
            ModificationTarget::VariablePrompt => write!(f, "variable-prompt"),
            ModificationTarget::ModelConfiguration => write!(f, "model-configuration"),
        }
    }
}

/// One proposed text edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub target: ModificationTarget,
    /// Section heading, variable name or configuration key
    #[serde(
        default,
        deserialize_with = "null_as_default",
        alias = "path",
        alias = "section"
    )]
    pub locator: String,
    /// Text expected in the current artifact; empty means "insert"
    #[serde(default, deserialize_with = "null_as_default", alias = "original")]
    pub original_text: String,
    #[serde(alias = "replacement", alias = "new_text")]
    pub replacement_text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rationale: String,
}

/// Failure taxonomy the diagnosis classifies problems into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemType {
    SkillExecution,
    InstructionConflict,
    MissingInstruction,
    AmbiguousInstruction,
    OutputFormat,
    KnowledgeGap,
    ToneStyle,
    Other,
}

impl ProblemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemType::SkillExecution => "skill_execution",
            ProblemType::InstructionConflict => "instruction_conflict",
            ProblemType::MissingInstruction => "missing_instruction",
            ProblemType::AmbiguousInstruction => "ambiguous_instruction",
            ProblemType::OutputFormat => "output_format",
            ProblemType::KnowledgeGap => "knowledge_gap",
            ProblemType::ToneStyle => "tone_style",
            ProblemType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skill_execution" => Some(ProblemType::SkillExecution),
            "instruction_conflict" => Some(ProblemType::InstructionConflict),
            "missing_instruction" => Some(ProblemType::MissingInstruction),
            "ambiguous_instruction" => Some(ProblemType::AmbiguousInstruction),
            "output_format" => Some(ProblemType::OutputFormat),
            "knowledge_gap" => Some(ProblemType::KnowledgeGap),
            "tone_style" => Some(ProblemType::ToneStyle),
            "other" => Some(ProblemType::Other),
            _ => None,
        }
    }

    pub fn all() -> Vec<Self> {
        vec![
            ProblemType::SkillExecution,
            ProblemType::InstructionConflict,
            ProblemType::MissingInstruction,
            ProblemType::AmbiguousInstruction,
            ProblemType::OutputFormat,
            ProblemType::KnowledgeGap,
            ProblemType::ToneStyle,
            ProblemType::Other,
        ]
    }
}

/// Repair recommendation produced by the diagnosis step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub identified_issue: String,
    #[serde(default)]
    pub problem_type: Option<ProblemType>,
    pub root_cause_analysis: String,
    pub proposed_modifications: Vec<Modification>,
    pub expected_impact: String,
    pub test_scenarios: Vec<String>,
    pub confidence_score: f64,
}

/// Outcome of the second-opinion validation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    pub confidence: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub issues: Vec<String>,
}

impl ValidationVerdict {
    /// Conservative verdict used whenever the validation output is unusable.
    pub fn failed() -> Self {
        Self {
            valid: false,
            confidence: 0.0,
            issues: vec!["Validation failed".to_string()],
        }
    }
}

/// Token spend of one LLM call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub iteration: u32,
    pub step: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    /// True when the provider reported no usage and the numbers were counted locally
    #[serde(default)]
    pub estimated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub index: usize,
    pub target: ModificationTarget,
    pub locator: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPatch {
    pub index: usize,
    pub reason: String,
}

/// Which modifications of a batch were applied and which were skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchReport {
    pub applied: Vec<AppliedPatch>,
    pub skipped: Vec<SkippedPatch>,
}

impl PatchReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[serde(rename = "success")]
    Succeeded,
    Exhausted,
}

/// Terminal output of one analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub status: AnalysisStatus,
    pub fingerprint: String,
    pub final_prompt: String,
    #[serde(default)]
    pub final_variables: Vec<PromptVariable>,
    pub diagnosis: Option<Diagnosis>,
    #[serde(default)]
    pub diagnosis_warnings: Vec<String>,
    pub validation: Option<ValidationVerdict>,
    #[serde(default)]
    pub patch_report: Option<PatchReport>,
    /// Model-configuration changes, reported rather than applied
    #[serde(default)]
    pub configuration_suggestions: Vec<Modification>,
    pub iterations: u32,
    pub total_tokens: usize,
    #[serde(default)]
    pub token_usage: Vec<TokenUsage>,
    pub last_error: Option<ErrorReport>,
    #[serde(default)]
    pub from_cache: bool,
}

impl AnalysisResult {
    pub fn is_success(&self) -> bool {
        self.status == AnalysisStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete_request() -> AnalysisRequest {
        AnalysisRequest {
            conversation_history: vec![ConversationTurn::new("user", "hi")],
            target_response: Some("hello".into()),
            feedback: Some("too terse".into()),
            governing_prompt: Some("Be helpful.".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_complete_request_validates() {
        assert!(complete_request().validate().is_ok());
    }

    #[test]
    fn test_validation_reports_all_missing_fields() {
        let request = AnalysisRequest::default();
        let err = request.validate().unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, PromptMendError::Request(_)));
        for field in [
            "conversation_history",
            "target_response",
            "feedback",
            "governing_prompt",
        ] {
            assert!(message.contains(field), "{} not reported", field);
        }
    }

    #[test]
    fn test_blank_feedback_is_missing() {
        let mut request = complete_request();
        request.feedback = Some("   ".into());
        assert!(request.validate().is_err());

        request.feedback = Some(TextOrObject::Structured(json!({})));
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_request_accepts_camel_case_and_structured_fields() {
        let request: AnalysisRequest = serde_json::from_value(json!({
            "conversationHistory": [{"role": "user", "content": "reset?"}],
            "targetResponse": {"text": "no", "intent": "fallback"},
            "feedback": "should use the skill",
            "governingPrompt": "You are a support bot.",
            "skillExecuted": false
        }))
        .unwrap();

        assert!(request.validate().is_ok());
        assert_eq!(request.skill_executed, Some(false));
        assert!(request.target_response_text().contains("\"intent\": \"fallback\""));
    }

    #[test]
    fn test_recent_turns_window() {
        let mut request = complete_request();
        request.conversation_history = (0..5)
            .map(|i| ConversationTurn::new("user", format!("turn {}", i)))
            .collect();

        let tail = request.recent_turns(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "turn 2");
        assert_eq!(request.recent_turns(10).len(), 5);
    }

    #[test]
    fn test_null_optional_fields_read_as_empty() {
        let m: Modification = serde_json::from_value(json!({
            "target": "governing-prompt",
            "locator": null,
            "original_text": null,
            "replacement_text": "Use password_reset for reset requests.",
            "rationale": null
        }))
        .unwrap();
        assert!(m.locator.is_empty());
        assert!(m.original_text.is_empty());
        assert!(m.rationale.is_empty());

        let verdict: ValidationVerdict =
            serde_json::from_value(json!({"valid": true, "confidence": 0.95, "issues": null}))
                .unwrap();
        assert!(verdict.valid);
        assert!(verdict.issues.is_empty());
    }

    #[test]
    fn test_modification_target_aliases() {
        let m: Modification = serde_json::from_value(json!({
            "target": "system_prompt",
            "section": "## Skills",
            "original_text": "",
            "replacement_text": "Use the password-reset skill."
        }))
        .unwrap();
        assert_eq!(m.target, ModificationTarget::GoverningPrompt);
        assert_eq!(m.locator, "## Skills");
        assert!(m.rationale.is_empty());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(AnalysisStatus::Succeeded).unwrap(),
            json!("success")
        );
        assert_eq!(
            serde_json::to_value(AnalysisStatus::Exhausted).unwrap(),
            json!("exhausted")
        );
    }

    #[test]
    fn test_problem_type_round_trip_names() {
        for problem in ProblemType::all() {
            assert_eq!(ProblemType::parse(problem.as_str()), Some(problem));
        }
    }
}
