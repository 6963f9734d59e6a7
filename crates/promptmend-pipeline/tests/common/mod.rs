#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use promptmend_ai::{
    GenerationConfig, LLMGateway, LLMProvider, LLMResponse, LLMResult, Message,
    ProviderCharacteristics,
};
use promptmend_core::{AnalysisRequest, CompressionConfig, ConversationTurn, Skill};
use promptmend_pipeline::{ByteLevelEncoder, PipelineOrchestrator, PipelineSettings, PromptLibrary};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GOVERNING_PROMPT: &str = "# Support Assistant\n\nYou help Acme customers with account questions.\n\n## Skills\n\n- order_status: look up the status of an order\n\n## Tone\n\nBe friendly and brief.\n";

pub const PASSWORD_SKILL_LINE: &str =
    "- password_reset: send a reset link whenever a user cannot log in or asks to reset a password";

/// One scripted provider answer
pub enum Reply {
    Text(String),
    Fail(String),
    /// Never answers within any reasonable test timeout
    Hang,
}

/// Provider that replays a fixed script and records every prompt it sees
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn generate_chat(
        &self,
        messages: &[Message],
        _config: &GenerationConfig,
    ) -> LLMResult<LLMResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push(messages.iter().map(|m| m.content.as_str()).collect());

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Reply::Text(text)) => Ok(LLMResponse::text(text, "scripted")),
            Some(Reply::Fail(message)) => Err(anyhow!(message).context("Failed to send request")),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow!("hung call finished"))
            }
            None => Err(anyhow!("script exhausted")),
        }
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    fn characteristics(&self) -> ProviderCharacteristics {
        ProviderCharacteristics {
            max_tokens: 8192,
            avg_latency_ms: 0,
            rpm_limit: None,
        }
    }
}

pub fn orchestrator(provider: &Arc<ScriptedProvider>) -> PipelineOrchestrator {
    orchestrator_with(provider, PipelineSettings::default())
}

pub fn orchestrator_with(
    provider: &Arc<ScriptedProvider>,
    settings: PipelineSettings,
) -> PipelineOrchestrator {
    let gateway = Arc::new(LLMGateway::new(provider.clone()));
    PipelineOrchestrator::new(
        gateway,
        Arc::new(PromptLibrary::builtin().unwrap()),
        Arc::new(ByteLevelEncoder),
        settings,
        &CompressionConfig::default(),
    )
}

pub fn password_reset_request() -> AnalysisRequest {
    AnalysisRequest {
        conversation_history: vec![
            ConversationTurn::new("user", "How do I reset my password?"),
            ConversationTurn::new("bot", "I can't help with that."),
        ],
        target_response: Some("I can't help with that.".into()),
        feedback: Some("Bot should have used the password-reset skill".into()),
        governing_prompt: Some(GOVERNING_PROMPT.to_string()),
        skills: vec![Skill {
            name: "password_reset".into(),
            description: "Sends a password reset link".into(),
        }],
        skill_executed: Some(false),
        ..Default::default()
    }
}

pub fn add_skill_modification() -> Value {
    json!({
        "target": "governing-prompt",
        "locator": "## Skills",
        "original_text": "",
        "replacement_text": PASSWORD_SKILL_LINE,
        "rationale": "The prompt never tells the bot the skill exists"
    })
}

pub fn diagnosis_json(problem_type: &str, modifications: Vec<Value>) -> String {
    json!({
        "identified_issue": "The bot refused a request one of its skills handles",
        "problem_type": problem_type,
        "root_cause_analysis": "The governing prompt lists no password_reset skill",
        "proposed_modifications": modifications,
        "expected_impact": "The bot invokes password_reset for reset requests",
        "test_scenarios": ["I forgot my password", "Reset my login please"],
        "confidence_score": 0.8
    })
    .to_string()
}

pub fn diagnosis(modifications: Vec<Value>) -> Reply {
    Reply::Text(format!(
        "```json\n{}\n```",
        diagnosis_json("skill_execution", modifications)
    ))
}

pub fn verdict(valid: bool, confidence: f64) -> Reply {
    let issues: Vec<&str> = if valid { Vec::new() } else { vec!["Still ambiguous"] };
    Reply::Text(json!({"valid": valid, "confidence": confidence, "issues": issues}).to_string())
}
