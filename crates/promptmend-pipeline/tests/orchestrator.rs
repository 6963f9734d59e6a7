mod common;

use common::*;
use promptmend_cache::{MemoryResultCache, ResultCache};
use promptmend_core::{
    AnalysisStatus, ConversationTurn, ErrorKind, ModificationTarget, ProblemType,
    PromptMendError, PromptVariable, Result, ValidationVerdict,
};
use promptmend_pipeline::{
    PatchFailurePolicy, PipelineOrchestrator, PipelineSettings, PromptLibrary, TokenEncoder,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_incomplete_request_is_rejected_without_llm_calls() {
    let provider = ScriptedProvider::new(vec![diagnosis(vec![add_skill_modification()])]);
    let orchestrator = orchestrator(&provider);

    let mut request = password_reset_request();
    request.feedback = None;
    request.conversation_history.clear();

    let err = orchestrator.run_analysis(&request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Request);
    assert!(err.to_string().contains("conversation_history"));
    assert!(err.to_string().contains("feedback"));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_confident_first_iteration_succeeds_with_two_calls() {
    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![add_skill_modification()]),
        verdict(true, 0.92),
    ]);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Succeeded);
    assert_eq!(result.iterations, 1);
    assert_eq!(provider.calls(), 2);
    assert!(result.final_prompt.contains(PASSWORD_SKILL_LINE));
    assert!(result.last_error.is_none());
    assert!(!result.from_cache);

    let steps: Vec<&str> = result.token_usage.iter().map(|u| u.step.as_str()).collect();
    assert_eq!(steps, vec!["diagnosis", "validation"]);
    assert!(result.token_usage.iter().all(|u| u.estimated && u.iteration == 1));
    assert_eq!(
        result.total_tokens,
        result.token_usage.iter().map(|u| u.total_tokens).sum::<usize>()
    );

    let report = result.patch_report.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert!(report.skipped.is_empty());
}

#[tokio::test]
async fn test_low_confidence_is_bounded_by_max_iterations() {
    let mut script = Vec::new();
    for _ in 0..5 {
        script.push(diagnosis(vec![add_skill_modification()]));
        script.push(verdict(false, 0.4));
    }
    let provider = ScriptedProvider::new(script);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Exhausted);
    assert_eq!(result.iterations, 3);
    assert_eq!(provider.calls(), 6);
    assert_eq!(result.validation.unwrap().confidence, 0.4);

    // Round two diagnoses the already patched prompt
    let prompts = provider.prompts();
    assert!(!prompts[0].contains(PASSWORD_SKILL_LINE));
    assert!(prompts[2].contains(PASSWORD_SKILL_LINE));
}

#[tokio::test]
async fn test_service_error_then_success_clears_last_error() {
    let provider = ScriptedProvider::new(vec![
        Reply::Fail("connection reset by peer".into()),
        diagnosis(vec![add_skill_modification()]),
        verdict(true, 0.9),
    ]);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Succeeded);
    assert_eq!(result.iterations, 2);
    assert_eq!(provider.calls(), 3);
    assert!(result.last_error.is_none());
    assert!(result.token_usage.iter().all(|u| u.iteration == 2));
}

#[tokio::test]
async fn test_repeated_service_errors_end_exhausted() {
    let provider = ScriptedProvider::new(vec![
        Reply::Fail("503".into()),
        Reply::Fail("503".into()),
        Reply::Fail("503".into()),
    ]);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Exhausted);
    assert_eq!(result.iterations, 3);
    assert_eq!(result.final_prompt, GOVERNING_PROMPT);
    let last_error = result.last_error.unwrap();
    assert_eq!(last_error.kind, ErrorKind::Service);
    assert!(last_error.message.contains("503"));
}

#[tokio::test]
async fn test_cached_result_skips_the_llm() {
    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![add_skill_modification()]),
        verdict(true, 0.95),
    ]);
    let cache = Arc::new(MemoryResultCache::new());
    let orchestrator = orchestrator(&provider).with_cache(cache.clone());

    let first = orchestrator
        .run_analysis(&password_reset_request())
        .await
        .unwrap();
    assert!(!first.from_cache);

    // Turns older than the fingerprint window do not change the key
    let mut repeat = password_reset_request();
    repeat
        .conversation_history
        .insert(0, ConversationTurn::new("user", "hello there"));
    let second = orchestrator.run_analysis(&repeat).await.unwrap();

    assert!(second.from_cache);
    assert_eq!(second.final_prompt, first.final_prompt);
    assert_eq!(provider.calls(), 2);
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test]
async fn test_exhausted_results_are_not_cached() {
    let mut script = Vec::new();
    for _ in 0..3 {
        script.push(diagnosis(vec![add_skill_modification()]));
        script.push(verdict(false, 0.1));
    }
    script.push(diagnosis(vec![add_skill_modification()]));
    script.push(verdict(true, 0.9));
    let provider = ScriptedProvider::new(script);
    let orchestrator = orchestrator(&provider).with_cache(Arc::new(MemoryResultCache::new()));

    let first = orchestrator
        .run_analysis(&password_reset_request())
        .await
        .unwrap();
    assert_eq!(first.status, AnalysisStatus::Exhausted);

    let second = orchestrator
        .run_analysis(&password_reset_request())
        .await
        .unwrap();
    assert_eq!(second.status, AnalysisStatus::Succeeded);
    assert!(!second.from_cache);
    assert_eq!(provider.calls(), 8);
}

#[tokio::test]
async fn test_password_reset_scenario() {
    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![add_skill_modification()]),
        verdict(true, 0.88),
    ]);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    let diagnosis = result.diagnosis.as_ref().unwrap();
    assert_eq!(diagnosis.problem_type, Some(ProblemType::SkillExecution));
    assert!(!result.patch_report.as_ref().unwrap().applied.is_empty());

    let prompts = provider.prompts();
    assert!(prompts[0].contains("How do I reset my password?"));
    assert!(prompts[0].contains("no skill was executed"));
    // The validator sees the patched prompt
    assert!(prompts[1].contains(PASSWORD_SKILL_LINE));
    assert!(result
        .final_prompt
        .contains(&format!("- order_status: look up the status of an order\n{}", PASSWORD_SKILL_LINE)));
    assert!(matches!(
        result.status,
        AnalysisStatus::Succeeded | AnalysisStatus::Exhausted
    ));
}

#[tokio::test]
async fn test_malformed_diagnosis_consumes_an_iteration() {
    let provider = ScriptedProvider::new(vec![
        Reply::Text("I'm sorry, I can't produce JSON right now.".into()),
        diagnosis(vec![add_skill_modification()]),
        verdict(true, 0.9),
    ]);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Succeeded);
    assert_eq!(result.iterations, 2);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn test_always_malformed_diagnosis_reports_parse_error() {
    let provider = ScriptedProvider::new(vec![
        Reply::Text("no".into()),
        Reply::Text("still no".into()),
        Reply::Text("{ broken".into()),
    ]);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Exhausted);
    assert_eq!(provider.calls(), 3);
    assert_eq!(result.last_error.unwrap().kind, ErrorKind::Parse);
}

#[tokio::test]
async fn test_unusable_verdict_never_counts_as_success() {
    let mut script = Vec::new();
    for _ in 0..3 {
        script.push(diagnosis(vec![add_skill_modification()]));
        script.push(Reply::Text("Looks great, ship it!".into()));
    }
    let provider = ScriptedProvider::new(script);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Exhausted);
    assert_eq!(result.validation, Some(ValidationVerdict::failed()));
}

#[tokio::test]
async fn test_failed_iteration_does_not_leak_into_the_result() {
    let tone_edit = json!({
        "target": "governing-prompt",
        "locator": "## Tone",
        "original_text": "",
        "replacement_text": "ITERATION-TWO-EDIT"
    });
    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![add_skill_modification()]),
        verdict(false, 0.5),
        diagnosis(vec![tone_edit]),
        Reply::Fail("validation backend unavailable".into()),
    ]);
    let settings = PipelineSettings {
        max_iterations: 2,
        ..Default::default()
    };
    let result = orchestrator_with(&provider, settings)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Exhausted);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.last_error.as_ref().unwrap().kind, ErrorKind::Service);

    // Everything reported belongs to iteration one, whose prompt was kept
    assert!(result.final_prompt.contains(PASSWORD_SKILL_LINE));
    assert!(!result.final_prompt.contains("ITERATION-TWO-EDIT"));
    let diagnosis = result.diagnosis.unwrap();
    assert_eq!(
        diagnosis.proposed_modifications[0].replacement_text,
        PASSWORD_SKILL_LINE
    );
    let report = result.patch_report.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].locator, "## Skills");
    assert_eq!(result.validation.unwrap().confidence, 0.5);
}

#[tokio::test]
async fn test_null_optional_fields_from_the_model_are_tolerated() {
    let insert_with_nulls = json!({
        "target": "governing-prompt",
        "locator": "## Skills",
        "original_text": null,
        "replacement_text": PASSWORD_SKILL_LINE,
        "rationale": null
    });
    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![insert_with_nulls]),
        Reply::Text(r#"{"valid": true, "confidence": 0.95, "issues": null}"#.into()),
    ]);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Succeeded);
    assert_eq!(result.iterations, 1);
    assert!(result.final_prompt.contains(PASSWORD_SKILL_LINE));
    let verdict = result.validation.unwrap();
    assert!(verdict.valid);
    assert!(verdict.issues.is_empty());
}

#[tokio::test]
async fn test_wall_clock_timeout_abandons_the_call() {
    let provider = ScriptedProvider::new(vec![Reply::Hang]);
    let settings = PipelineSettings {
        request_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let result = orchestrator_with(&provider, settings)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Exhausted);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.final_prompt, GOVERNING_PROMPT);
    assert_eq!(result.last_error.unwrap().kind, ErrorKind::Timeout);
}

fn unlocatable_modification() -> serde_json::Value {
    json!({
        "target": "governing-prompt",
        "original_text": "Refunds are processed within thirty business days of the request",
        "replacement_text": "Refunds take five days."
    })
}

#[tokio::test]
async fn test_abort_policy_fails_the_iteration() {
    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![add_skill_modification(), unlocatable_modification()]),
        diagnosis(vec![add_skill_modification(), unlocatable_modification()]),
        diagnosis(vec![add_skill_modification(), unlocatable_modification()]),
    ]);
    let settings = PipelineSettings {
        patch_policy: PatchFailurePolicy::Abort,
        ..Default::default()
    };
    let result = orchestrator_with(&provider, settings)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Exhausted);
    // Validation is never reached
    assert_eq!(provider.calls(), 3);
    assert_eq!(result.final_prompt, GOVERNING_PROMPT);
    let last_error = result.last_error.unwrap();
    assert_eq!(last_error.kind, ErrorKind::PatchApplication);
    assert!(last_error.message.contains("#1"));
}

#[tokio::test]
async fn test_skip_policy_records_skipped_modifications() {
    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![add_skill_modification(), unlocatable_modification()]),
        verdict(true, 0.9),
    ]);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Succeeded);
    let report = result.patch_report.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].index, 0);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].index, 1);
}

#[tokio::test]
async fn test_variable_and_configuration_targets() {
    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![
            json!({
                "target": "variable-prompt",
                "locator": "greeting",
                "original_text": "Say hi.",
                "replacement_text": "Greet the user by first name."
            }),
            json!({
                "target": "model-configuration",
                "locator": "temperature",
                "replacement_text": "0.2",
                "rationale": "Less improvisation"
            }),
        ]),
        verdict(true, 0.9),
    ]);
    let mut request = password_reset_request();
    request.variables = vec![PromptVariable {
        name: "greeting".into(),
        content: "Say hi.".into(),
    }];

    let result = orchestrator(&provider).run_analysis(&request).await.unwrap();

    assert_eq!(result.status, AnalysisStatus::Succeeded);
    assert_eq!(result.final_prompt, GOVERNING_PROMPT);
    assert_eq!(result.final_variables[0].content, "Greet the user by first name.");
    assert_eq!(result.configuration_suggestions.len(), 1);
    assert_eq!(
        result.configuration_suggestions[0].target,
        ModificationTarget::ModelConfiguration
    );
}

#[tokio::test]
async fn test_configuration_only_diagnosis_is_a_failed_iteration() {
    let config_only = || {
        diagnosis(vec![json!({
            "target": "model-configuration",
            "locator": "max_tokens",
            "replacement_text": "2000"
        })])
    };
    let provider = ScriptedProvider::new(vec![config_only(), config_only(), config_only()]);
    let result = orchestrator(&provider)
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert_eq!(result.status, AnalysisStatus::Exhausted);
    assert_eq!(provider.calls(), 3);
    assert_eq!(result.last_error.unwrap().kind, ErrorKind::Schema);
}

#[tokio::test]
async fn test_over_budget_candidate_is_compressed() {
    let rules: Vec<String> = (1..=20)
        .map(|i| format!("- rule {}: keep every answer short and on topic", i))
        .collect();
    let mut request = password_reset_request();
    request.governing_prompt = Some(format!("## Rules\n\n{}\n", rules.join("\n")));
    request.model_config.max_tokens = Some(300);

    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![json!({
            "target": "governing-prompt",
            "original_text": "",
            "replacement_text": "Use password_reset for reset requests."
        })]),
        verdict(true, 0.9),
    ]);
    let result = orchestrator(&provider).run_analysis(&request).await.unwrap();

    assert!(result.final_prompt.contains("- rule 3:"));
    assert!(!result.final_prompt.contains("- rule 4:"));
    assert!(result.final_prompt.contains("[... 17 more items omitted]"));
    assert!(result.final_prompt.contains("Use password_reset for reset requests."));
    assert!(provider.prompts()[1].contains("[... 17 more items omitted]"));
}

struct BrokenEncoder;

impl TokenEncoder for BrokenEncoder {
    fn name(&self) -> &str {
        "broken"
    }

    fn encode(&self, _text: &str) -> Result<Vec<u32>> {
        Err(PromptMendError::Encoding("unsupported input".into()))
    }

    fn decode(&self, _tokens: &[u32]) -> Result<String> {
        Err(PromptMendError::Encoding("unsupported input".into()))
    }
}

#[tokio::test]
async fn test_encoding_failure_is_fatal() {
    let provider = ScriptedProvider::new(vec![diagnosis(vec![add_skill_modification()])]);
    let orchestrator = PipelineOrchestrator::new(
        Arc::new(promptmend_ai::LLMGateway::new(provider.clone())),
        Arc::new(PromptLibrary::builtin().unwrap()),
        Arc::new(BrokenEncoder),
        PipelineSettings::default(),
        &Default::default(),
    );

    let err = orchestrator
        .run_analysis(&password_reset_request())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Encoding);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_disk_cache_survives_a_new_orchestrator() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        diagnosis(vec![add_skill_modification()]),
        verdict(true, 0.9),
    ]);

    let cache = promptmend_cache::DiskResultCache::open(dir.path()).await.unwrap();
    let first = orchestrator(&provider)
        .with_cache(Arc::new(cache))
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    let reopened = promptmend_cache::DiskResultCache::open(dir.path()).await.unwrap();
    let second = orchestrator(&provider)
        .with_cache(Arc::new(reopened))
        .run_analysis(&password_reset_request())
        .await
        .unwrap();

    assert!(second.from_cache);
    assert_eq!(second.final_prompt, first.final_prompt);
    assert_eq!(provider.calls(), 2);
}
