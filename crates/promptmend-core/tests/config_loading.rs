use promptmend_core::{ConfigError, ConfigManager, PromptMendConfig};
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_from_file_merges_sections() {
    let file = write_config(
        r#"
        [llm]
        provider = "ollama"
        model = "qwen2.5:14b"

        [pipeline]
        max_iterations = 4
        patch_failure_policy = "abort"

        [compression]
        max_list_items = 5

        [cache]
        backend = "disk"
        directory = "/tmp/promptmend-test-cache"
        "#,
    );

    let manager = ConfigManager::load_from(file.path()).unwrap();
    let config = manager.config();

    assert_eq!(config.llm.model.as_deref(), Some("qwen2.5:14b"));
    assert_eq!(config.pipeline.max_iterations, 4);
    assert_eq!(config.pipeline.patch_failure_policy, "abort");
    assert_eq!(config.compression.max_list_items, 5);
    assert_eq!(config.compression.example_char_cap, 200);
    assert_eq!(
        config.cache.resolved_directory(),
        std::path::PathBuf::from("/tmp/promptmend-test-cache")
    );
}

#[test]
fn test_invalid_policy_is_rejected() {
    let file = write_config(
        r#"
        [pipeline]
        patch_failure_policy = "retry"
        "#,
    );

    match ConfigManager::load_from(file.path()) {
        Err(ConfigError::ValidationError(message)) => assert!(message.contains("retry")),
        other => panic!("expected validation error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let file = write_config("[pipeline\nmax_iterations = ");
    assert!(matches!(
        ConfigManager::load_from(file.path()),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        ConfigManager::load_from(&missing),
        Err(ConfigError::NotFound(_))
    ));
}

#[test]
fn test_config_error_converts_to_fatal_pipeline_error() {
    let err: promptmend_core::PromptMendError =
        ConfigError::ValidationError("bad".to_string()).into();
    assert!(err.is_fatal());

    let manager = ConfigManager::from_config(PromptMendConfig::default()).unwrap();
    assert!(manager.config_path().is_none());
}
