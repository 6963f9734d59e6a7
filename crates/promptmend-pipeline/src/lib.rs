pub mod compression;
pub mod diagnosis;
pub mod extract;
pub mod orchestrator;
pub mod parsed;
pub mod patch;
pub mod prompts;
pub mod schema;
pub mod state;
pub mod tokens;
pub mod validation;

pub use compression::{
    BlankLineCollapse, CompressionAgent, CompressionError, ExampleTruncation, Heuristic,
    ListCollapse,
};
pub use diagnosis::{DiagnosisOutcome, DiagnosticAgent, DIAGNOSIS_STEP};
pub use extract::extract_json;
pub use orchestrator::{PatchFailurePolicy, PipelineOrchestrator, PipelineSettings};
pub use parsed::{parse_completion, ParsedStep};
pub use patch::{PatchEngine, PatchFailure, PatchOutcome, DEFAULT_MATCH_THRESHOLD};
pub use prompts::PromptLibrary;
pub use schema::{diagnosis_schema, verdict_schema, FieldSchema, ObjectSchema, SchemaKind, SchemaReport};
pub use state::{PipelinePhase, PipelineState, StepUsage};
pub use tokens::{
    encoder_from_config, ByteLevelEncoder, HfTokenizerEncoder, TokenBudgetManager, TokenEncoder,
};
pub use validation::{ValidationAgent, ValidationOutcome, VALIDATION_STEP};
