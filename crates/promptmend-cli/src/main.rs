use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use promptmend_ai::{LLMGateway, LLMProviderFactory};
use promptmend_cache::{create_cache, Fingerprint};
use promptmend_core::{
    AnalysisRequest, AnalysisResult, ConfigManager, LoggingConfig, PromptMendError,
};
use promptmend_pipeline::{encoder_from_config, PipelineOrchestrator, PromptLibrary};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_EXHAUSTED: u8 = 2;

#[derive(Parser)]
#[command(name = "promptmend")]
#[command(about = "PromptMend - repair bot prompts from user feedback", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: ./.promptmend.toml, then ~/.promptmend/config.toml)
    #[arg(short, long, global = true, env = "PROMPTMEND_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose and repair the governing prompt of one request
    Analyze {
        /// Request file (JSON)
        #[arg(short, long)]
        request: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "pretty")]
        output: OutputFormat,

        /// Skip the result cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Write a configuration file with every default spelled out
    InitConfig {
        /// Destination
        #[arg(default_value = ".promptmend.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the cache fingerprint of a request
    Fingerprint {
        /// Request file (JSON)
        #[arg(short, long)]
        request: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match execute_command(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let json_output = matches!(
                cli.command,
                Commands::Analyze {
                    output: OutputFormat::Json,
                    ..
                }
            );
            if json_output {
                println!("{}", error_payload(&e));
            } else {
                eprintln!("{} {:#}", "Error:".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<u8> {
    match &cli.command {
        Commands::InitConfig { path, force } => execute_init_config(path, *force),
        Commands::Fingerprint { request } => {
            let request = read_request(request)?;
            println!("{}", Fingerprint::of(&request));
            Ok(0)
        }
        Commands::Analyze {
            request,
            output,
            no_cache,
        } => {
            let manager = load_config(cli.config.as_deref())?;
            init_tracing(&manager.config().logging, cli.verbose);
            match manager.config_path() {
                Some(path) => info!("📄 Config file: {}", path.display()),
                None => info!("📄 Config file: NONE (using defaults)"),
            }
            execute_analyze(&manager, request, *output, *no_cache).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ConfigManager> {
    let manager = match path {
        Some(path) => ConfigManager::load_from(path),
        None => ConfigManager::load(),
    };
    manager
        .map_err(PromptMendError::from)
        .context("Failed to load configuration")
}

/// Logs go to stderr so `--output json` stays machine readable
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        "compact" => registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }
}

fn read_request(path: &Path) -> Result<AnalysisRequest> {
    let content = std::fs::read_to_string(path)
        .map_err(PromptMendError::from)
        .with_context(|| format!("Failed to read request file {}", path.display()))?;
    let request = serde_json::from_str(&content).map_err(|e| {
        PromptMendError::Request(format!("malformed request {}: {}", path.display(), e))
    })?;
    Ok(request)
}

fn execute_init_config(path: &Path, force: bool) -> Result<u8> {
    if path.exists() && !force {
        return Err(PromptMendError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ))
        .into());
    }
    ConfigManager::create_default_config(path).map_err(PromptMendError::from)?;
    println!(
        "{} {}",
        "Wrote default configuration to".green(),
        path.display().to_string().bold()
    );
    Ok(0)
}

async fn execute_analyze(
    manager: &ConfigManager,
    request_path: &Path,
    output: OutputFormat,
    no_cache: bool,
) -> Result<u8> {
    let config = manager.config();
    let request = read_request(request_path)?;

    let provider = LLMProviderFactory::create_from_config(&config.llm)
        .map_err(|e| PromptMendError::Config(format!("{:#}", e)))?;
    let gateway = Arc::new(
        LLMGateway::new(provider)
            .with_step_overrides(config.steps.clone())
            .with_default_temperature(config.model.temperature),
    );
    let library = Arc::new(PromptLibrary::builtin()?);

    // Pretrained tokenizers may be fetched over blocking HTTP
    let tokenizer = config.tokenizer.clone();
    let encoder = tokio::task::spawn_blocking(move || encoder_from_config(&tokenizer))
        .await
        .context("Tokenizer loading task failed")??;

    let mut orchestrator = PipelineOrchestrator::from_config(config, gateway, library, encoder)?;
    if !no_cache {
        if let Some(cache) = create_cache(&config.cache).await? {
            info!("💾 Result cache: {}", cache.backend_name());
            orchestrator = orchestrator.with_cache(cache);
        }
    }

    let result = orchestrator.run_analysis(&request).await?;
    print_result(output, &result)?;

    Ok(if result.is_success() { 0 } else { EXIT_EXHAUSTED })
}

/// `{"error": {"kind", "message"}}`; errors raised outside the pipeline
/// report kind "internal".
fn error_payload(error: &anyhow::Error) -> Value {
    let kind = error
        .downcast_ref::<PromptMendError>()
        .map_or("internal", |e| e.kind().as_str());
    json!({
        "error": {
            "kind": kind,
            "message": format!("{:#}", error),
        }
    })
}

fn print_result(format: OutputFormat, result: &AnalysisResult) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        OutputFormat::Pretty => print_pretty(result),
    }
    Ok(())
}

fn print_pretty(result: &AnalysisResult) {
    let status = if result.is_success() {
        "success".green().bold()
    } else {
        "exhausted".red().bold()
    };
    println!("{}: {}", "status".cyan().bold(), status);
    println!("{}: {}", "fingerprint".cyan().bold(), result.fingerprint);
    println!(
        "{}: {}",
        "iterations".cyan().bold(),
        result.iterations.to_string().yellow()
    );
    println!(
        "{}: {}",
        "total_tokens".cyan().bold(),
        result.total_tokens.to_string().yellow()
    );
    if result.from_cache {
        println!("{}: {}", "from_cache".cyan().bold(), "true".green());
    }

    if let Some(diagnosis) = &result.diagnosis {
        println!("\n{}", "Diagnosis".cyan().bold());
        println!("  {}", diagnosis.identified_issue);
        if let Some(problem_type) = diagnosis.problem_type {
            println!("  type: {}", problem_type.as_str().yellow());
        }
        println!("  root cause: {}", diagnosis.root_cause_analysis);
    }
    for warning in &result.diagnosis_warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }

    if let Some(report) = &result.patch_report {
        println!("\n{}", "Modifications".cyan().bold());
        for applied in &report.applied {
            println!(
                "  {} #{} {} {} (similarity {:.2})",
                "applied".green(),
                applied.index,
                applied.target,
                applied.locator,
                applied.similarity
            );
        }
        for skipped in &report.skipped {
            println!("  {} #{} {}", "skipped".red(), skipped.index, skipped.reason);
        }
    }
    for suggestion in &result.configuration_suggestions {
        println!(
            "  {} {} = {}",
            "suggested".yellow(),
            suggestion.locator,
            suggestion.replacement_text
        );
    }

    if let Some(verdict) = &result.validation {
        println!(
            "\n{}: valid={} confidence={:.2}",
            "Validation".cyan().bold(),
            verdict.valid,
            verdict.confidence
        );
        for issue in &verdict.issues {
            println!("  - {}", issue);
        }
    }

    if let Some(error) = &result.last_error {
        println!("\n{}: {}", "last_error".red().bold(), error);
    }

    println!("\n{}\n{}", "Final prompt".cyan().bold(), result.final_prompt);
    for variable in &result.final_variables {
        println!("\n{} {}\n{}", "Variable".cyan().bold(), variable.name, variable.content);
    }
}
