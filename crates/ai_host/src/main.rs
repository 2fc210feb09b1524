//! CLI emfield-ai: чат, оценка сложности, статус, воркер движка.
//!
//! Логи идут в stderr: в режиме воркера stdout занят кадрами моста.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use ai_host::ai_config::{
    config_path, load_config, load_config_from, write_effective_config, AiConfig, LocalMode,
};
use ai_host::state::native_engine;
use ai_host::{commands, AppState};
use ai_providers::{ChatMessage, InferenceChunk, InferenceRequest, InferenceSource};
use ai_runtime::{ChatOutcome, ChunkEmitter, ComplexityEstimator};
use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use process_bridge::BridgeHost;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "emfield-ai", version)]
#[command(about = "Adaptive local/cloud inference router for the tutoring assistant", long_about = None)]
struct Cli {
    /// Path to ai_config.json (default: ~/.emfield/ai_config.json)
    #[arg(long, global = true, env = "EMFIELD_AI_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cloud endpoint base URL
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    /// Bearer token for the cloud endpoint
    #[arg(long, global = true, hide = true)]
    token: Option<String>,

    /// GGUF model for the local engine
    #[arg(long, global = true, value_name = "FILE")]
    model: Option<PathBuf>,

    /// Where the local engine runs
    #[arg(long, global = true, value_enum)]
    local_mode: Option<LocalModeArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LocalModeArg {
    Disabled,
    InProcess,
    Worker,
}

impl From<LocalModeArg> for LocalMode {
    fn from(arg: LocalModeArg) -> Self {
        match arg {
            LocalModeArg::Disabled => LocalMode::Disabled,
            LocalModeArg::InProcess => LocalMode::InProcess,
            LocalModeArg::Worker => LocalMode::Worker,
        }
    }
}

#[derive(Args)]
struct RequestArgs {
    /// Message text
    #[arg(required = true)]
    message: Vec<String>,

    /// Force a source: local, cloud or hybrid
    #[arg(long)]
    source: Option<InferenceSource>,

    /// Course context id
    #[arg(long)]
    course: Option<String>,

    /// Answer with the course knowledge base
    #[arg(long)]
    knowledge_base: bool,

    /// System prompt placed before the message
    #[arg(long)]
    system: Option<String>,
}

impl RequestArgs {
    fn into_request(self) -> InferenceRequest {
        let mut messages = Vec::new();
        if let Some(system) = self.system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(self.message.join(" ")));
        let mut request = InferenceRequest::new(messages);
        request.course_id = self.course;
        request.force_source = self.source;
        if self.knowledge_base {
            request.use_knowledge_base = Some(true);
        }
        request
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and stream the answer to stdout
    Chat(RequestArgs),
    /// Score a message and print the routing suggestion
    Estimate(RequestArgs),
    /// Print local engine status
    Status,
    /// Print the effective configuration
    Config {
        /// Save it to the config file (the token is kept only if it came from there)
        #[arg(long)]
        write: bool,
    },
    /// Serve the local engine over stdin/stdout
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = effective_config(&cli);
    let config_file = cli.config.clone().unwrap_or_else(config_path);
    match cli.command {
        Commands::Chat(args) => run_chat(config, args.into_request()).await,
        Commands::Estimate(args) => {
            let result = ComplexityEstimator::new(config.estimator).estimate(&args.into_request());
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Status => {
            let state = AppState::new(config).await.map_err(anyhow::Error::msg)?;
            let status = commands::status(&state).await.map_err(anyhow::Error::msg)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Config { write } => {
            if write {
                write_effective_config(&config_file, &config).map_err(anyhow::Error::msg)?;
            }
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
        Commands::Worker => run_worker().await,
    }
}

/// Файл → окружение → флаги.
fn effective_config(cli: &Cli) -> AiConfig {
    let mut config = match cli.config {
        Some(ref path) => {
            let mut config = load_config_from(path);
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => load_config(),
    };
    if let Some(ref url) = cli.base_url {
        config.cloud.base_url = url.clone();
    }
    if let Some(ref token) = cli.token {
        config.token = Some(token.clone());
    }
    if let Some(ref model) = cli.model {
        config.set_model_path(model.clone());
    }
    if let Some(mode) = cli.local_mode {
        config.local.mode = mode.into();
    }
    config
}

async fn run_chat(mut config: AiConfig, request: InferenceRequest) -> anyhow::Result<()> {
    // Для одиночного чата модель грузим сразу, если она есть.
    config.local.autoload = config.local.autoload || config.local.mode != LocalMode::Disabled;
    let state = AppState::new(config).await.map_err(anyhow::Error::msg)?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let printer: ChunkEmitter = Arc::new(|chunk: &InferenceChunk| match chunk {
        InferenceChunk::Metadata { source, .. } => eprintln!("[{}]", source.as_str()),
        InferenceChunk::Content { text } => {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
        InferenceChunk::Done {
            latency_ms,
            tokens_generated,
            ..
        } => eprintln!("\n[done in {latency_ms} ms, {tokens_generated} fragments]"),
        InferenceChunk::Error { message } => eprintln!("\n[error: {message}]"),
    });

    let outcome = commands::chat_with_cancel(&state, request, printer, cancel).await;
    commands::unload(&state).await.map_err(anyhow::Error::msg)?;
    match outcome {
        ChatOutcome::Completed { .. } => Ok(()),
        ChatOutcome::Aborted => {
            info!("chat aborted");
            Ok(())
        }
        ChatOutcome::Failed(message) => bail!(message),
    }
}

async fn run_worker() -> anyhow::Result<()> {
    let Some(engine) = native_engine().map_err(anyhow::Error::msg)? else {
        bail!("this build has no on-device engine; rebuild with `--features local`");
    };
    info!("engine worker: serving on stdio");
    BridgeHost::new(engine)
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("engine worker stopped")?;
    warn!("engine worker: caller closed the bridge");
    Ok(())
}
