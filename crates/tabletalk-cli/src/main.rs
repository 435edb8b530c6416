//! Tabletalk CLI
//!
//! - `serve`: HTTP entry point for chat requests
//! - `ask`: run one request from the terminal
//! - `tools`: print the operation catalog as sent to the model

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use tabletalk_core::config::parse_host_list;
use tabletalk_core::{
    registry, ChatModel, ChatRequest, ChatService, CoreConfig, LoopOptions, MockModel,
    ModelConfig, OpenAiChatModel, Orchestrator, RestConnector, StopReason,
};

mod server;

const DEFAULT_LOG_FILTER: &str = "tabletalk=info,tabletalk_core=info";

#[derive(Parser)]
#[command(name = "tabletalk")]
#[command(
    author,
    version,
    about = "Tabletalk: talk to your database in plain language"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve chat requests over HTTP.
    Serve(ServeArgs),

    /// Send one question and print the answer.
    Ask(AskArgs),

    /// Print the tool catalog (JSON, chat-completions `tools` form).
    Tools,
}

/// Settings shared by `serve` and `ask`. Each flag overrides its environment
/// variable.
#[derive(Args, Debug, Clone)]
struct RuntimeArgs {
    /// Use the offline keyword model instead of a chat-completion service.
    #[arg(long)]
    llm_mock: bool,

    /// Chat model name (default: `OPENAI_MODEL` or gpt-4o-mini).
    #[arg(long)]
    model: Option<String>,

    /// Chat-completions base URL (default: `OPENAI_BASE_URL` or https://api.openai.com/v1).
    #[arg(long)]
    model_base_url: Option<String>,

    /// Maximum tool rounds per request (1..=64).
    #[arg(long)]
    max_rounds: Option<usize>,

    /// Per-call timeout for the data gateway.
    #[arg(long)]
    backend_timeout_secs: Option<u64>,

    /// Per-call timeout for the chat model.
    #[arg(long)]
    model_timeout_secs: Option<u64>,

    /// Host suffix the connection endpoint must end with (repeatable).
    #[arg(long = "allowed-host")]
    allowed_hosts: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct ServeArgs {
    /// Listen address (use `127.0.0.1:0` to auto-pick a free port).
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,

    /// Write `{version, addr, pid}` JSON here once listening.
    #[arg(long)]
    ready_file: Option<PathBuf>,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

#[derive(Args, Debug, Clone)]
struct AskArgs {
    /// Data gateway endpoint, e.g. https://your-project.supabase.co
    #[arg(long)]
    endpoint: String,

    /// Data gateway API key.
    #[arg(long, env = "TABLETALK_CONNECTION_CREDENTIAL", hide_env_values = true)]
    credential: String,

    /// Print the raw JSON response body.
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    runtime: RuntimeArgs,

    /// The question.
    #[arg(required = true)]
    question: Vec<String>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = resolve_config(&args.runtime)?;
            let service = build_service(&args.runtime, config)?;
            server::cmd_serve(&args, service)
        }
        Commands::Ask(args) => cmd_ask(args),
        Commands::Tools => {
            let tools = registry::tools_json();
            println!("{}", serde_json::to_string_pretty(&tools)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn secs(value: u64, flag: &str) -> Result<Duration> {
    if value == 0 {
        return Err(anyhow!("{flag} must be at least 1"));
    }
    Ok(Duration::from_secs(value))
}

fn resolve_config(args: &RuntimeArgs) -> Result<CoreConfig> {
    let mut config = CoreConfig::from_env()?;
    if let Some(rounds) = args.max_rounds {
        config = config.with_max_tool_rounds(rounds);
    }
    if let Some(s) = args.backend_timeout_secs {
        config.backend_timeout = secs(s, "--backend-timeout-secs")?;
    }
    if let Some(s) = args.model_timeout_secs {
        config.model_timeout = secs(s, "--model-timeout-secs")?;
    }
    if !args.allowed_hosts.is_empty() {
        config.allowed_hosts = args
            .allowed_hosts
            .iter()
            .flat_map(|h| parse_host_list(h))
            .collect();
    }
    Ok(config)
}

pub(crate) fn build_service(args: &RuntimeArgs, config: CoreConfig) -> Result<ChatService> {
    let model: Arc<dyn ChatModel> = if args.llm_mock {
        Arc::new(MockModel::new())
    } else {
        let mut model_config = ModelConfig::from_env(config.model_timeout)?;
        if let Some(m) = &args.model {
            model_config.model = m.clone();
        }
        if let Some(url) = &args.model_base_url {
            model_config.base_url = url.clone();
        }
        Arc::new(OpenAiChatModel::new(model_config)?)
    };
    let orchestrator = Orchestrator::new(model, LoopOptions::from_config(&config));
    let connector = Arc::new(RestConnector::from_config(&config));
    Ok(ChatService::new(orchestrator, connector, config))
}

fn cmd_ask(args: AskArgs) -> Result<()> {
    let config = resolve_config(&args.runtime)?;
    let service = build_service(&args.runtime, config)?;
    let request = ChatRequest::question(&args.endpoint, &args.credential, args.question.join(" "));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;
    let reply = rt.block_on(service.handle(request));

    if args.json {
        println!("{}", reply.to_json());
    } else if let Some(kind) = reply.body.error {
        eprintln!(
            "{} {}",
            format!("error[{}]:", kind.as_str()).red().bold(),
            reply.body.response
        );
    } else {
        println!("{}", reply.body.response);
        if let Some(outcome) = &reply.outcome {
            if outcome.stop == StopReason::RoundLimit {
                eprintln!(
                    "{}",
                    format!("note: stopped after {} tool rounds", outcome.rounds).yellow()
                );
            }
        }
    }

    match reply.body.error {
        Some(kind) => Err(anyhow!("request failed: {}", kind.as_str())),
        None => Ok(()),
    }
}
