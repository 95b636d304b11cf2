use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cq_core::{CancellationToken, CapabilityRegistry, Conversation, Question};
use cq_providers::ChatCompletionsTransport;
use cq_tools::{register_capabilities, GenerationBackend, HttpGenerationBackend, ToolOptions};

mod chat;
mod config;
mod output;

use config::Config;
use output::{cancel_on_interrupt, render, EventPrinter};

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: includes every streamed chunk
    Trace,
    /// Requests, retries and tool execution details
    Debug,
    /// High-level flow: rounds, completions
    Info,
    /// Only warnings and errors
    Warn,
    /// Only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "cq")]
#[command(author, version, about = "colloquy: tool-calling conversations with an LLM backend", long_about = None)]
pub struct Cli {
    /// Question to ask (single-question mode). Without it, chat mode starts.
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Model to use (overrides config)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Base URL for the API (overrides config)
    #[arg(long)]
    pub base_url: Option<String>,

    /// System instruction (overrides config)
    #[arg(short, long)]
    pub system: Option<String>,

    /// Temperature (0.0-2.0)
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Maximum tool-calling rounds per question
    #[arg(long)]
    pub max_tool_rounds: Option<usize>,

    /// Disable streaming responses
    #[arg(long)]
    pub no_stream: bool,

    /// Disable all tools
    #[arg(long)]
    pub no_tools: bool,

    /// Show state changes on stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Config file (defaults to ~/.config/cq/config.toml)
    #[arg(short, long, env = "CQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Write logs to file (JSON-lines format)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    let mut config = match &cli.config {
        Some(path) => Config::load_file(path)?,
        None => Config::load()?,
    };
    apply_overrides(&cli, &mut config);

    match &cli.command {
        Some(Commands::Config) => show_config(&config),
        None => {
            let conversation = build_conversation(&cli, &config)?;
            match &cli.prompt {
                Some(prompt) => completion_mode(&cli, conversation, prompt).await,
                None => chat::run_chat(conversation, cli.verbose).await,
            }
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter()));

    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

/// Command-line flags win over the config file and environment.
fn apply_overrides(cli: &Cli, config: &mut Config) {
    if let Some(model) = &cli.model {
        config.backend.default_model = Some(model.clone());
    }
    if let Some(base_url) = &cli.base_url {
        config.backend.base_url = base_url.clone();
    }
    if let Some(system) = &cli.system {
        config.conversation.system = Some(system.clone());
    }
    if let Some(temperature) = cli.temperature {
        config.conversation.temperature = Some(temperature);
    }
    if let Some(max_tokens) = cli.max_tokens {
        config.conversation.max_tokens = Some(max_tokens);
    }
    if let Some(rounds) = cli.max_tool_rounds {
        config.conversation.max_tool_rounds = rounds;
    }
    if cli.no_stream {
        config.conversation.streaming = false;
    }
    if cli.no_tools {
        config.tools.enable_calculate = false;
        config.tools.enable_web = false;
        config.tools.enable_video = false;
    }
}

fn build_conversation(cli: &Cli, config: &Config) -> Result<Conversation> {
    let api_key = std::env::var(&config.backend.api_key_env).unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!(var = %config.backend.api_key_env, "API key not set; requests will be unauthenticated");
    }

    let transport = ChatCompletionsTransport::new(api_key.as_str())
        .with_base_url(config.backend.base_url.as_str())
        .with_context(config.transport_context().shared());

    let options = ToolOptions {
        calculate: config.tools.enable_calculate,
        web: config.tools.enable_web,
        video_backend: config.tools.enable_video.then(|| {
            Arc::new(HttpGenerationBackend::new(config.backend.base_url.as_str(), api_key.as_str()))
                as Arc<dyn GenerationBackend>
        }),
        video_policy: config.poll_policy(),
    };
    let mut registry = CapabilityRegistry::new();
    register_capabilities(&mut registry, &options)?;

    tracing::debug!(
        base_url = %config.backend.base_url,
        tools = ?registry.names(),
        no_tools = cli.no_tools,
        "Conversation configured"
    );

    let mut conversation = Conversation::new(Arc::new(transport))
        .with_config(config.conversation_config())
        .with_capabilities(registry);
    if let Some(system) = &config.conversation.system {
        conversation.add_system_instruction(system.as_str())?;
    }
    Ok(conversation)
}

async fn completion_mode(cli: &Cli, mut conversation: Conversation, prompt: &str) -> Result<()> {
    let token = CancellationToken::new();
    let interrupt = cancel_on_interrupt(token.clone());

    let question = Question::new(prompt).with_cancellation(token);
    let answer = render(conversation.ask(question), EventPrinter::terminal(cli.verbose)).await;
    interrupt.abort();
    let answer = answer?;

    let usage = conversation.usage();
    tracing::info!(
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        history = conversation.history().len(),
        "Completion finished"
    );

    match answer.failure {
        Some((kind, message)) => anyhow::bail!("{} ({:?})", message, kind),
        None => Ok(()),
    }
}

fn show_config(config: &Config) -> Result<()> {
    let path = Config::config_path()?;
    println!("# Config file: {}", path.display());
    println!("# Environment overrides use the {} prefix with __ between keys\n", config::ENV_PREFIX);
    print!("{}", toml::to_string_pretty(config).context("Failed to render configuration")?);
    Ok(())
}
