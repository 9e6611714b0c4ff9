//! `gateway-chat` — stream one prompt through the gateway from the terminal.
//!
//! Text deltas are printed to stdout as they arrive; the terminal status,
//! round count and token usage go to stderr.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use gateway_chat::agent_core::{
    ChannelObserver, StreamEvent, StreamRegistry, ToolOrchestrator, ToolRegistry, TurnOutcome,
};
use gateway_chat::inference::config::{find_config_path, load_gateway_config};
use gateway_chat::inference::{ChatMessage, ConversationRequest, Delta, GatewayClient};
use gateway_chat::logging;

#[derive(Debug, Parser)]
#[command(name = "gateway-chat", version, about)]
struct Cli {
    /// Path to gateway-chat.yaml (otherwise searched upward from the cwd).
    #[arg(short, long, env = "GATEWAY_CHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Model id; defaults to `default_model` from the config.
    #[arg(short, long)]
    model: Option<String>,

    /// Turn id to register the stream under.
    #[arg(long)]
    turn: Option<String>,

    /// Optional system prompt.
    #[arg(long)]
    system: Option<String>,

    /// Fallback providers, comma separated; overrides `fallback_providers`.
    #[arg(long, value_delimiter = ',')]
    providers: Vec<String>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// The user message.
    prompt: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_path(&std::env::current_dir()?)?,
    };
    let config = load_gateway_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    logging::init_tracing(config.log_dir_path().as_deref(), config.log_json)
        .context("initialising logging")?;

    let client = GatewayClient::from_config(&config)?;
    let orchestrator = ToolOrchestrator::new(
        Arc::new(client),
        Arc::new(ToolRegistry::new()),
        config.tools.clone(),
    );
    let registry = StreamRegistry::new(Arc::new(orchestrator), &config.registry);

    let mut messages = Vec::new();
    if let Some(system) = cli.system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(cli.prompt));

    let providers = if cli.providers.is_empty() {
        config.fallback_providers.clone()
    } else {
        cli.providers
    };
    let mut request = ConversationRequest::new(
        cli.model.unwrap_or_else(|| config.default_model.clone()),
        messages,
    )
    .with_temperature(config.temperature)
    .with_fallback_providers(providers);
    request.allow_fallbacks = config.allow_fallbacks;
    if let Some(max_tokens) = cli.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }

    let turn_id = cli
        .turn
        .unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));
    let (observer, mut events) = ChannelObserver::new();
    let handle = registry.start(turn_id.clone(), request, Arc::new(observer))?;

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                registry.cancel(&turn_id);
            }
            event = events.recv() => match event {
                Some(StreamEvent::Delta { delta: Delta::Text(text), .. }) => {
                    write!(stdout, "{text}")?;
                    stdout.flush()?;
                }
                Some(StreamEvent::Delta { .. }) => {}
                Some(StreamEvent::Terminal { outcome, .. }) => {
                    writeln!(stdout)?;
                    report(&outcome);
                    break;
                }
                None => break,
            },
        }
    }

    handle.wait().await;
    Ok(())
}

fn report(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Completed(turn) => eprintln!(
            "[completed] rounds={} tokens={} (prompt {}, completion {}){}",
            turn.rounds,
            turn.usage.total(),
            turn.usage.prompt_tokens,
            turn.usage.completion_tokens,
            if turn.truncated { " truncated" } else { "" }
        ),
        TurnOutcome::Cancelled { .. } => eprintln!("[cancelled]"),
        TurnOutcome::Failed { error, .. } => eprintln!("[failed] {error}"),
    }
}
