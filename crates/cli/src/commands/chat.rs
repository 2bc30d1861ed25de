//! `loopwire chat`: Run a single message through the agent loop.

use std::io::Write;
use std::sync::Arc;

use loopwire_agent::{AgentLoop, DownstreamEvent, LoopRequest, LoopStatus};
use loopwire_config::AppConfig;
use loopwire_core::message::ConversationId;
use loopwire_gateway::emitter::Frame;
use tokio::sync::mpsc;

pub async fn run(message: String, plain: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    LOOPWIRE_API_KEY=sk-ant-...");
        eprintln!("    ANTHROPIC_API_KEY=sk-ant-...");
        eprintln!();
        eprintln!("  Or add `api_key` to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let provider = loopwire_providers::build_from_config(&config)?;
    let tools = Arc::new(loopwire_tools::default_registry());
    let agent = AgentLoop::from_config(provider, tools, &config);
    let deadline = config.gateway.request_timeout();

    let (tx, rx) = mpsc::channel(64);
    let request = LoopRequest {
        conversation_id: ConversationId::new(),
        history: Vec::new(),
        message,
    };

    let agent = &agent;
    let run = async move {
        let outcome = agent.run_with_deadline(request, &tx, deadline).await;
        drop(tx);
        outcome
    };
    let print = async move {
        let mut stdout = std::io::stdout();
        print_events(rx, plain, &mut stdout).await
    };
    let (outcome, printed) = tokio::join!(run, print);
    printed?;

    match outcome.status {
        LoopStatus::Completed => Ok(()),
        LoopStatus::Failed(message) => Err(message.into()),
        LoopStatus::TimedOut => Err("request timed out".into()),
        LoopStatus::Disconnected => Err("output closed before the run finished".into()),
    }
}

/// Write each event to `out` as it arrives.
async fn print_events<W: Write>(
    mut rx: mpsc::Receiver<DownstreamEvent>,
    plain: bool,
    out: &mut W,
) -> std::io::Result<()> {
    while let Some(event) = rx.recv().await {
        let text = if plain {
            render_plain(&event)
        } else {
            Frame::Event(event).render()
        };
        out.write_all(text.as_bytes())?;
        out.flush()?;
    }
    Ok(())
}

/// Human-readable rendering: answer text inline, tool activity on its own lines.
fn render_plain(event: &DownstreamEvent) -> String {
    match event {
        DownstreamEvent::TextDelta { content } => content.clone(),
        DownstreamEvent::ToolStart { tool_name, .. } => format!("\n[{tool_name}] running...\n"),
        DownstreamEvent::ToolResult {
            tool_name, summary, ..
        } => format!("[{tool_name}] {summary}\n"),
        DownstreamEvent::ToolError {
            tool_name, error, ..
        } => format!("[{tool_name}] failed: {error}\n"),
        DownstreamEvent::Done { .. } => "\n".to_string(),
        DownstreamEvent::Error { message } => format!("\nerror: {message}\n"),
    }
}
