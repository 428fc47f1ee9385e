//! `ironloop run` and `ironloop chat`.

use futures::StreamExt;
use ironloop_agent::{Agent, RunOptions};
use ironloop_config::AppConfig;
use ironloop_core::event::{EventKind, FinishReason, SystemLevel};
use ironloop_core::tool::ToolRegistry;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

pub struct RunArgs {
    pub message: String,
    pub stream: bool,
    pub session: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

fn build_agent(provider: Option<&str>) -> Result<(AppConfig, Agent), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let provider = provider.unwrap_or(&config.default_provider);
    if provider != "ollama" && config.api_key_for(provider).is_none() {
        eprintln!();
        eprintln!("  No API key configured for '{provider}'.");
        eprintln!("  Set IRONLOOP_API_KEY, OPENROUTER_API_KEY or OPENAI_API_KEY,");
        eprintln!(
            "  or add api_key to {}",
            AppConfig::config_dir().join("config.toml").display()
        );
        eprintln!();
        return Err("No API key found".into());
    }

    let agent = Agent::from_config(&config, ToolRegistry::new())?;
    Ok((config, agent))
}

fn session_id(requested: Option<String>) -> String {
    requested.unwrap_or_else(|| format!("cli-{}", chrono::Utc::now().timestamp_millis()))
}

/// Abort the session on Ctrl+C.
fn abort_on_interrupt(agent: &Arc<Agent>, session_id: &str) -> tokio::task::JoinHandle<()> {
    let agent = agent.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Aborting...");
            agent.abort(&session_id);
        }
    })
}

pub async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (_, agent) = build_agent(args.provider.as_deref())?;
    let agent = Arc::new(agent);

    let session_id = session_id(args.session);
    let mut options = RunOptions::new(args.message).with_session(&session_id);
    if let Some(model) = args.model {
        options = options.with_model(model);
    }
    if let Some(provider) = args.provider {
        options = options.with_provider(provider);
    }

    tracing::debug!(session_id = %session_id, stream = args.stream, "Starting run");
    let interrupt = abort_on_interrupt(&agent, &session_id);
    let result = if args.stream {
        stream_run(&agent, options.with_stream(true)).await
    } else {
        agent
            .run_with(options)
            .await
            .map(|event| {
                if let Some(message) = event.as_assistant() {
                    println!("{}", message.content);
                }
            })
            .map_err(Into::into)
    };
    interrupt.abort();
    result
}

/// Print deltas and tool activity as they arrive.
async fn stream_run(agent: &Agent, options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = agent.run_stream(options)?;
    let mut streamed = false;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event.kind {
            EventKind::AssistantStreamingMessage { content, .. } => {
                streamed |= !content.is_empty();
                print!("{content}");
                stdout.flush()?;
            }
            EventKind::ToolCall(call) => {
                eprintln!("\n  [tool] {}({})", call.name, call.arguments);
            }
            EventKind::ToolResult(result) => {
                if let Some(error) = result.error {
                    eprintln!("  [tool] {} failed: {error}", result.name);
                }
            }
            EventKind::System { level, message, .. } if level != SystemLevel::Info => {
                eprintln!("  [{level:?}] {message}");
            }
            EventKind::AssistantMessage(message) if !message.has_tool_calls() => {
                match message.finish_reason {
                    FinishReason::Error => return Err(message.content.into()),
                    FinishReason::Abort => return Err("Run aborted".into()),
                    _ if streamed => println!(),
                    _ => println!("{}", message.content),
                }
            }
            EventKind::AssistantMessage(_) => streamed = false,
            _ => {}
        }
    }
    Ok(())
}

pub async fn chat(model: Option<String>, provider: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let (config, agent) = build_agent(provider.as_deref())?;
    let agent = Arc::new(agent);
    let session_id = session_id(None);

    println!();
    println!("  ironloop interactive chat");
    println!();
    println!("  Provider:  {}", provider.as_deref().unwrap_or(&config.default_provider));
    println!("  Model:     {}", model.as_deref().unwrap_or(&config.default_model));
    println!("  Session:   {session_id}");
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    loop {
        print!("  You > ");
        stdout.flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let mut options = RunOptions::new(line).with_session(&session_id);
        if let Some(model) = &model {
            options = options.with_model(model);
        }
        if let Some(provider) = &provider {
            options = options.with_provider(provider);
        }

        let interrupt = abort_on_interrupt(&agent, &session_id);
        match agent.run_with(options).await {
            Ok(event) => {
                let content = event
                    .as_assistant()
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                println!();
                for line in content.lines() {
                    println!("  Assistant > {line}");
                }
                println!();
            }
            Err(e) => {
                eprintln!("  [Error] {e}");
                println!();
            }
        }
        interrupt.abort();
    }

    println!();
    Ok(())
}
