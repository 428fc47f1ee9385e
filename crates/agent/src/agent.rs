//! The run entrypoint: resolves a provider, opens a session and drives the loop.

use ironloop_config::AppConfig;
use ironloop_core::error::{Error, Result};
use ironloop_core::event::{Event, EventKind};
use ironloop_core::message::MessageContent;
use ironloop_core::tool::ToolRegistry;
use ironloop_providers::ProviderRouter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hooks::{AgentHooks, NoopHooks};
use crate::loop_runner::{LoopExecutor, LoopOutcome, append_abort};
use crate::session::{SessionHandle, SessionManager, SessionStatus};
use crate::stream_adapter::EventSequence;
use crate::tool_call_engine::{NativeEngine, ToolCallEngine, engine_for};

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: MessageContent,
    /// Continue (or name) this session instead of generating an id.
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Only valid for [`Agent::run_stream`].
    pub stream: bool,
}

impl RunOptions {
    pub fn new(input: impl Into<MessageContent>) -> Self {
        Self {
            input: input.into(),
            session_id: None,
            model: None,
            provider: None,
            stream: false,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Defaults applied to every run.
#[derive(Debug, Clone)]
pub struct AgentDefaults {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: String,
    pub max_iterations: u32,
    pub max_images: Option<usize>,
    /// Model to use per provider when the run names none.
    pub provider_models: HashMap<String, String>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: None,
            max_tokens: None,
            system_prompt: "You are a helpful assistant.".into(),
            max_iterations: 25,
            max_images: None,
            provider_models: HashMap::new(),
        }
    }
}

/// A multimodal agent serving many concurrent sessions.
///
/// The provider router and the tool registry are shared read-only by every
/// run. Each run owns its session's event log and cancellation token.
pub struct Agent {
    router: Arc<ProviderRouter>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<dyn AgentHooks>,
    engine: Arc<dyn ToolCallEngine>,
    sessions: Arc<SessionManager>,
    defaults: AgentDefaults,
}

impl Agent {
    pub fn new(router: ProviderRouter, tools: ToolRegistry, model: impl Into<String>) -> Self {
        Self {
            router: Arc::new(router),
            tools: Arc::new(tools),
            hooks: Arc::new(NoopHooks),
            engine: Arc::new(NativeEngine),
            sessions: Arc::new(SessionManager::default()),
            defaults: AgentDefaults {
                model: model.into(),
                ..AgentDefaults::default()
            },
        }
    }

    /// Build an agent from validated configuration.
    pub fn from_config(config: &AppConfig, tools: ToolRegistry) -> Result<Self> {
        config.validate().map_err(|e| Error::config(e.to_string()))?;
        let runtime = config.runtime_config().map_err(|e| Error::config(e.to_string()))?;

        let provider_models = config
            .providers
            .iter()
            .filter_map(|(name, p)| p.default_model.clone().map(|m| (name.clone(), m)))
            .collect();

        let sessions = SessionManager::new(runtime, Duration::from_secs(config.session.ttl_secs));
        let router = ironloop_providers::build_from_config(config).map_err(|e| Error::config(e.to_string()))?;

        Ok(Self {
            router: Arc::new(router),
            tools: Arc::new(tools),
            hooks: Arc::new(NoopHooks),
            engine: engine_for(config.agent.tool_call_engine),
            sessions: Arc::new(sessions),
            defaults: AgentDefaults {
                model: config.default_model.clone(),
                temperature: Some(config.default_temperature),
                max_tokens: Some(config.default_max_tokens),
                system_prompt: config.agent.system_prompt.clone(),
                max_iterations: config.agent.max_iterations,
                max_images: config.agent.max_images,
                provider_models,
            },
        })
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn ToolCallEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.defaults.system_prompt = prompt.into();
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.defaults.max_iterations = max;
        self
    }

    pub fn with_max_images(mut self, max: Option<usize>) -> Self {
        self.defaults.max_images = max;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.defaults.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.defaults.max_tokens = Some(max);
        self
    }

    pub fn defaults(&self) -> &AgentDefaults {
        &self.defaults
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Run to completion and return the final answer text.
    pub async fn run(&self, input: impl Into<MessageContent>) -> Result<String> {
        let event = self.run_with(RunOptions::new(input)).await?;
        Ok(event
            .as_assistant()
            .map(|message| message.content.clone())
            .unwrap_or_default())
    }

    /// Run to completion and return the terminal `AssistantMessage` event.
    ///
    /// An aborted run is `Err(Error::Aborted)`; reaching the iteration
    /// ceiling is an ordinary result with finish reason `max_iterations`.
    pub async fn run_with(&self, options: RunOptions) -> Result<Event> {
        if options.stream {
            return Err(Error::config("streaming runs must use run_stream"));
        }

        let (executor, session) = self.prepare(&options)?;
        session.events.append(EventKind::user(options.input));
        drive(executor, self.sessions.clone(), session, false).await
    }

    /// Start a run in the background and return its events as a stream.
    ///
    /// The stream ends after the terminal `AssistantMessage`. Dropping it
    /// early cancels the run.
    pub fn run_stream(&self, options: RunOptions) -> Result<EventSequence> {
        let (executor, session) = self.prepare(&options)?;

        let sequence = EventSequence::attach(
            session.id.clone(),
            session.events.clone(),
            session.cancel.clone(),
        );
        session.events.append(EventKind::user(options.input));

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let session_id = session.id.clone();
            if let Err(err) = drive(executor, sessions, session, true).await {
                debug!(session_id = %session_id, error = %err, "Streaming run ended with error");
            }
        });

        Ok(sequence)
    }

    /// Signal cancellation to a running session.
    pub fn abort(&self, session_id: &str) -> bool {
        self.sessions.abort(session_id)
    }

    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.status(session_id)
    }

    /// Snapshot of a session's event log.
    pub fn events(&self, session_id: &str) -> Option<Vec<Event>> {
        self.sessions.events(session_id).map(|events| events.snapshot())
    }

    pub fn spawn_session_cleanup(&self, interval: Duration) -> JoinHandle<()> {
        self.sessions.spawn_cleanup(interval)
    }

    /// Resolve provider and model, then open the session in `Running`.
    fn prepare(&self, options: &RunOptions) -> Result<(LoopExecutor, SessionHandle)> {
        let (provider, transport) = self
            .router
            .resolve(options.provider.as_deref())
            .ok_or_else(|| {
                Error::config(format!(
                    "Unknown provider: {}",
                    options.provider.as_deref().unwrap_or(self.router.default_name())
                ))
            })?;

        let model = options
            .model
            .clone()
            .or_else(|| self.defaults.provider_models.get(&provider).cloned())
            .unwrap_or_else(|| self.defaults.model.clone());
        if model.is_empty() {
            return Err(Error::config("No model configured"));
        }

        let mut executor = LoopExecutor::new(transport, self.engine.clone(), self.tools.clone(), &model)
            .with_hooks(self.hooks.clone())
            .with_system_prompt(self.defaults.system_prompt.clone())
            .with_max_iterations(self.defaults.max_iterations)
            .with_max_images(self.defaults.max_images);
        if let Some(temperature) = self.defaults.temperature {
            executor = executor.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.defaults.max_tokens {
            executor = executor.with_max_tokens(max_tokens);
        }

        let session = self.sessions.start(options.session_id.as_deref())?;
        self.sessions.transition(&session.id, SessionStatus::Running)?;

        info!(session_id = %session.id, provider = %provider, model = %model, "Run started");
        Ok((executor, session))
    }
}

/// Execute the loop and settle the session status from its outcome.
async fn drive(
    executor: LoopExecutor,
    sessions: Arc<SessionManager>,
    session: SessionHandle,
    streaming: bool,
) -> Result<Event> {
    let mut guard = RunGuard {
        sessions: sessions.clone(),
        session: session.clone(),
        settled: false,
    };
    let outcome = executor.execute(&session, streaming).await;
    guard.settled = true;

    let (status, result) = match outcome {
        Ok(LoopOutcome::Aborted(_)) => (
            SessionStatus::Aborted,
            Err(Error::Aborted {
                session_id: session.id.clone(),
            }),
        ),
        Ok(outcome) => (SessionStatus::Completed, Ok(outcome.into_event())),
        Err(err) => (SessionStatus::Failed, Err(err)),
    };

    if let Err(err) = sessions.transition(&session.id, status) {
        warn!(session_id = %session.id, error = %err, "Could not settle session status");
    }
    result
}

/// Settles a run whose future was dropped before the loop returned.
struct RunGuard {
    sessions: Arc<SessionManager>,
    session: SessionHandle,
    settled: bool,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(session_id = %self.session.id, "Run dropped before finishing, aborting session");
        self.session.cancel.cancel();
        self.sessions.abort(&self.session.id);
        append_abort(&self.session.events);
    }
}
