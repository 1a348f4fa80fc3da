//! Decides whether the task runtime should be running.
//!
//! The controller owns the worker's authentication state. A valid cached
//! control-plane token means the runtime runs; anything else means the
//! runtime is stopped and the operator is shown where to authenticate. Token
//! delivery and logout arrive out of band on the worker's auth subject.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use prost::Message;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::automation::{Automation, CommandAutomation};
use crate::config::{Config, STREAM_NAME};
use crate::credentials::{Credentials, FileRecordStore};
use crate::events::{AgentPhase, EventKind, EventSender, HeartbeatSummary, ResultSummary};
use crate::messaging::amqp::AmqpConnector;
use crate::messaging::auth::{NonceSigner, SeedSigner};
use crate::messaging::{Broker, ConnectIdentity, Connector, PushSubscription};
use crate::models::{AgentHeartbeat, AgentResult};
use crate::runtime::{RuntimeSettings, TaskRuntime, close_broker};

const TICK: Duration = Duration::from_millis(250);
const RESTART_BACKOFF: Duration = Duration::from_secs(5);
const RUNTIME_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
  Token,
  Logout,
}

#[derive(Debug, Default, Deserialize)]
struct ControlMessage {
  #[serde(default)]
  action: Option<String>,
  #[serde(default)]
  token: Option<String>,
  #[serde(default)]
  expires_at: Option<String>,
  #[serde(default)]
  jwt: Option<String>,
  #[serde(default)]
  jwt_expires_at: Option<String>,
}

/// Collaborators shared by the controller and every runtime it starts.
#[derive(Clone)]
pub struct Services {
  pub connector: Arc<dyn Connector>,
  pub automation: Arc<dyn Automation>,
  pub credentials: Arc<Credentials>,
  pub signer: Arc<dyn NonceSigner>,
}

impl Services {
  /// Wires the production collaborators: the on-disk credential store and
  /// signing seed under `state_dir`, the AMQP connector and the configured
  /// automation program.
  pub async fn from_config(config: &Config) -> Result<Self> {
    tokio::fs::create_dir_all(&config.state_dir)
      .await
      .with_context(|| format!("creating state directory {}", config.state_dir.display()))?;
    let credentials = Arc::new(Credentials::new(FileRecordStore::in_dir(&config.state_dir)));
    let signer = SeedSigner::load_or_create(&config.state_dir).await.context("loading signing seed")?;
    let command = config.automation_command.as_deref().unwrap_or_default();
    let automation = CommandAutomation::from_command_line(command)
      .ok_or_else(|| anyhow!("QA_AGENT_AUTOMATION_COMMAND is not set"))?;
    let connector = AmqpConnector::new(&config.broker_url, STREAM_NAME, config.max_payload)
      .with_unauthenticated_fallback(config.allow_unauthenticated_fallback);
    Ok(Self {
      connector: Arc::new(connector),
      automation: Arc::new(automation),
      credentials,
      signer: Arc::new(signer),
    })
  }

  /// The configured worker id, else the one remembered for the project.
  pub async fn resolve_agent_id(&self, config: &Config) -> Result<String> {
    if let Some(id) = config.agent_id.as_deref().filter(|id| !id.is_empty()) {
      return Ok(id.to_string());
    }
    let id = self.credentials.get_or_create_agent_id(config.project_id.as_deref()).await?;
    Ok(id)
  }
}

struct Listener {
  broker: Arc<dyn Broker>,
  handle: JoinHandle<()>,
}

struct RunningRuntime {
  shutdown: CancellationToken,
  handle: JoinHandle<Result<()>>,
}

pub struct Controller {
  config: Config,
  agent_id: String,
  version: String,
  services: Services,
  events: EventSender,
  phase: AgentPhase,
  auth_url: Option<String>,
  runtime: Option<RunningRuntime>,
  last_start: Option<Instant>,
  last_monitor_attempt: Option<Instant>,
  control: Option<Listener>,
  monitor: Option<Listener>,
  signal_tx: mpsc::UnboundedSender<ControlSignal>,
  signal_rx: Option<mpsc::UnboundedReceiver<ControlSignal>>,
}

impl Controller {
  pub fn new(
    config: Config,
    agent_id: impl Into<String>,
    version: impl Into<String>,
    services: Services,
    events: EventSender,
  ) -> Self {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    Self {
      config,
      agent_id: agent_id.into(),
      version: version.into(),
      services,
      events,
      phase: AgentPhase::Disconnected,
      auth_url: None,
      runtime: None,
      last_start: None,
      last_monitor_attempt: None,
      control: None,
      monitor: None,
      signal_tx,
      signal_rx: Some(signal_rx),
    }
  }

  /// Runs until `shutdown` is cancelled. Fails only when the control
  /// listener cannot be established at start-up.
  pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
    let mut signals = self.signal_rx.take().ok_or_else(|| anyhow!("controller already ran"))?;
    self.ensure_control_listener().await.context("starting control listener")?;

    let mut tick = interval(TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        Some(signal) = signals.recv() => self.on_signal(signal).await,
        _ = tick.tick() => self.reconcile().await,
      }
    }
    self.shutdown().await;
    Ok(())
  }

  async fn on_signal(&mut self, signal: ControlSignal) {
    match signal {
      ControlSignal::Token => {
        info!("Agent {}: credentials received", self.agent_id);
        self.reconcile().await;
      }
      ControlSignal::Logout => {
        info!("Agent {}: logout requested", self.agent_id);
        self.stop_runtime().await;
        self.clear_credentials().await;
        if self.phase != AgentPhase::AwaitingToken {
          self.set_phase(AgentPhase::Disconnected);
          self.auth_url = None;
        }
        self.reconcile().await;
      }
    }
  }

  async fn clear_credentials(&self) {
    if let Err(err) = self.services.credentials.clear_core_token(&self.agent_id).await {
      warn!(error = %err, "failed to clear cached token");
    }
    if let Err(err) = self.services.credentials.clear_nats_jwt().await {
      warn!(error = %err, "failed to clear cached queue credentials");
    }
  }

  /// Brings the runtime in line with the current credentials.
  pub async fn reconcile(&mut self) {
    let token_valid = match self.services.credentials.is_core_token_valid(&self.agent_id).await {
      Ok(valid) => valid,
      Err(err) => {
        warn!(error = %err, "could not read cached token");
        false
      }
    };

    if !token_valid {
      if self.phase != AgentPhase::AwaitingToken {
        self.stop_runtime().await;
        self.set_phase(AgentPhase::AwaitingToken);
        self.announce_auth();
      }
      return;
    }

    self.auth_url = None;
    if matches!(self.phase, AgentPhase::Disconnected | AgentPhase::AwaitingToken) {
      self.set_phase(AgentPhase::Authenticated);
    }
    self.reap_runtime().await;
    if self.runtime.is_none() && self.backoff_elapsed(self.last_start) {
      self.start_runtime().await;
    }
    if self.monitor.is_none() && self.backoff_elapsed(self.last_monitor_attempt) {
      if let Err(e) = self.ensure_monitor_listener().await {
        warn!("Monitor listener unavailable: {:?}", e);
      }
    }
  }

  fn backoff_elapsed(&self, last: Option<Instant>) -> bool {
    last.is_none_or(|at| at.elapsed() >= RESTART_BACKOFF)
  }

  fn announce_auth(&mut self) {
    let url = self.config.auth_url(&self.agent_id, &self.services.signer.public_key());
    if self.auth_url.as_deref() == Some(url.as_str()) {
      return;
    }
    info!("Agent {}: authenticate at {}", self.agent_id, url);
    self.events.emit(EventKind::AuthRequired { url: url.clone() });
    self.auth_url = Some(url);
  }

  fn set_phase(&mut self, phase: AgentPhase) {
    if self.phase == phase {
      return;
    }
    debug!(from = self.phase.label(), to = phase.label(), "phase change");
    self.phase = phase;
    self.events.emit(EventKind::Status(phase));
  }

  async fn identity(&self) -> Option<ConnectIdentity> {
    match self.services.credentials.valid_nats_jwt().await {
      Ok(Some(jwt)) => Some(ConnectIdentity {
        user: self.agent_id.clone(),
        jwt,
        signer: self.services.signer.clone(),
      }),
      Ok(None) => None,
      Err(err) => {
        warn!(error = %err, "could not read cached queue credentials");
        None
      }
    }
  }

  async fn start_runtime(&mut self) {
    self.last_start = Some(Instant::now());
    let identity = self.identity().await;
    let broker = match self.services.connector.connect(identity).await {
      Ok(broker) => broker,
      Err(e) => {
        error!("Agent {}: cannot connect task runtime: {}", self.agent_id, e);
        return;
      }
    };
    let settings = RuntimeSettings::from_config(&self.config, &self.agent_id, &self.version);
    let runtime = TaskRuntime::new(
      settings,
      broker,
      self.services.automation.clone(),
      self.services.credentials.clone(),
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(shutdown.clone()));
    self.runtime = Some(RunningRuntime { shutdown, handle });
    self.set_phase(AgentPhase::Running);
  }

  async fn reap_runtime(&mut self) {
    if !self.runtime.as_ref().is_some_and(|r| r.handle.is_finished()) {
      return;
    }
    if let Some(finished) = self.runtime.take() {
      match finished.handle.await {
        Ok(Ok(())) => warn!("Agent {}: task runtime exited", self.agent_id),
        Ok(Err(e)) => error!("Agent {}: task runtime failed: {:?}", self.agent_id, e),
        Err(e) => error!("Agent {}: task runtime panicked: {:?}", self.agent_id, e),
      }
      self.set_phase(AgentPhase::Authenticated);
    }
  }

  async fn stop_runtime(&mut self) {
    let Some(running) = self.runtime.take() else {
      return;
    };
    running.shutdown.cancel();
    let mut handle = running.handle;
    match timeout(RUNTIME_GRACE, &mut handle).await {
      Ok(Ok(Ok(()))) => info!("Agent {}: task runtime stopped", self.agent_id),
      Ok(Ok(Err(e))) => warn!("Agent {}: task runtime ended with error: {:?}", self.agent_id, e),
      Ok(Err(e)) => warn!("Agent {}: task runtime join failed: {:?}", self.agent_id, e),
      Err(_) => {
        warn!("Agent {}: task runtime did not stop within {:?}, aborting", self.agent_id, RUNTIME_GRACE);
        handle.abort();
      }
    }
  }

  /// Subscribes to the auth subject once; later calls are no-ops.
  pub async fn ensure_control_listener(&mut self) -> Result<()> {
    if self.control.is_some() {
      return Ok(());
    }
    let identity = self.identity().await;
    let broker = self.services.connector.connect(identity).await?;
    let subject = self.config.auth_subject(&self.agent_id);
    let mut subscription = broker.subscribe(&subject).await.with_context(|| format!("subscribing to {subject}"))?;

    let credentials = self.services.credentials.clone();
    let agent_id = self.agent_id.clone();
    let signals = self.signal_tx.clone();
    let handle = tokio::spawn(async move {
      while let Some(payload) = subscription.next().await {
        if let Some(signal) = handle_control_payload(&payload, &credentials, &agent_id).await {
          if signals.send(signal).is_err() {
            break;
          }
        }
      }
      debug!("control listener finished");
    });
    info!(%subject, "control listener ready");
    self.control = Some(Listener { broker, handle });
    Ok(())
  }

  /// Mirrors the worker's own results and heartbeats into the event queue.
  pub async fn ensure_monitor_listener(&mut self) -> Result<()> {
    if self.monitor.is_some() {
      return Ok(());
    }
    self.last_monitor_attempt = Some(Instant::now());
    let broker = self.services.connector.connect(self.identity().await).await?;
    let results = broker.subscribe(&self.config.result_subject(&self.agent_id)).await?;
    let heartbeats = broker.subscribe(&self.config.heartbeat_subject(&self.agent_id)).await?;
    let handle = tokio::spawn(relay_monitor(results, heartbeats, self.events.clone()));
    self.monitor = Some(Listener { broker, handle });
    Ok(())
  }

  async fn shutdown(&mut self) {
    self.stop_runtime().await;
    for listener in [self.monitor.take(), self.control.take()].into_iter().flatten() {
      listener.handle.abort();
      close_broker(listener.broker.as_ref()).await;
    }
    self.set_phase(AgentPhase::Stopped);
    info!("Agent {}: controller stopped", self.agent_id);
  }
}

async fn handle_control_payload(payload: &[u8], credentials: &Credentials, agent_id: &str) -> Option<ControlSignal> {
  let message: ControlMessage = match serde_json::from_slice(payload) {
    Ok(message) => message,
    Err(err) => {
      warn!(error = %err, "ignoring malformed control message");
      return None;
    }
  };
  if message.action.as_deref() == Some("logout") {
    return Some(ControlSignal::Logout);
  }

  let mut delivered = false;
  if let Some(token) = message.token.filter(|t| !t.is_empty()) {
    match credentials.save_core_token(agent_id, &token, message.expires_at.as_deref()).await {
      Ok(()) => delivered = true,
      Err(err) => error!(error = %err, "failed to store delivered token"),
    }
  }
  if let Some(jwt) = message.jwt.filter(|j| !j.is_empty()) {
    match credentials.save_nats_jwt(&jwt, message.jwt_expires_at.as_deref()).await {
      Ok(()) => delivered = true,
      Err(err) => error!(error = %err, "failed to store delivered queue credentials"),
    }
  }
  if !delivered {
    debug!("control message carried no credentials");
    return None;
  }
  Some(ControlSignal::Token)
}

async fn relay_monitor(mut results: PushSubscription, mut heartbeats: PushSubscription, events: EventSender) {
  loop {
    tokio::select! {
      Some(payload) = results.next() => match AgentResult::decode(payload.as_slice()) {
        Ok(result) => events.emit(EventKind::Result(ResultSummary::from(&result))),
        Err(e) => warn!("Failed to decode monitored result: {:?}", e),
      },
      Some(payload) = heartbeats.next() => match AgentHeartbeat::decode(payload.as_slice()) {
        Ok(beat) => events.emit(EventKind::Heartbeat(HeartbeatSummary::from(&beat))),
        Err(e) => warn!("Failed to decode monitored heartbeat: {:?}", e),
      },
      else => break,
    }
  }
  debug!("monitor listener finished");
}
