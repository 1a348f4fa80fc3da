//! Events relayed from the worker to whatever is displaying it.
//!
//! Producers never block: the queue is unbounded and FIFO. A consumer drains
//! it on each refresh and folds the events into an [`AgentView`].

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::models::{AgentHeartbeat, AgentResult};

const LOG_CAPACITY: usize = 500;
const RUN_CAPACITY: usize = 200;
const OBSERVATION_PREVIEW: usize = 80;
const OFFLINE_AFTER_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
  Disconnected,
  AwaitingToken,
  Authenticated,
  Running,
  Stopped,
}

impl AgentPhase {
  pub fn label(&self) -> &'static str {
    match self {
      AgentPhase::Disconnected => "disconnected",
      AgentPhase::AwaitingToken => "awaiting token",
      AgentPhase::Authenticated => "authenticated",
      AgentPhase::Running => "running",
      AgentPhase::Stopped => "stopped",
    }
  }

  fn is_authenticated(&self) -> bool {
    matches!(self, AgentPhase::Authenticated | AgentPhase::Running)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSummary {
  pub agent_id: String,
  pub version: String,
  pub status: String,
  pub sent_at: i64,
}

impl From<&AgentHeartbeat> for HeartbeatSummary {
  fn from(beat: &AgentHeartbeat) -> Self {
    let metadata = beat.metadata.clone().unwrap_or_default();
    Self { agent_id: metadata.agent_id, version: metadata.agent_version, status: beat.status.clone(), sent_at: beat.timestamp }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSummary {
  pub index: u32,
  pub status: String,
  pub action: String,
  pub observation: String,
  pub error: String,
  pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSummary {
  pub run_id: String,
  pub status: String,
  pub message: String,
  pub error: String,
  pub step: Option<StepSummary>,
}

impl From<&AgentResult> for ResultSummary {
  fn from(result: &AgentResult) -> Self {
    Self {
      run_id: result.metadata.as_ref().map(|m| m.run_id.clone()).unwrap_or_default(),
      status: result.status.clone(),
      message: result.message.clone(),
      error: result.error.clone(),
      step: result.step.as_ref().map(|step| StepSummary {
        index: step.step_index,
        status: step.status.clone(),
        action: step.action_name.clone(),
        observation: step.observation.clone(),
        error: step.error.clone(),
        url: step.url.clone(),
      }),
    }
  }
}

impl ResultSummary {
  pub fn line(&self) -> String {
    let Some(step) = &self.step else {
      return format!("result {} {} {}", self.run_id, self.status, self.message);
    };
    let mut line = format!("run {} step {} {} {}", self.run_id, step.index, step.status, step.action);
    let mut details = Vec::new();
    if !step.observation.is_empty() {
      details.push(format!("obs={}", preview(&step.observation)));
    }
    if !step.error.is_empty() {
      details.push(format!("err={}", step.error));
    }
    if !step.url.is_empty() {
      details.push(format!("url={}", step.url));
    }
    if !details.is_empty() {
      line.push(' ');
      line.push_str(&details.join(" | "));
    }
    line
  }
}

fn preview(text: &str) -> String {
  let flat = text.replace('\n', " ");
  match flat.char_indices().nth(OBSERVATION_PREVIEW) {
    Some((cut, _)) => format!("{}…", &flat[..cut]),
    None => flat,
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
  Log(String),
  Heartbeat(HeartbeatSummary),
  Result(ResultSummary),
  Status(AgentPhase),
  AuthRequired { url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
  pub timestamp: DateTime<Utc>,
  pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub struct EventSender {
  sender: mpsc::UnboundedSender<AgentEvent>,
}

impl EventSender {
  pub fn emit(&self, kind: EventKind) {
    let _ = self.sender.send(AgentEvent { timestamp: Utc::now(), kind });
  }

  pub fn log(&self, line: impl Into<String>) {
    self.emit(EventKind::Log(line.into()));
  }
}

pub struct EventReceiver {
  receiver: mpsc::UnboundedReceiver<AgentEvent>,
}

impl EventReceiver {
  /// Everything queued so far, oldest first.
  pub fn drain(&mut self) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.receiver.try_recv() {
      events.push(event);
    }
    events
  }

  pub async fn recv(&mut self) -> Option<AgentEvent> {
    self.receiver.recv().await
  }
}

pub fn event_queue() -> (EventSender, EventReceiver) {
  let (sender, receiver) = mpsc::unbounded_channel();
  (EventSender { sender }, EventReceiver { receiver })
}

/// Dashboard state folded from events.
#[derive(Debug, Clone)]
pub struct AgentView {
  pub agent_id: String,
  pub phase: AgentPhase,
  pub auth_url: Option<String>,
  pub last_heartbeat: Option<DateTime<Utc>>,
  pub version: Option<String>,
  pub heartbeat_status: Option<String>,
  pub logs: VecDeque<String>,
  pub runs: VecDeque<String>,
}

impl AgentView {
  pub fn new(agent_id: impl Into<String>) -> Self {
    Self {
      agent_id: agent_id.into(),
      phase: AgentPhase::Disconnected,
      auth_url: None,
      last_heartbeat: None,
      version: None,
      heartbeat_status: None,
      logs: VecDeque::new(),
      runs: VecDeque::new(),
    }
  }

  pub fn apply(&mut self, event: AgentEvent) {
    match event.kind {
      EventKind::Log(line) => {
        push_capped(&mut self.logs, format!("{} {}", event.timestamp.format("%H:%M:%S"), line), LOG_CAPACITY)
      }
      EventKind::Heartbeat(beat) => {
        if !self.phase.is_authenticated() {
          return;
        }
        self.last_heartbeat = Some(Utc.timestamp_opt(beat.sent_at, 0).single().unwrap_or(event.timestamp));
        self.version = Some(beat.version);
        self.heartbeat_status = Some(beat.status);
      }
      EventKind::Result(summary) => push_capped(&mut self.runs, summary.line(), RUN_CAPACITY),
      EventKind::Status(phase) => {
        self.phase = phase;
        self.last_heartbeat = None;
        if phase.is_authenticated() {
          self.auth_url = None;
        }
      }
      EventKind::AuthRequired { url } => {
        self.auth_url = Some(url);
        self.phase = AgentPhase::Disconnected;
      }
    }
  }

  pub fn apply_all(&mut self, events: impl IntoIterator<Item = AgentEvent>) {
    for event in events {
      self.apply(event);
    }
  }

  pub fn status_label(&self, now: DateTime<Utc>) -> String {
    if !self.phase.is_authenticated() {
      return self.phase.label().into();
    }
    match self.last_heartbeat {
      Some(seen) if (now - seen).num_seconds() > OFFLINE_AFTER_SECS => "offline".into(),
      Some(_) => self.heartbeat_status.clone().unwrap_or_else(|| "online".into()),
      None => self.phase.label().into(),
    }
  }
}

fn push_capped(lines: &mut VecDeque<String>, line: String, cap: usize) {
  if lines.len() == cap {
    lines.pop_front();
  }
  lines.push_back(line);
}

/// Relays INFO and above from this crate into the event queue, so the
/// dashboard can show logs without writing over its own screen.
pub struct EventLayer {
  sender: EventSender,
  target_prefix: &'static str,
}

impl EventLayer {
  pub fn new(sender: EventSender) -> Self {
    Self { sender, target_prefix: "qa_agent" }
  }
}

impl<S: Subscriber> Layer<S> for EventLayer {
  fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
    let metadata = event.metadata();
    if *metadata.level() > Level::INFO || !metadata.target().starts_with(self.target_prefix) {
      return;
    }
    let mut visitor = LineVisitor::default();
    event.record(&mut visitor);
    self.sender.log(format!("{} [{}] {}", metadata.level(), metadata.target(), visitor.finish()));
  }
}

#[derive(Default)]
struct LineVisitor {
  message: String,
  fields: Vec<String>,
}

impl LineVisitor {
  fn finish(self) -> String {
    if self.fields.is_empty() {
      return self.message;
    }
    format!("{} {}", self.message, self.fields.join(" "))
  }
}

impl Visit for LineVisitor {
  fn record_str(&mut self, field: &Field, value: &str) {
    if field.name() == "message" {
      self.message = value.to_string();
    } else {
      self.fields.push(format!("{}={}", field.name(), value));
    }
  }

  fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
    if field.name() == "message" {
      self.message = format!("{value:?}");
    } else {
      self.fields.push(format!("{}={:?}", field.name(), value));
    }
  }
}
