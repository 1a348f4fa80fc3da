use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use tracing::{debug, info, warn};

use crate::automation::{Automation, StepEntry, StepObserver};
use crate::credentials::Credentials;
use crate::history::{HistorySnapshot, RunHistory};
use crate::messaging::{Broker, TransportError};
use crate::models::{AgentMetadata, AgentResult, AgentTask};
use crate::report::{RunReport, RunStatus, Screenshot, StepReport, StepStatus};
use crate::shrink::{CAPTURE_IMAGE_BUDGET, PayloadShrinker, RESULT_BUDGET, compress_image};

/// Builds the natural-language prompt for a task. Environment and testbook
/// descriptors take precedence; free-text instructions are used verbatim
/// otherwise.
pub fn compose_instructions(task: &AgentTask) -> String {
  let mut parts = Vec::new();

  if let Some(env) = task.environment.as_ref().filter(|e| !e.id.is_empty()) {
    let (name, url) = (env.name.trim(), env.url.trim());
    if !name.is_empty() || !url.is_empty() {
      let name = if name.is_empty() { "Environment" } else { name };
      if url.is_empty() {
        parts.push(format!("Target environment: {name}"));
      } else {
        parts.push(format!("Target environment: {name} ({url})"));
      }
    }
  }

  if let Some(testbook) = task.testbook.as_ref().filter(|t| !t.id.is_empty()) {
    let version = testbook.version.trim();
    if !testbook.tasks.is_empty() {
      let header = if version.is_empty() {
        "Execute the following steps:".to_string()
      } else {
        format!("Execute testbook version {version} with the following steps:")
      };
      parts.push(header);
      parts.extend(testbook.tasks.iter().map(|step| format!("- {step}")));
    } else if !version.is_empty() {
      parts.push(format!("Execute testbook version {version}."));
    }
  }

  if parts.is_empty() {
    if task.instructions.is_empty() {
      return "Run testbook".into();
    }
    return task.instructions.clone();
  }
  parts.join("\n")
}

fn guess_mime(path: &Path) -> &'static str {
  match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
    Some("jpg") | Some("jpeg") => "image/jpeg",
    Some("webp") => "image/webp",
    Some("gif") => "image/gif",
    _ => "image/png",
  }
}

/// Runs one task end to end: RUNNING, a STEP per unit of automation work,
/// then exactly one terminal result.
pub struct TaskExecutor {
  broker: Arc<dyn Broker>,
  automation: Arc<dyn Automation>,
  credentials: Arc<Credentials>,
  shrinker: PayloadShrinker,
  agent_id: String,
  agent_version: String,
  result_subject: String,
  max_steps: u32,
}

impl TaskExecutor {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    broker: Arc<dyn Broker>,
    automation: Arc<dyn Automation>,
    credentials: Arc<Credentials>,
    shrinker: PayloadShrinker,
    agent_id: impl Into<String>,
    agent_version: impl Into<String>,
    result_subject: impl Into<String>,
    max_steps: u32,
  ) -> Self {
    Self {
      broker,
      automation,
      credentials,
      shrinker,
      agent_id: agent_id.into(),
      agent_version: agent_version.into(),
      result_subject: result_subject.into(),
      max_steps,
    }
  }

  fn metadata(&self, task: &AgentTask) -> AgentMetadata {
    AgentMetadata {
      agent_id: self.agent_id.clone(),
      project_id: task.project_id().to_string(),
      run_id: task.run_id().to_string(),
      agent_version: self.agent_version.clone(),
    }
  }

  /// Returns the terminal status that was published. An error means the
  /// terminal result could not be delivered.
  pub async fn execute(&self, task: &AgentTask) -> Result<RunStatus> {
    let started_at = Utc::now();
    let run_id = task.run_id();
    info!("Agent {}: starting run {}", self.agent_id, run_id);

    if let Err(err) = self.publish_report(RunReport::started(started_at), task).await {
      warn!(%run_id, error = %err, "failed to publish RUNNING result");
    }

    let project_id = task.project_id();
    if !project_id.is_empty() {
      if let Err(err) = self.credentials.remember_project_agent(project_id, &self.agent_id).await {
        warn!(%project_id, error = %err, "failed to record project agent");
      }
    }

    let instructions = compose_instructions(task);
    debug!(%run_id, %instructions, "composed instructions");

    let mut observer = StepPublisher { executor: self, task, started_at, index: 0, last_partial: None };
    let outcome = self.automation.run(&instructions, self.max_steps, &mut observer).await;
    let last_partial = observer.last_partial.take();
    let finished_at = Utc::now();

    let report = match outcome {
      Ok(history) => {
        let snapshot = HistorySnapshot::collect(history.as_ref(), self.shrinker.send_screenshots());
        RunReport::passed(started_at, finished_at, snapshot)
      }
      Err(err) => {
        warn!(%run_id, error = %err, "automation run failed");
        RunReport::failed(started_at, finished_at, err.to_string(), last_partial)
      }
    };
    let status = report.status;
    self
      .publish_report(report, task)
      .await
      .with_context(|| format!("publishing {} result for run {run_id}", status.as_str()))?;
    info!("Agent {}: run {} finished with {}", self.agent_id, run_id, status.as_str());
    Ok(status)
  }

  async fn publish_report(&self, report: RunReport, task: &AgentTask) -> Result<(), TransportError> {
    let wire = report.into_wire(self.metadata(task), task);
    self.publish_result(wire).await
  }

  /// Bounds and publishes a result. A payload the transport rejects as too
  /// large is republished in its minimal form.
  pub async fn publish_result(&self, result: AgentResult) -> Result<(), TransportError> {
    let result = self.shrinker.bound(result, RESULT_BUDGET);
    let payload = result.encode_to_vec();
    let run_id = result.metadata.as_ref().map(|m| m.run_id.as_str()).unwrap_or("");
    info!(
      %run_id,
      kind = ?result.kind(),
      status = %result.status,
      size = payload.len(),
      history_len = result.history_json.len(),
      partial_len = result.partial_history_json.len(),
      screenshot_len = result.step.as_ref().map(|s| s.screenshot_bytes.len()).unwrap_or(0),
      "publishing result"
    );
    debug!(?result, "result detail");

    match self.broker.publish(&self.result_subject, payload).await {
      Ok(()) => Ok(()),
      Err(err) if err.is_max_payload() => {
        warn!(%run_id, error = %err, "result rejected as too large, sending minimal result");
        let minimal = PayloadShrinker::minimal(&result, self.broker.max_payload());
        self.broker.publish(&self.result_subject, minimal.encode_to_vec()).await
      }
      Err(err) => Err(err),
    }
  }
}

struct StepPublisher<'a> {
  executor: &'a TaskExecutor,
  task: &'a AgentTask,
  started_at: DateTime<Utc>,
  index: u32,
  last_partial: Option<HistorySnapshot>,
}

impl StepPublisher<'_> {
  async fn screenshot(&self, path: &Path) -> Option<Screenshot> {
    if !self.executor.shrinker.send_screenshots() {
      return None;
    }
    let bytes = match tokio::fs::read(path).await {
      Ok(bytes) => bytes,
      Err(err) => {
        warn!(path = %path.display(), error = %err, "could not read step screenshot");
        return None;
      }
    };
    Some(match compress_image(&bytes, CAPTURE_IMAGE_BUDGET) {
      Some(jpeg) => Screenshot { mime_type: "image/jpeg".into(), bytes: jpeg },
      None => Screenshot { mime_type: guess_mime(path).into(), bytes },
    })
  }
}

#[async_trait]
impl StepObserver for StepPublisher<'_> {
  async fn on_step_end(&mut self, step: &StepEntry, history: &dyn RunHistory) {
    self.index += 1;
    let screenshot = match step.screenshot_path.as_deref() {
      Some(path) => self.screenshot(path).await,
      None => None,
    };
    let error = step.error().unwrap_or_default();
    let report = StepReport {
      index: self.index,
      status: if error.is_empty() { StepStatus::Completed } else { StepStatus::Failed },
      action_name: step.action_name(),
      model_actions_json: serde_json::to_string(&step.model_actions).unwrap_or_default(),
      model_outputs_json: step.model_output.as_ref().map(|v| v.to_string()).unwrap_or_default(),
      action_results_json: serde_json::to_string(&step.action_results).unwrap_or_default(),
      observation: step.observation.clone().unwrap_or_default(),
      error,
      url: step.url.clone().unwrap_or_default(),
      screenshot,
      screenshot_path: step.screenshot_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
      timestamp: step.step_end_time.unwrap_or_else(Utc::now),
      state_json: step.state.as_ref().map(|v| v.to_string()).unwrap_or_default(),
    };

    let partial = HistorySnapshot::collect(history, self.executor.shrinker.send_screenshots());
    self.last_partial = Some(partial.clone());
    let run_id = self.task.run_id();
    if let Err(err) = self.executor.publish_report(RunReport::step(self.started_at, report, Some(partial)), self.task).await {
      warn!(%run_id, step = self.index, error = %err, "failed to publish STEP result");
    }
  }
}
