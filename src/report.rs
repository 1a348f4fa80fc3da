use chrono::{DateTime, SecondsFormat, Utc};

use crate::history::HistorySnapshot;
use crate::models::{AgentMetadata, AgentResult, AgentResultKind, AgentStepResult, AgentTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
  Running,
  Passed,
  Failed,
}

impl RunStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunStatus::Running => "STATUS_RUNNING",
      RunStatus::Passed => "STATUS_PASSED",
      RunStatus::Failed => "STATUS_FAILED",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
  Completed,
  Failed,
}

impl StepStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      StepStatus::Completed => "STEP_COMPLETED",
      StepStatus::Failed => "STEP_FAILED",
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Screenshot {
  pub mime_type: String,
  pub bytes: Vec<u8>,
}

/// One unit of automation work, as reported on the STEP stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
  pub index: u32,
  pub status: StepStatus,
  pub action_name: String,
  pub model_actions_json: String,
  pub model_outputs_json: String,
  pub action_results_json: String,
  pub observation: String,
  pub error: String,
  pub url: String,
  pub screenshot: Option<Screenshot>,
  pub screenshot_path: String,
  pub timestamp: DateTime<Utc>,
  pub state_json: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportBody {
  Status { history: Option<HistorySnapshot> },
  Step { step: StepReport, partial_history: Option<HistorySnapshot> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
  pub status: RunStatus,
  pub message: String,
  pub error: String,
  pub started_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub body: ReportBody,
}

impl RunReport {
  pub fn started(started_at: DateTime<Utc>) -> Self {
    Self {
      status: RunStatus::Running,
      message: "Run started".into(),
      error: String::new(),
      started_at,
      finished_at: None,
      body: ReportBody::Status { history: None },
    }
  }

  pub fn step(started_at: DateTime<Utc>, step: StepReport, partial_history: Option<HistorySnapshot>) -> Self {
    Self {
      status: RunStatus::Running,
      message: format!("Step {} completed", step.index),
      error: String::new(),
      started_at,
      finished_at: None,
      body: ReportBody::Step { step, partial_history },
    }
  }

  pub fn passed(started_at: DateTime<Utc>, finished_at: DateTime<Utc>, history: HistorySnapshot) -> Self {
    Self {
      status: RunStatus::Passed,
      message: "Run completed".into(),
      error: String::new(),
      started_at,
      finished_at: Some(finished_at),
      body: ReportBody::Status { history: Some(history) },
    }
  }

  pub fn failed(
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    error: String,
    history: Option<HistorySnapshot>,
  ) -> Self {
    Self {
      status: RunStatus::Failed,
      message: "Run failed".into(),
      error,
      started_at,
      finished_at: Some(finished_at),
      body: ReportBody::Status { history },
    }
  }

  pub fn into_wire(self, metadata: AgentMetadata, task: &AgentTask) -> AgentResult {
    let (kind, history_json, partial_history_json, step) = match self.body {
      ReportBody::Status { history } => (AgentResultKind::Status, history_json(history.as_ref()), String::new(), None),
      ReportBody::Step { step, partial_history } => (
        AgentResultKind::Step,
        String::new(),
        history_json(partial_history.as_ref()),
        Some(step.into_wire()),
      ),
    };
    AgentResult {
      metadata: Some(metadata),
      kind: kind as i32,
      status: self.status.as_str().into(),
      message: self.message,
      error: self.error,
      started_at: iso(self.started_at),
      finished_at: self.finished_at.map(iso).unwrap_or_default(),
      history_json,
      testbook_id: task.testbook.as_ref().map(|t| t.id.clone()).unwrap_or_default(),
      environment_id: task.environment.as_ref().map(|e| e.id.clone()).unwrap_or_default(),
      partial_history_json,
      step,
    }
  }
}

impl StepReport {
  fn into_wire(self) -> AgentStepResult {
    let (screenshot_mime_type, screenshot_bytes) = match self.screenshot {
      Some(shot) => (shot.mime_type, shot.bytes),
      None => (String::new(), Vec::new()),
    };
    AgentStepResult {
      step_index: self.index,
      status: self.status.as_str().into(),
      action_name: self.action_name,
      model_actions_json: self.model_actions_json,
      model_outputs_json: self.model_outputs_json,
      action_results_json: self.action_results_json,
      observation: self.observation,
      error: self.error,
      url: self.url,
      screenshot_mime_type,
      screenshot_bytes,
      screenshot_path: self.screenshot_path,
      timestamp: iso(self.timestamp),
      state_json: self.state_json,
    }
  }
}

fn history_json(history: Option<&HistorySnapshot>) -> String {
  history.map(HistorySnapshot::to_json).unwrap_or_default()
}

pub fn iso(ts: DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{AgentEnvironment, AgentTestbook};
  use chrono::TimeZone;

  fn task() -> AgentTask {
    AgentTask {
      testbook: Some(AgentTestbook { id: "tbk-1".into(), ..Default::default() }),
      environment: Some(AgentEnvironment { id: "env-1".into(), ..Default::default() }),
      ..Default::default()
    }
  }

  fn step(index: u32) -> StepReport {
    StepReport {
      index,
      status: StepStatus::Completed,
      action_name: "go_to_url".into(),
      model_actions_json: "[]".into(),
      model_outputs_json: String::new(),
      action_results_json: "[]".into(),
      observation: "page loaded".into(),
      error: String::new(),
      url: "https://example.com".into(),
      screenshot: Some(Screenshot { mime_type: "image/png".into(), bytes: vec![9, 9] }),
      screenshot_path: "/tmp/shot.png".into(),
      timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 5).unwrap(),
      state_json: "{}".into(),
    }
  }

  #[test]
  fn running_report_is_a_status_without_history() {
    let started = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let wire = RunReport::started(started).into_wire(AgentMetadata::default(), &task());
    assert_eq!(wire.kind(), AgentResultKind::Status);
    assert_eq!(wire.status, "STATUS_RUNNING");
    assert_eq!(wire.message, "Run started");
    assert_eq!(wire.started_at, "2025-01-01T00:00:00.000000+00:00");
    assert!(wire.finished_at.is_empty());
    assert!(wire.history_json.is_empty());
    assert!(wire.step.is_none());
    assert_eq!(wire.testbook_id, "tbk-1");
    assert_eq!(wire.environment_id, "env-1");
  }

  #[test]
  fn step_report_carries_only_step_fields() {
    let started = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let wire = RunReport::step(started, step(3), Some(HistorySnapshot::default()))
      .into_wire(AgentMetadata::default(), &AgentTask::default());
    assert_eq!(wire.kind(), AgentResultKind::Step);
    assert_eq!(wire.message, "Step 3 completed");
    assert!(wire.history_json.is_empty());
    assert!(wire.partial_history_json.contains("\"urls\""));
    let step = wire.step.unwrap();
    assert_eq!(step.step_index, 3);
    assert_eq!(step.status, "STEP_COMPLETED");
    assert_eq!(step.screenshot_bytes, vec![9, 9]);
    assert!(wire.testbook_id.is_empty());
  }

  #[test]
  fn failed_report_keeps_error_text() {
    let started = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let finished = Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap();
    let report = RunReport::failed(started, finished, "browser crashed".into(), None);
    assert_eq!(report.status, RunStatus::Failed);
    let wire = report.into_wire(AgentMetadata::default(), &AgentTask::default());
    assert_eq!(wire.status, "STATUS_FAILED");
    assert_eq!(wire.error, "browser crashed");
    assert_eq!(wire.message, "Run failed");
    assert!(!wire.finished_at.is_empty());
  }
}
