use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::history::{JsonHistory, RunHistory};

#[derive(Debug, Error)]
pub enum AutomationError {
  #[error("failed to launch automation: {0}")]
  Launch(String),
  #[error("{0}")]
  Run(String),
  #[error("automation ended without a result")]
  Incomplete,
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// The last unit of work the automation performed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepEntry {
  pub model_actions: Vec<Value>,
  pub model_output: Option<Value>,
  pub action_results: Vec<Value>,
  pub observation: Option<String>,
  pub url: Option<String>,
  pub screenshot_path: Option<PathBuf>,
  pub step_end_time: Option<DateTime<Utc>>,
  pub state: Option<Value>,
}

impl StepEntry {
  /// First error reported by any action result of this step.
  pub fn error(&self) -> Option<String> {
    self.action_results.iter().find_map(|result| match result.get("error") {
      Some(Value::String(message)) if !message.is_empty() => Some(message.clone()),
      Some(Value::Null) | None => None,
      Some(other) => Some(other.to_string()),
    })
  }

  /// Name of the first action, i.e. the single key of the first action object.
  pub fn action_name(&self) -> String {
    self
      .model_actions
      .first()
      .and_then(Value::as_object)
      .and_then(|action| action.keys().next().cloned())
      .unwrap_or_default()
  }
}

/// Invoked by the automation between steps; awaited before it continues.
#[async_trait]
pub trait StepObserver: Send {
  async fn on_step_end(&mut self, step: &StepEntry, history: &dyn RunHistory);
}

#[async_trait]
pub trait Automation: Send + Sync {
  async fn run(
    &self,
    instructions: &str,
    max_steps: u32,
    observer: &mut dyn StepObserver,
  ) -> Result<Box<dyn RunHistory>, AutomationError>;
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
  instructions: &'a str,
  max_steps: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ProcessEvent {
  Step {
    step: StepEntry,
    #[serde(default)]
    history: JsonHistory,
  },
  Done {
    #[serde(default)]
    history: JsonHistory,
  },
  Error {
    message: String,
  },
}

/// Drives an external automation program over JSON lines on stdin/stdout.
#[derive(Debug, Clone)]
pub struct CommandAutomation {
  program: String,
  args: Vec<String>,
}

impl CommandAutomation {
  pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
    Self { program: program.into(), args }
  }

  /// Splits a whitespace separated command line into program and arguments.
  pub fn from_command_line(command: &str) -> Option<Self> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some(Self::new(program, parts.collect()))
  }
}

#[async_trait]
impl Automation for CommandAutomation {
  async fn run(
    &self,
    instructions: &str,
    max_steps: u32,
    observer: &mut dyn StepObserver,
  ) -> Result<Box<dyn RunHistory>, AutomationError> {
    let mut child = Command::new(&self.program)
      .args(&self.args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true)
      .spawn()
      .map_err(|err| AutomationError::Launch(format!("{}: {err}", self.program)))?;

    let mut stdin = child.stdin.take().ok_or_else(|| AutomationError::Launch("stdin unavailable".into()))?;
    let stdout = child.stdout.take().ok_or_else(|| AutomationError::Launch("stdout unavailable".into()))?;

    let mut request = serde_json::to_string(&RunRequest { instructions, max_steps })
      .map_err(|err| AutomationError::Launch(err.to_string()))?;
    request.push('\n');
    stdin.write_all(request.as_bytes()).await?;
    stdin.flush().await?;
    drop(stdin);

    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
      let trimmed = line.trim();
      if trimmed.is_empty() {
        continue;
      }
      let event: ProcessEvent = match serde_json::from_str(trimmed) {
        Ok(event) => event,
        Err(err) => {
          warn!(error = %err, "ignoring unparsable automation output line");
          continue;
        }
      };
      match event {
        ProcessEvent::Step { step, history } => observer.on_step_end(&step, &history).await,
        ProcessEvent::Done { history } => {
          let status = child.wait().await?;
          debug!(?status, "automation process finished");
          return Ok(Box::new(history));
        }
        ProcessEvent::Error { message } => {
          let _ = child.wait().await;
          return Err(AutomationError::Run(message));
        }
      }
    }

    let status = child.wait().await?;
    if status.success() {
      Err(AutomationError::Incomplete)
    } else {
      Err(AutomationError::Run(format!("automation process exited with {status}")))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn step_error_is_first_non_null_error() {
    let step = StepEntry {
      action_results: vec![json!({"error": null}), json!({"error": "timeout"}), json!({"error": "later"})],
      ..Default::default()
    };
    assert_eq!(step.error().as_deref(), Some("timeout"));
    assert!(StepEntry::default().error().is_none());
  }

  #[test]
  fn action_name_is_first_key_of_first_action() {
    let step = StepEntry {
      model_actions: vec![json!({"go_to_url": {"url": "https://a"}}), json!({"click": {}})],
      ..Default::default()
    };
    assert_eq!(step.action_name(), "go_to_url");
    assert_eq!(StepEntry::default().action_name(), "");
  }

  #[test]
  fn process_events_parse() {
    let step: ProcessEvent = serde_json::from_str(
      r#"{"event":"step","step":{"url":"https://a","step_end_time":"2025-01-01T00:00:00Z"},"history":{"urls":["https://a"]}}"#,
    )
    .unwrap();
    match step {
      ProcessEvent::Step { step, history } => {
        assert_eq!(step.url.as_deref(), Some("https://a"));
        assert!(step.step_end_time.is_some());
        assert_eq!(history.urls(), Some(vec!["https://a".to_string()]));
      }
      other => panic!("unexpected {other:?}"),
    }
    let error: ProcessEvent = serde_json::from_str(r#"{"event":"error","message":"boom"}"#).unwrap();
    assert!(matches!(error, ProcessEvent::Error { message } if message == "boom"));
  }

  #[test]
  fn command_line_is_split_on_whitespace() {
    let automation = CommandAutomation::from_command_line("  python3 -m runner --headless ").unwrap();
    assert_eq!(automation.program, "python3");
    assert_eq!(automation.args, vec!["-m", "runner", "--headless"]);
    assert!(CommandAutomation::from_command_line("   ").is_none());
  }

  struct Counting(u32);

  #[async_trait]
  impl StepObserver for Counting {
    async fn on_step_end(&mut self, _step: &StepEntry, _history: &dyn RunHistory) {
      self.0 += 1;
    }
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn runs_a_process_speaking_json_lines() {
    let script = r#"read request; echo '{"event":"step","step":{"url":"https://a"}}'; echo 'noise'; echo '{"event":"step","step":{}}'; echo '{"event":"done","history":{"final_result":"ok","number_of_steps":2}}'"#;
    let automation = CommandAutomation::new("sh", vec!["-c".into(), script.into()]);
    let mut observer = Counting(0);
    let history = automation.run("do it", 5, &mut observer).await.unwrap();
    assert_eq!(observer.0, 2);
    assert_eq!(history.final_result().as_deref(), Some("ok"));
    assert_eq!(history.number_of_steps(), Some(2));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn process_error_event_fails_the_run() {
    let script = r#"read request; echo '{"event":"error","message":"browser crashed"}'"#;
    let automation = CommandAutomation::new("sh", vec!["-c".into(), script.into()]);
    let err = automation.run("x", 1, &mut Counting(0)).await.err().unwrap();
    assert_eq!(err.to_string(), "browser crashed");
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn silent_exit_is_incomplete() {
    let automation = CommandAutomation::new("sh", vec!["-c".into(), "read request; exit 0".into()]);
    let err = automation.run("x", 1, &mut Counting(0)).await.err().unwrap();
    assert!(matches!(err, AutomationError::Incomplete));
  }
}
