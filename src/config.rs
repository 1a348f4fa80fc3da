use std::env;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::messaging::DEFAULT_MAX_PAYLOAD;
use crate::messaging::auth::auth_url;

pub const STREAM_NAME: &str = "AGENTS";
pub const SUBJECT_PREFIX: &str = "agents";
pub const DURABLE_PREFIX: &str = "agent";
pub const CAPABILITIES: &[&str] = &["browser_use"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("{name} must be a whole number, got {value:?}")]
  Number { name: &'static str, value: String },
  #[error("{name} must be true or false, got {value:?}")]
  Flag { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
  pub broker_url: String,
  pub agent_id: Option<String>,
  pub project_id: Option<String>,
  pub heartbeat_interval: Duration,
  pub max_steps: u32,
  pub send_screenshots: bool,
  pub max_payload: usize,
  pub core_base_url: String,
  pub state_dir: PathBuf,
  pub automation_command: Option<String>,
  pub allow_unauthenticated_fallback: bool,
  pub log_level: String,
}

impl Config {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|name| env::var(name).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
    let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    Ok(Self {
      broker_url: get("QA_AGENT_BROKER_URL").unwrap_or_else(|| "amqp://127.0.0.1:5672/%2f".into()),
      agent_id: get("QA_AGENT_ID"),
      project_id: get("QA_AGENT_PROJECT_ID"),
      heartbeat_interval: Duration::from_secs(number("QA_AGENT_HEARTBEAT_INTERVAL", get("QA_AGENT_HEARTBEAT_INTERVAL"), 30)?),
      max_steps: number("QA_AGENT_MAX_STEPS", get("QA_AGENT_MAX_STEPS"), 60)?,
      send_screenshots: flag("QA_AGENT_SEND_SCREENSHOTS", get("QA_AGENT_SEND_SCREENSHOTS"), true)?,
      max_payload: number("QA_AGENT_MAX_PAYLOAD", get("QA_AGENT_MAX_PAYLOAD"), DEFAULT_MAX_PAYLOAD)?,
      core_base_url: get("QA_CORE_BASE_URL").unwrap_or_else(|| "http://localhost:8000".into()),
      state_dir: get("QA_AGENT_STATE_DIR").map(PathBuf::from).unwrap_or_else(default_state_dir),
      automation_command: get("QA_AGENT_AUTOMATION_COMMAND"),
      allow_unauthenticated_fallback: flag(
        "QA_AGENT_ALLOW_INSECURE_FALLBACK",
        get("QA_AGENT_ALLOW_INSECURE_FALLBACK"),
        true,
      )?,
      log_level: get("QA_AGENT_LOG_LEVEL").unwrap_or_else(|| "info".into()),
    })
  }

  pub fn apply_args(&mut self, args: &AgentArgs) {
    if let Some(secs) = args.heartbeat_interval {
      self.heartbeat_interval = Duration::from_secs(secs);
    }
    if let Some(steps) = args.max_steps {
      self.max_steps = steps;
    }
    if let Some(send) = args.send_screenshots {
      self.send_screenshots = send;
    }
    if let Some(level) = &args.log_level {
      self.log_level = level.clone();
    }
  }

  pub fn task_subject(&self, agent_id: &str) -> String {
    format!("{SUBJECT_PREFIX}.{agent_id}.tasks")
  }

  pub fn result_subject(&self, agent_id: &str) -> String {
    format!("{SUBJECT_PREFIX}.{agent_id}.results")
  }

  pub fn heartbeat_subject(&self, agent_id: &str) -> String {
    format!("{SUBJECT_PREFIX}.{agent_id}.heartbeat")
  }

  pub fn auth_subject(&self, agent_id: &str) -> String {
    format!("{SUBJECT_PREFIX}.{agent_id}.auth")
  }

  pub fn durable_name(&self, agent_id: &str) -> String {
    format!("{DURABLE_PREFIX}-{agent_id}")
  }

  pub fn auth_url(&self, agent_id: &str, public_key: &str) -> String {
    auth_url(&self.core_base_url, agent_id, public_key)
  }

  pub fn capabilities(&self) -> Vec<String> {
    CAPABILITIES.iter().map(|c| c.to_string()).collect()
  }
}

fn default_state_dir() -> PathBuf {
  dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".qa-agent")
}

fn number<T: std::str::FromStr>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
  match value {
    None => Ok(default),
    Some(value) => value.parse().map_err(|_| ConfigError::Number { name, value }),
  }
}

fn flag(name: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
  let Some(value) = value else {
    return Ok(default);
  };
  match value.to_ascii_lowercase().as_str() {
    "true" | "1" | "yes" | "on" => Ok(true),
    "false" | "0" | "no" | "off" => Ok(false),
    _ => Err(ConfigError::Flag { name, value }),
  }
}

/// Command line shared by both binaries; each option overrides its
/// environment variable.
#[derive(Debug, Clone, Default, Parser)]
#[command(version, about = "QA automation worker")]
pub struct AgentArgs {
  /// Forget the cached token and queue JWT before starting.
  #[arg(long)]
  pub logout: bool,
  /// Seconds between heartbeats.
  #[arg(long)]
  pub heartbeat_interval: Option<u64>,
  #[arg(long)]
  pub max_steps: Option<u32>,
  #[arg(long)]
  pub send_screenshots: Option<bool>,
  #[arg(long)]
  pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |name| map.get(name).cloned()
  }

  #[test]
  fn defaults_apply_when_unset() {
    let config = Config::from_lookup(lookup(&[("QA_AGENT_STATE_DIR", "/tmp/qa")])).unwrap();
    assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    assert_eq!(config.max_steps, 60);
    assert!(config.send_screenshots);
    assert!(config.allow_unauthenticated_fallback);
    assert_eq!(config.max_payload, 1_048_576);
    assert_eq!(config.state_dir, PathBuf::from("/tmp/qa"));
    assert!(config.agent_id.is_none());
  }

  #[test]
  fn values_are_parsed() {
    let config = Config::from_lookup(lookup(&[
      ("QA_AGENT_HEARTBEAT_INTERVAL", "5"),
      ("QA_AGENT_SEND_SCREENSHOTS", "no"),
      ("QA_AGENT_ID", " agent-7 "),
      ("QA_AGENT_PROJECT_ID", ""),
    ]))
    .unwrap();
    assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    assert!(!config.send_screenshots);
    assert_eq!(config.agent_id.as_deref(), Some("agent-7"));
    assert!(config.project_id.is_none());
  }

  #[test]
  fn malformed_values_are_errors() {
    let err = Config::from_lookup(lookup(&[("QA_AGENT_MAX_STEPS", "lots")])).unwrap_err();
    assert_eq!(err, ConfigError::Number { name: "QA_AGENT_MAX_STEPS", value: "lots".into() });
    assert!(Config::from_lookup(lookup(&[("QA_AGENT_SEND_SCREENSHOTS", "maybe")])).is_err());
  }

  #[test]
  fn subjects_follow_the_worker_id() {
    let config = Config::from_lookup(lookup(&[("QA_CORE_BASE_URL", "https://core")])).unwrap();
    assert_eq!(config.task_subject("w1"), "agents.w1.tasks");
    assert_eq!(config.result_subject("w1"), "agents.w1.results");
    assert_eq!(config.heartbeat_subject("w1"), "agents.w1.heartbeat");
    assert_eq!(config.auth_subject("w1"), "agents.w1.auth");
    assert_eq!(config.durable_name("w1"), "agent-w1");
    assert_eq!(config.auth_url("w1", "k"), "https://core/agent_auth/w1?public_key=k");
  }

  #[test]
  fn cli_overrides_environment() {
    let mut config = Config::from_lookup(lookup(&[])).unwrap();
    let args = AgentArgs::parse_from(["qa_agent_worker", "--max-steps", "3", "--send-screenshots", "false", "--logout"]);
    config.apply_args(&args);
    assert!(args.logout);
    assert_eq!(config.max_steps, 3);
    assert!(!config.send_screenshots);
  }
}
