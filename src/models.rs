//! Wire messages exchanged with the control plane.
//!
//! Field tags are shared with the dashboard and core services, so they must
//! never be renumbered. Tags 2 and 3 of `AgentTask` carried the legacy
//! `testbook_id`/`environment_id` strings and are left unused.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentMetadata {
  #[prost(string, tag = "1")]
  pub agent_id: ::prost::alloc::string::String,
  #[prost(string, tag = "2")]
  pub project_id: ::prost::alloc::string::String,
  #[prost(string, tag = "3")]
  pub run_id: ::prost::alloc::string::String,
  #[prost(string, tag = "4")]
  pub agent_version: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentEnvironment {
  #[prost(string, tag = "1")]
  pub id: ::prost::alloc::string::String,
  #[prost(string, tag = "2")]
  pub name: ::prost::alloc::string::String,
  #[prost(string, tag = "3")]
  pub url: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentTestbook {
  #[prost(string, tag = "1")]
  pub id: ::prost::alloc::string::String,
  #[prost(string, tag = "2")]
  pub version: ::prost::alloc::string::String,
  /// Ordered step instructions.
  #[prost(string, repeated, tag = "3")]
  pub tasks: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentTask {
  #[prost(message, optional, tag = "1")]
  pub metadata: ::core::option::Option<AgentMetadata>,
  #[prost(string, tag = "4")]
  pub instructions: ::prost::alloc::string::String,
  #[prost(string, tag = "5")]
  pub core_base_url: ::prost::alloc::string::String,
  #[prost(string, tag = "6")]
  pub core_token: ::prost::alloc::string::String,
  #[prost(message, optional, tag = "7")]
  pub environment: ::core::option::Option<AgentEnvironment>,
  #[prost(message, optional, tag = "8")]
  pub testbook: ::core::option::Option<AgentTestbook>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AgentResultKind {
  Unspecified = 0,
  Status = 1,
  Step = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentStepResult {
  #[prost(uint32, tag = "1")]
  pub step_index: u32,
  #[prost(string, tag = "2")]
  pub status: ::prost::alloc::string::String,
  #[prost(string, tag = "3")]
  pub action_name: ::prost::alloc::string::String,
  #[prost(string, tag = "4")]
  pub model_actions_json: ::prost::alloc::string::String,
  #[prost(string, tag = "5")]
  pub model_outputs_json: ::prost::alloc::string::String,
  #[prost(string, tag = "6")]
  pub action_results_json: ::prost::alloc::string::String,
  #[prost(string, tag = "7")]
  pub observation: ::prost::alloc::string::String,
  #[prost(string, tag = "8")]
  pub error: ::prost::alloc::string::String,
  #[prost(string, tag = "9")]
  pub url: ::prost::alloc::string::String,
  #[prost(string, tag = "10")]
  pub screenshot_mime_type: ::prost::alloc::string::String,
  #[prost(bytes = "vec", tag = "11")]
  pub screenshot_bytes: ::prost::alloc::vec::Vec<u8>,
  #[prost(string, tag = "12")]
  pub screenshot_path: ::prost::alloc::string::String,
  #[prost(string, tag = "13")]
  pub timestamp: ::prost::alloc::string::String,
  #[prost(string, tag = "14")]
  pub state_json: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentResult {
  #[prost(message, optional, tag = "1")]
  pub metadata: ::core::option::Option<AgentMetadata>,
  #[prost(enumeration = "AgentResultKind", tag = "2")]
  pub kind: i32,
  #[prost(string, tag = "3")]
  pub status: ::prost::alloc::string::String,
  #[prost(string, tag = "4")]
  pub message: ::prost::alloc::string::String,
  #[prost(string, tag = "5")]
  pub error: ::prost::alloc::string::String,
  #[prost(string, tag = "6")]
  pub started_at: ::prost::alloc::string::String,
  #[prost(string, tag = "7")]
  pub finished_at: ::prost::alloc::string::String,
  #[prost(string, tag = "8")]
  pub history_json: ::prost::alloc::string::String,
  #[prost(string, tag = "9")]
  pub testbook_id: ::prost::alloc::string::String,
  #[prost(string, tag = "10")]
  pub environment_id: ::prost::alloc::string::String,
  #[prost(string, tag = "11")]
  pub partial_history_json: ::prost::alloc::string::String,
  #[prost(message, optional, tag = "12")]
  pub step: ::core::option::Option<AgentStepResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentHeartbeat {
  #[prost(message, optional, tag = "1")]
  pub metadata: ::core::option::Option<AgentMetadata>,
  #[prost(string, tag = "2")]
  pub status: ::prost::alloc::string::String,
  /// Unix seconds.
  #[prost(int64, tag = "3")]
  pub timestamp: i64,
  #[prost(string, repeated, tag = "4")]
  pub capabilities: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

impl AgentTask {
  pub fn run_id(&self) -> &str {
    self.metadata.as_ref().map(|m| m.run_id.as_str()).unwrap_or("")
  }

  pub fn project_id(&self) -> &str {
    self.metadata.as_ref().map(|m| m.project_id.as_str()).unwrap_or("")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use prost::Message;
  use base64::Engine;
  use base64::engine::general_purpose::STANDARD;

  fn metadata() -> AgentMetadata {
    AgentMetadata {
      agent_id: "agent-123".into(),
      project_id: "proj-789".into(),
      run_id: "run-001".into(),
      agent_version: "dev".into(),
    }
  }

  #[test]
  fn task_roundtrip_keeps_descriptors() {
    let task = AgentTask {
      metadata: Some(metadata()),
      instructions: "Do something".into(),
      core_base_url: "https://core.local".into(),
      core_token: "token-xyz".into(),
      environment: Some(AgentEnvironment { id: "env-abc".into(), name: "Staging".into(), url: "https://staging".into() }),
      testbook: Some(AgentTestbook {
        id: "tbk-456".into(),
        version: "3".into(),
        tasks: vec!["open page".into(), "click button".into()],
      }),
    };
    let parsed = AgentTask::decode(task.encode_to_vec().as_slice()).unwrap();
    assert_eq!(parsed, task);
    assert_eq!(parsed.run_id(), "run-001");
    assert_eq!(parsed.project_id(), "proj-789");
  }

  #[test]
  fn legacy_task_bytes_still_decode() {
    // Produced by the previous schema revision (testbook_id/environment_id as strings).
    let legacy = STANDARD
      .decode(
        "CiMKCWFnZW50LTEyMxIIcHJvai03ODkaB3J1bi0wMDEiA2RldhIHdGJrLTQ1NhoHZW52\
         LWFiYyIMRG8gc29tZXRoaW5nKhJodHRwczovL2NvcmUubG9jYWwyCXRva2VuLXh5eg==",
      )
      .unwrap();
    let parsed = AgentTask::decode(legacy.as_slice()).unwrap();
    assert_eq!(parsed.metadata, Some(metadata()));
    assert_eq!(parsed.instructions, "Do something");
    assert_eq!(parsed.core_base_url, "https://core.local");
    assert_eq!(parsed.core_token, "token-xyz");
    assert!(parsed.testbook.is_none());
    assert!(parsed.environment.is_none());
  }

  #[test]
  fn step_result_roundtrip() {
    let result = AgentResult {
      metadata: Some(metadata()),
      kind: AgentResultKind::Step as i32,
      status: "STATUS_RUNNING".into(),
      message: "Step 2 completed".into(),
      started_at: "2025-01-01T00:00:00Z".into(),
      partial_history_json: "{\"urls\":[]}".into(),
      step: Some(AgentStepResult {
        step_index: 2,
        status: "STEP_COMPLETED".into(),
        action_name: "click".into(),
        screenshot_mime_type: "image/png".into(),
        screenshot_bytes: vec![1, 2, 3],
        ..Default::default()
      }),
      ..Default::default()
    };
    let parsed = AgentResult::decode(result.encode_to_vec().as_slice()).unwrap();
    assert_eq!(parsed, result);
    assert_eq!(parsed.kind(), AgentResultKind::Step);
  }

  #[test]
  fn heartbeat_roundtrip() {
    let heartbeat = AgentHeartbeat {
      metadata: Some(AgentMetadata { run_id: String::new(), ..metadata() }),
      status: "online".into(),
      timestamp: 42,
      capabilities: vec!["browser_use".into()],
    };
    let parsed = AgentHeartbeat::decode(heartbeat.encode_to_vec().as_slice()).unwrap();
    assert_eq!(parsed, heartbeat);
  }

  #[test]
  fn unknown_kind_reads_as_unspecified() {
    let result = AgentResult { kind: 42, ..Default::default() };
    assert_eq!(result.kind(), AgentResultKind::Unspecified);
  }
}
