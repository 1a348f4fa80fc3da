//! Best-effort summary of an automation run.
//!
//! The automation engine exposes its run history through [`RunHistory`],
//! whose accessors are all optional. A snapshot collects whatever is present
//! and leaves every absent field at its empty default.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::shrink::{CAPTURE_IMAGE_BUDGET, compress_data_url};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotEntry {
  /// Data URL or bare base64.
  pub data: String,
  #[serde(default)]
  pub mime_type: Option<String>,
}

pub trait RunHistory: Send + Sync {
  fn urls(&self) -> Option<Vec<String>> {
    None
  }
  fn screenshots(&self) -> Option<Vec<Option<ScreenshotEntry>>> {
    None
  }
  fn action_names(&self) -> Option<Vec<String>> {
    None
  }
  fn extracted_content(&self) -> Option<Vec<String>> {
    None
  }
  fn errors(&self) -> Option<Vec<Option<String>>> {
    None
  }
  fn model_actions(&self) -> Option<Vec<Value>> {
    None
  }
  fn model_outputs(&self) -> Option<Vec<Value>> {
    None
  }
  fn model_thoughts(&self) -> Option<Vec<Value>> {
    None
  }
  fn action_results(&self) -> Option<Vec<Value>> {
    None
  }
  fn action_history(&self) -> Option<Vec<Value>> {
    None
  }
  fn final_result(&self) -> Option<String> {
    None
  }
  fn is_done(&self) -> Option<bool> {
    None
  }
  fn is_successful(&self) -> Option<bool> {
    None
  }
  fn has_errors(&self) -> Option<bool> {
    None
  }
  fn number_of_steps(&self) -> Option<u64> {
    None
  }
  fn total_duration_seconds(&self) -> Option<f64> {
    None
  }
  fn structured_output(&self) -> Option<Value> {
    None
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
  pub urls: Vec<String>,
  pub screenshots: Vec<String>,
  pub action_names: Vec<String>,
  pub extracted_content: Vec<String>,
  pub errors: Vec<Option<String>>,
  pub model_actions: Vec<String>,
  pub model_outputs: Vec<String>,
  pub final_result: String,
  pub is_done: bool,
  pub is_successful: Option<bool>,
  pub has_errors: bool,
  pub model_thoughts: Vec<String>,
  pub action_results: Vec<String>,
  pub action_history: Vec<String>,
  pub number_of_steps: u64,
  pub duration_seconds: u64,
  pub structured_output: Option<String>,
}

impl HistorySnapshot {
  pub fn collect(history: &dyn RunHistory, send_screenshots: bool) -> Self {
    let mut snapshot = Self::default();
    if let Some(urls) = history.urls() {
      snapshot.urls = urls;
    }
    if send_screenshots {
      if let Some(shots) = history.screenshots() {
        snapshot.screenshots = shots
          .into_iter()
          .flatten()
          .filter(|shot| !shot.data.trim().is_empty())
          .map(|shot| {
            let mime = shot.mime_type.as_deref().unwrap_or("image/png");
            compress_data_url(&shot.data, mime, CAPTURE_IMAGE_BUDGET)
          })
          .collect();
      }
    }
    if let Some(names) = history.action_names() {
      snapshot.action_names = names;
    }
    if let Some(content) = history.extracted_content() {
      snapshot.extracted_content = content;
    }
    if let Some(errors) = history.errors() {
      snapshot.errors = errors;
    }
    if let Some(actions) = history.model_actions() {
      snapshot.model_actions = stringify_all(actions);
    }
    if let Some(outputs) = history.model_outputs() {
      snapshot.model_outputs = stringify_all(outputs);
    }
    if let Some(thoughts) = history.model_thoughts() {
      snapshot.model_thoughts = stringify_all(thoughts);
    }
    if let Some(results) = history.action_results() {
      snapshot.action_results = stringify_all(results);
    }
    if let Some(actions) = history.action_history() {
      snapshot.action_history = stringify_all(actions);
    }
    if let Some(result) = history.final_result() {
      snapshot.final_result = result;
    }
    if let Some(done) = history.is_done() {
      snapshot.is_done = done;
    }
    snapshot.is_successful = history.is_successful();
    if let Some(has_errors) = history.has_errors() {
      snapshot.has_errors = has_errors;
    }
    if let Some(steps) = history.number_of_steps() {
      snapshot.number_of_steps = steps;
    }
    if let Some(duration) = history.total_duration_seconds().filter(|d| d.is_finite() && *d >= 0.0) {
      snapshot.duration_seconds = duration as u64;
    }
    snapshot.structured_output = history.structured_output().map(stringify);
    snapshot
  }

  pub fn to_json(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }
}

fn stringify(value: Value) -> String {
  match value {
    Value::String(s) => s,
    other => other.to_string(),
  }
}

fn stringify_all(values: Vec<Value>) -> Vec<String> {
  values.into_iter().filter(|v| !v.is_null()).map(stringify).collect()
}

/// A history document as emitted by an external automation process. Fields
/// the process omits become absent accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonHistory {
  pub urls: Option<Vec<Option<String>>>,
  pub screenshots: Option<Vec<Option<ScreenshotEntry>>>,
  pub action_names: Option<Vec<Option<String>>>,
  pub extracted_content: Option<Vec<Option<String>>>,
  pub errors: Option<Vec<Option<String>>>,
  pub model_actions: Option<Vec<Value>>,
  pub model_outputs: Option<Vec<Value>>,
  pub model_thoughts: Option<Vec<Value>>,
  pub action_results: Option<Vec<Value>>,
  pub action_history: Option<Vec<Value>>,
  pub final_result: Option<String>,
  pub is_done: Option<bool>,
  pub is_successful: Option<bool>,
  pub has_errors: Option<bool>,
  pub number_of_steps: Option<u64>,
  pub duration_seconds: Option<f64>,
  pub structured_output: Option<Value>,
}

fn present(values: &Option<Vec<Option<String>>>) -> Option<Vec<String>> {
  values.as_ref().map(|items| items.iter().flatten().cloned().collect())
}

impl RunHistory for JsonHistory {
  fn urls(&self) -> Option<Vec<String>> {
    present(&self.urls)
  }
  fn screenshots(&self) -> Option<Vec<Option<ScreenshotEntry>>> {
    self.screenshots.clone()
  }
  fn action_names(&self) -> Option<Vec<String>> {
    present(&self.action_names)
  }
  fn extracted_content(&self) -> Option<Vec<String>> {
    present(&self.extracted_content)
  }
  fn errors(&self) -> Option<Vec<Option<String>>> {
    self.errors.clone()
  }
  fn model_actions(&self) -> Option<Vec<Value>> {
    self.model_actions.clone()
  }
  fn model_outputs(&self) -> Option<Vec<Value>> {
    self.model_outputs.clone()
  }
  fn model_thoughts(&self) -> Option<Vec<Value>> {
    self.model_thoughts.clone()
  }
  fn action_results(&self) -> Option<Vec<Value>> {
    self.action_results.clone()
  }
  fn action_history(&self) -> Option<Vec<Value>> {
    self.action_history.clone()
  }
  fn final_result(&self) -> Option<String> {
    self.final_result.clone()
  }
  fn is_done(&self) -> Option<bool> {
    self.is_done
  }
  fn is_successful(&self) -> Option<bool> {
    self.is_successful
  }
  fn has_errors(&self) -> Option<bool> {
    self.has_errors
  }
  fn number_of_steps(&self) -> Option<u64> {
    self.number_of_steps
  }
  fn total_duration_seconds(&self) -> Option<f64> {
    self.duration_seconds
  }
  fn structured_output(&self) -> Option<Value> {
    self.structured_output.clone()
  }
}
