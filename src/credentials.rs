//! Local record of worker identity and cached credentials.
//!
//! Everything lives in one JSON document. Every mutation is a full
//! load-modify-save cycle performed under [`Credentials`]'s lock; across
//! processes the last writer wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_AGENT_KEY: &str = "__default__";
const STATE_FILE: &str = "agents.json";

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("credential store I/O failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("credential store encoding failed: {0}")]
  Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
  pub token: String,
  #[serde(default)]
  pub expires_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtRecord {
  pub jwt: String,
  #[serde(default)]
  pub expires_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
  /// Worker ids keyed by project id, plus [`DEFAULT_AGENT_KEY`].
  #[serde(default)]
  pub agents: BTreeMap<String, String>,
  #[serde(default)]
  pub version: Option<String>,
  #[serde(default)]
  pub core_tokens: BTreeMap<String, TokenRecord>,
  #[serde(default)]
  pub nats_jwt: Option<JwtRecord>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
  async fn load(&self) -> Result<AgentRecord, StoreError>;
  async fn save(&self, record: &AgentRecord) -> Result<(), StoreError>;
  async fn clear(&self) -> Result<(), StoreError>;
}

pub struct FileRecordStore {
  path: PathBuf,
}

impl FileRecordStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn in_dir(dir: &Path) -> Self {
    Self::new(dir.join(STATE_FILE))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

#[async_trait]
impl RecordStore for FileRecordStore {
  async fn load(&self) -> Result<AgentRecord, StoreError> {
    let raw = match tokio::fs::read(&self.path).await {
      Ok(raw) => raw,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(AgentRecord::default()),
      Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice::<AgentRecord>(&raw) {
      Ok(record) => Ok(record),
      Err(err) => {
        warn!(path = %self.path.display(), error = %err, "ignoring unreadable credential file");
        Ok(AgentRecord::default())
      }
    }
  }

  async fn save(&self, record: &AgentRecord) -> Result<(), StoreError> {
    let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;
    let payload = serde_json::to_vec_pretty(record)?;

    let tmp = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&tmp).await?;
    file.write_all(&payload).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, &self.path).await?;
    Ok(())
  }

  async fn clear(&self) -> Result<(), StoreError> {
    match tokio::fs::remove_file(&self.path).await {
      Ok(()) => Ok(()),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(err) => Err(err.into()),
    }
  }
}

#[derive(Default)]
pub struct MemoryRecordStore {
  record: std::sync::Mutex<Option<AgentRecord>>,
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
  async fn load(&self) -> Result<AgentRecord, StoreError> {
    Ok(self.record.lock().map(|r| r.clone().unwrap_or_default()).unwrap_or_default())
  }

  async fn save(&self, record: &AgentRecord) -> Result<(), StoreError> {
    if let Ok(mut slot) = self.record.lock() {
      *slot = Some(record.clone());
    }
    Ok(())
  }

  async fn clear(&self) -> Result<(), StoreError> {
    if let Ok(mut slot) = self.record.lock() {
      *slot = None;
    }
    Ok(())
  }
}

/// Parses the ISO-8601 forms the control plane sends. Naive timestamps are UTC.
pub fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
  let value = value.trim();
  if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
    return Some(ts.with_timezone(&Utc));
  }
  for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
      return Some(ts.and_utc());
    }
  }
  NaiveDate::parse_from_str(value, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|ts| ts.and_utc())
}

#[derive(Debug, PartialEq, Eq)]
enum Expiry {
  Never,
  Until(DateTime<Utc>),
  Malformed,
}

fn expiry_of(expires_at: &str) -> Expiry {
  if expires_at.trim().is_empty() {
    return Expiry::Never;
  }
  match parse_expiry(expires_at) {
    Some(ts) => Expiry::Until(ts),
    None => Expiry::Malformed,
  }
}

fn still_valid(expires_at: &str, now: DateTime<Utc>) -> bool {
  match expiry_of(expires_at) {
    Expiry::Never => true,
    Expiry::Until(ts) => now < ts,
    Expiry::Malformed => false,
  }
}

pub struct Credentials {
  store: Box<dyn RecordStore>,
  lock: Mutex<()>,
}

impl Credentials {
  pub fn new(store: impl RecordStore + 'static) -> Self {
    Self { store: Box::new(store), lock: Mutex::new(()) }
  }

  pub fn in_memory() -> Self {
    Self::new(MemoryRecordStore::default())
  }

  pub async fn record(&self) -> Result<AgentRecord, StoreError> {
    let _guard = self.lock.lock().await;
    self.store.load().await
  }

  async fn update<T>(&self, change: impl FnOnce(&mut AgentRecord) -> (T, bool)) -> Result<T, StoreError> {
    let _guard = self.lock.lock().await;
    let mut record = self.store.load().await?;
    let (value, dirty) = change(&mut record);
    if dirty {
      self.store.save(&record).await?;
    }
    Ok(value)
  }

  /// Returns the worker id for `project_id`, falling back to (and backfilling
  /// from) the shared default id; a fresh id is minted only when neither exists.
  pub async fn get_or_create_agent_id(&self, project_id: Option<&str>) -> Result<String, StoreError> {
    let project_id = project_id.filter(|p| !p.is_empty());
    self
      .update(|record| {
        if let Some(existing) = project_id.and_then(|p| record.agents.get(p)) {
          return (existing.clone(), false);
        }
        if let Some(default) = record.agents.get(DEFAULT_AGENT_KEY).cloned() {
          let dirty = match project_id {
            Some(project) => record.agents.insert(project.to_string(), default.clone()).as_ref() != Some(&default),
            None => false,
          };
          return (default, dirty);
        }
        let agent_id = Uuid::new_v4().to_string();
        record.agents.insert(project_id.unwrap_or(DEFAULT_AGENT_KEY).to_string(), agent_id.clone());
        info!(%agent_id, "generated new agent id");
        (agent_id, true)
      })
      .await
  }

  pub async fn remember_project_agent(&self, project_id: &str, agent_id: &str) -> Result<(), StoreError> {
    if project_id.is_empty() {
      return Ok(());
    }
    self
      .update(|record| {
        if record.agents.get(project_id).map(String::as_str) == Some(agent_id) {
          return ((), false);
        }
        record.agents.insert(project_id.to_string(), agent_id.to_string());
        record.agents.entry(DEFAULT_AGENT_KEY.to_string()).or_insert_with(|| agent_id.to_string());
        ((), true)
      })
      .await
  }

  pub async fn record_version(&self, version: &str) -> Result<(), StoreError> {
    self
      .update(|record| {
        if record.version.as_deref() == Some(version) {
          return ((), false);
        }
        record.version = Some(version.to_string());
        ((), true)
      })
      .await
  }

  pub async fn save_core_token(&self, agent_id: &str, token: &str, expires_at: Option<&str>) -> Result<(), StoreError> {
    self
      .update(|record| {
        record.core_tokens.insert(
          agent_id.to_string(),
          TokenRecord { token: token.to_string(), expires_at: expires_at.unwrap_or_default().to_string() },
        );
        ((), true)
      })
      .await
  }

  pub async fn clear_core_token(&self, agent_id: &str) -> Result<(), StoreError> {
    self.update(|record| ((), record.core_tokens.remove(agent_id).is_some())).await
  }

  /// Returns the cached token when present and unexpired. Empty, expired or
  /// malformed records are removed as a side effect.
  pub async fn valid_core_token_at(&self, agent_id: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
    self
      .update(|record| {
        let Some(entry) = record.core_tokens.get(agent_id) else {
          return (None, false);
        };
        if !entry.token.is_empty() && still_valid(&entry.expires_at, now) {
          return (Some(entry.token.clone()), false);
        }
        record.core_tokens.remove(agent_id);
        (None, true)
      })
      .await
  }

  pub async fn valid_core_token(&self, agent_id: &str) -> Result<Option<String>, StoreError> {
    self.valid_core_token_at(agent_id, Utc::now()).await
  }

  pub async fn is_core_token_valid(&self, agent_id: &str) -> Result<bool, StoreError> {
    Ok(self.valid_core_token(agent_id).await?.is_some())
  }

  pub async fn save_nats_jwt(&self, jwt: &str, expires_at: Option<&str>) -> Result<(), StoreError> {
    self
      .update(|record| {
        record.nats_jwt = Some(JwtRecord { jwt: jwt.to_string(), expires_at: expires_at.unwrap_or_default().to_string() });
        ((), true)
      })
      .await
  }

  pub async fn clear_nats_jwt(&self) -> Result<(), StoreError> {
    self.update(|record| ((), record.nats_jwt.take().is_some())).await
  }

  pub async fn valid_nats_jwt_at(&self, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
    self
      .update(|record| {
        let Some(entry) = record.nats_jwt.as_ref() else {
          return (None, false);
        };
        if !entry.jwt.is_empty() && still_valid(&entry.expires_at, now) {
          return (Some(entry.jwt.clone()), false);
        }
        record.nats_jwt = None;
        (None, true)
      })
      .await
  }

  pub async fn valid_nats_jwt(&self) -> Result<Option<String>, StoreError> {
    self.valid_nats_jwt_at(Utc::now()).await
  }
}
