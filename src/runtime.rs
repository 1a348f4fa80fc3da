use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use prost::Message;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::automation::Automation;
use crate::config::{Config, STREAM_NAME};
use crate::credentials::Credentials;
use crate::messaging::{Broker, InboundMessage, PullSubscription};
use crate::models::{AgentHeartbeat, AgentMetadata, AgentTask};
use crate::shrink::PayloadShrinker;
use crate::worker_processing::TaskExecutor;

const FETCH_TIMEOUT: Duration = Duration::from_secs(1);
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
  pub agent_id: String,
  pub project_id: String,
  pub version: String,
  pub task_subject: String,
  pub result_subject: String,
  pub heartbeat_subject: String,
  pub durable: String,
  pub heartbeat_interval: Duration,
  pub capabilities: Vec<String>,
  pub max_steps: u32,
  pub send_screenshots: bool,
}

impl RuntimeSettings {
  pub fn from_config(config: &Config, agent_id: &str, version: &str) -> Self {
    Self {
      agent_id: agent_id.to_string(),
      project_id: config.project_id.clone().unwrap_or_default(),
      version: version.to_string(),
      task_subject: config.task_subject(agent_id),
      result_subject: config.result_subject(agent_id),
      heartbeat_subject: config.heartbeat_subject(agent_id),
      durable: config.durable_name(agent_id),
      heartbeat_interval: config.heartbeat_interval,
      capabilities: config.capabilities(),
      max_steps: config.max_steps,
      send_screenshots: config.send_screenshots,
    }
  }
}

/// Consumes tasks for one worker until cancelled. Owns its broker handle and
/// closes it on the way out.
pub struct TaskRuntime {
  settings: RuntimeSettings,
  broker: Arc<dyn Broker>,
  executor: TaskExecutor,
}

impl TaskRuntime {
  pub fn new(
    settings: RuntimeSettings,
    broker: Arc<dyn Broker>,
    automation: Arc<dyn Automation>,
    credentials: Arc<Credentials>,
  ) -> Self {
    let executor = TaskExecutor::new(
      broker.clone(),
      automation,
      credentials,
      PayloadShrinker::new(settings.send_screenshots),
      settings.agent_id.clone(),
      settings.version.clone(),
      settings.result_subject.clone(),
      settings.max_steps,
    );
    Self { settings, broker, executor }
  }

  pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
    let outcome = self.listen(&shutdown).await;
    close_broker(self.broker.as_ref()).await;
    info!("Agent {}: task runtime stopped", self.settings.agent_id);
    outcome
  }

  async fn listen(&self, shutdown: &CancellationToken) -> Result<()> {
    self.broker.ensure_stream(STREAM_NAME).await.context("ensuring task stream")?;
    let subscription = self
      .broker
      .pull_subscribe(&self.settings.task_subject, &self.settings.durable)
      .await
      .with_context(|| format!("subscribing to {}", self.settings.task_subject))?;

    let _heartbeat = HeartbeatGuard(self.spawn_heartbeat());
    info!("Agent {}: listening on {}", self.settings.agent_id, self.settings.task_subject);
    self.consume(subscription.as_ref(), shutdown).await;
    Ok(())
  }

  async fn consume(&self, subscription: &dyn PullSubscription, shutdown: &CancellationToken) {
    loop {
      let fetched = tokio::select! {
        biased;
        _ = shutdown.cancelled() => break,
        fetched = subscription.fetch(1, FETCH_TIMEOUT) => fetched,
      };
      match fetched {
        Ok(messages) => {
          for message in messages {
            self.handle(message, shutdown).await;
          }
        }
        Err(e) => {
          warn!("Fetch failed: {:?}", e);
          tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = sleep(FETCH_ERROR_BACKOFF) => {}
          }
        }
      }
    }
  }

  async fn handle(&self, message: InboundMessage, shutdown: &CancellationToken) {
    let task = match AgentTask::decode(message.payload.as_slice()) {
      Ok(task) => task,
      Err(e) => {
        error!("Failed to decode task: {:?}", e);
        if let Err(err) = message.ack().await {
          warn!(error = %err, "ack of undecodable task failed");
        }
        return;
      }
    };

    let run_id = task.run_id().to_string();
    let outcome = tokio::select! {
      biased;
      _ = shutdown.cancelled() => None,
      outcome = self.executor.execute(&task) => Some(outcome),
    };
    match outcome {
      None => {
        warn!("Agent {}: run {} interrupted by shutdown", self.settings.agent_id, run_id);
        if let Err(err) = message.nak().await {
          warn!(%run_id, error = %err, "nak failed");
        }
      }
      Some(Ok(status)) => {
        debug!(%run_id, status = status.as_str(), "task complete");
        if let Err(err) = message.ack().await {
          warn!(%run_id, error = %err, "ack failed");
        }
      }
      Some(Err(e)) => {
        error!("Processing failed for run {}: {:?}", run_id, e);
        if let Err(err) = message.nak().await {
          warn!(%run_id, error = %err, "nak failed");
        }
      }
    }
  }

  fn spawn_heartbeat(&self) -> JoinHandle<()> {
    let broker = self.broker.clone();
    let subject = self.settings.heartbeat_subject.clone();
    let every = self.settings.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
    let template = AgentHeartbeat {
      metadata: Some(AgentMetadata {
        agent_id: self.settings.agent_id.clone(),
        project_id: self.settings.project_id.clone(),
        run_id: String::new(),
        agent_version: self.settings.version.clone(),
      }),
      status: "online".into(),
      timestamp: 0,
      capabilities: self.settings.capabilities.clone(),
    };
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let beat = AgentHeartbeat { timestamp: Utc::now().timestamp(), ..template.clone() };
        match broker.publish(&subject, beat.encode_to_vec()).await {
          Ok(()) => debug!(%subject, "heartbeat sent"),
          Err(err) => warn!(%subject, error = %err, "heartbeat publish failed"),
        }
      }
    })
  }
}

/// Stops the heartbeat however the consume loop is left, including when the
/// runtime task itself is aborted.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
  fn drop(&mut self) {
    self.0.abort();
  }
}

/// Drains and closes a broker handle within fixed bounds. Failures are
/// logged only.
pub async fn close_broker(broker: &dyn Broker) {
  match timeout(DRAIN_TIMEOUT, broker.drain()).await {
    Ok(Ok(())) => debug!("broker drained"),
    Ok(Err(err)) => warn!(error = %err, "broker drain failed"),
    Err(_) => warn!("broker drain timed out after {:?}", DRAIN_TIMEOUT),
  }
  match timeout(CLOSE_TIMEOUT, broker.close()).await {
    Ok(Ok(())) => debug!("broker closed"),
    Ok(Err(err)) => warn!(error = %err, "broker close failed"),
    Err(_) => warn!("broker close timed out after {:?}", CLOSE_TIMEOUT),
  }
}
