//! In-process broker used by the runtime, executor and controller tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

use super::{
  Acknowledger, Broker, ConnectError, ConnectIdentity, Connector, DEFAULT_MAX_PAYLOAD, InboundMessage,
  PullSubscription, PushSubscription, TransportError, check_payload,
};

#[derive(Default)]
pub struct HubState {
  pub published: Vec<(String, Vec<u8>)>,
  pub streams: Vec<String>,
  pub durables: Vec<String>,
  pub acked: Vec<Vec<u8>>,
  pub naked: Vec<Vec<u8>>,
  pub connects: Vec<Option<String>>,
  pub drains: usize,
  pub closes: usize,
  pub failing_connects: usize,
  pub failing_publishes: usize,
  pub failing_subjects: Vec<String>,
  pending: HashMap<String, VecDeque<Vec<u8>>>,
  subscribers: Vec<(String, mpsc::UnboundedSender<Vec<u8>>)>,
}

#[derive(Default)]
pub struct MemoryHub {
  state: Mutex<HubState>,
}

impl MemoryHub {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn state(&self) -> MutexGuard<'_, HubState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Queues a message for pull subscribers of `subject`.
  pub fn enqueue(&self, subject: &str, payload: Vec<u8>) {
    self.state().pending.entry(subject.to_string()).or_default().push_back(payload);
  }

  /// Delivers to push subscribers only, as an out-of-band publisher would.
  pub fn push(&self, subject: &str, payload: Vec<u8>) {
    let mut state = self.state();
    state.subscribers.retain(|(_, sender)| !sender.is_closed());
    for (pattern, sender) in &state.subscribers {
      if subject_matches(pattern, subject) {
        let _ = sender.send(payload.clone());
      }
    }
  }

  pub fn published_on(&self, subject: &str) -> Vec<Vec<u8>> {
    self.state().published.iter().filter(|(s, _)| s == subject).map(|(_, p)| p.clone()).collect()
  }

  pub fn subscriber_count(&self, subject: &str) -> usize {
    self.state().subscribers.iter().filter(|(s, sender)| s == subject && !sender.is_closed()).count()
  }

  pub fn fail_next_connects(&self, count: usize) {
    self.state().failing_connects = count;
  }

  pub fn fail_next_publishes(&self, count: usize) {
    self.state().failing_publishes = count;
  }

  /// Every publish on `subject` fails from now on.
  pub fn fail_subject(&self, subject: &str) {
    self.state().failing_subjects.push(subject.to_string());
  }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
  match pattern.strip_suffix('>') {
    Some(prefix) => subject.starts_with(prefix),
    None => pattern == subject,
  }
}

/// Polls `check` until it holds or five (possibly virtual) seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + Duration::from_secs(5);
  while Instant::now() < deadline {
    if check() {
      return true;
    }
    sleep(Duration::from_millis(10)).await;
  }
  check()
}

pub struct MemoryConnector {
  hub: Arc<MemoryHub>,
}

impl MemoryConnector {
  pub fn new(hub: Arc<MemoryHub>) -> Self {
    Self { hub }
  }
}

#[async_trait]
impl Connector for MemoryConnector {
  async fn connect(&self, identity: Option<ConnectIdentity>) -> Result<Arc<dyn Broker>, ConnectError> {
    let mut state = self.hub.state();
    if state.failing_connects > 0 {
      state.failing_connects -= 1;
      return Err(ConnectError::Failed { url: "memory://".into(), reason: "injected failure".into() });
    }
    state.connects.push(identity.map(|id| id.user));
    Ok(Arc::new(MemoryBroker { hub: self.hub.clone(), max_payload: DEFAULT_MAX_PAYLOAD }))
  }
}

pub struct MemoryBroker {
  hub: Arc<MemoryHub>,
  max_payload: usize,
}

impl MemoryBroker {
  pub fn new(hub: Arc<MemoryHub>, max_payload: usize) -> Self {
    Self { hub, max_payload }
  }
}

#[async_trait]
impl Broker for MemoryBroker {
  async fn ensure_stream(&self, stream: &str) -> Result<(), TransportError> {
    let mut state = self.hub.state();
    if !state.streams.iter().any(|s| s == stream) {
      state.streams.push(stream.to_string());
    }
    Ok(())
  }

  async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
    check_payload(payload.len(), self.max_payload)?;
    {
      let mut state = self.hub.state();
      if state.failing_subjects.iter().any(|s| s == subject) {
        return Err(TransportError::Other(format!("injected failure on {subject}")));
      }
      if state.failing_publishes > 0 {
        state.failing_publishes -= 1;
        return Err(TransportError::Other("injected publish failure".into()));
      }
      state.published.push((subject.to_string(), payload.clone()));
    }
    self.hub.push(subject, payload);
    Ok(())
  }

  async fn pull_subscribe(&self, subject: &str, durable: &str) -> Result<Box<dyn PullSubscription>, TransportError> {
    self.hub.state().durables.push(durable.to_string());
    Ok(Box::new(MemoryPull { hub: self.hub.clone(), subject: subject.to_string() }))
  }

  async fn subscribe(&self, subject: &str) -> Result<PushSubscription, TransportError> {
    let (sender, receiver) = mpsc::unbounded_channel();
    self.hub.state().subscribers.push((subject.to_string(), sender));
    Ok(PushSubscription::new(receiver))
  }

  async fn drain(&self) -> Result<(), TransportError> {
    self.hub.state().drains += 1;
    Ok(())
  }

  async fn close(&self) -> Result<(), TransportError> {
    self.hub.state().closes += 1;
    Ok(())
  }

  fn max_payload(&self) -> usize {
    self.max_payload
  }
}

struct MemoryPull {
  hub: Arc<MemoryHub>,
  subject: String,
}

#[async_trait]
impl PullSubscription for MemoryPull {
  async fn fetch(&self, batch: usize, timeout: Duration) -> Result<Vec<InboundMessage>, TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
      let drained: Vec<Vec<u8>> = {
        let mut state = self.hub.state();
        let queue = state.pending.entry(self.subject.clone()).or_default();
        let take = batch.min(queue.len());
        queue.drain(..take).collect()
      };
      if !drained.is_empty() || Instant::now() >= deadline {
        return Ok(
          drained
            .into_iter()
            .map(|payload| {
              let acker = MemoryAcker { hub: self.hub.clone(), payload: payload.clone() };
              InboundMessage::new(self.subject.clone(), payload, Box::new(acker))
            })
            .collect(),
        );
      }
      sleep(Duration::from_millis(10).min(deadline - Instant::now())).await;
    }
  }
}

/// Records acknowledgements. Naked messages are not redelivered.
struct MemoryAcker {
  hub: Arc<MemoryHub>,
  payload: Vec<u8>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
  async fn ack(&self) -> Result<(), TransportError> {
    self.hub.state().acked.push(self.payload.clone());
    Ok(())
  }

  async fn nak(&self) -> Result<(), TransportError> {
    self.hub.state().naked.push(self.payload.clone());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn fetch_times_out_empty_then_delivers() {
    let hub = MemoryHub::new();
    let broker = MemoryConnector::new(hub.clone()).connect(None).await.unwrap();
    let sub = broker.pull_subscribe("agents.a.tasks", "agent-a").await.unwrap();
    assert!(sub.fetch(1, Duration::from_secs(1)).await.unwrap().is_empty());

    hub.enqueue("agents.a.tasks", b"one".to_vec());
    let messages = sub.fetch(1, Duration::from_secs(1)).await.unwrap();
    assert_eq!(messages.len(), 1);
    messages[0].ack().await.unwrap();
    assert_eq!(hub.state().acked, vec![b"one".to_vec()]);
  }

  #[tokio::test]
  async fn publish_reaches_wildcard_subscribers() {
    let hub = MemoryHub::new();
    let broker = MemoryBroker::new(hub.clone(), 8);
    let mut sub = broker.subscribe("agents.a.>").await.unwrap();
    broker.publish("agents.a.results", b"r".to_vec()).await.unwrap();
    assert_eq!(sub.next().await, Some(b"r".to_vec()));
    assert!(broker.publish("agents.a.results", vec![0; 9]).await.unwrap_err().is_max_payload());
  }
}
