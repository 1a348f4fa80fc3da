//! Queue client seam.
//!
//! Everything above this module talks to a [`Broker`]: publish, durable pull
//! subscriptions with explicit ack/nak, fire-and-forget push subscriptions,
//! and a bounded shutdown. [`amqp`] is the production binding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod amqp;
pub mod auth;
#[cfg(test)]
pub mod memory;

pub use auth::ConnectIdentity;

pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("payload of {size} bytes exceeds the {limit} byte limit")]
  MaxPayload { size: usize, limit: usize },
  #[error(transparent)]
  Amqp(#[from] lapin::Error),
  #[error("{0}")]
  Other(String),
}

impl TransportError {
  pub fn is_max_payload(&self) -> bool {
    matches!(self, TransportError::MaxPayload { .. })
  }
}

#[derive(Debug, Error)]
pub enum ConnectError {
  #[error("connecting to {url} failed: {reason}")]
  Failed { url: String, reason: String },
  #[error("connecting to {url} timed out after {after:?}")]
  Timeout { url: String, after: Duration },
}

pub fn check_payload(size: usize, limit: usize) -> Result<(), TransportError> {
  if size > limit {
    return Err(TransportError::MaxPayload { size, limit });
  }
  Ok(())
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
  async fn ack(&self) -> Result<(), TransportError>;
  /// Negative acknowledgement; the queue redelivers the message.
  async fn nak(&self) -> Result<(), TransportError>;
}

/// A message fetched from a durable pull subscription.
pub struct InboundMessage {
  pub subject: String,
  pub payload: Vec<u8>,
  acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
  pub fn new(subject: impl Into<String>, payload: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
    Self { subject: subject.into(), payload, acker }
  }

  pub async fn ack(&self) -> Result<(), TransportError> {
    self.acker.ack().await
  }

  pub async fn nak(&self) -> Result<(), TransportError> {
    self.acker.nak().await
  }
}

impl std::fmt::Debug for InboundMessage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InboundMessage").field("subject", &self.subject).field("len", &self.payload.len()).finish()
  }
}

#[async_trait]
pub trait PullSubscription: Send + Sync {
  /// Waits up to `timeout` for `batch` messages. A timeout yields whatever
  /// arrived so far, possibly nothing.
  async fn fetch(&self, batch: usize, timeout: Duration) -> Result<Vec<InboundMessage>, TransportError>;
}

/// Payloads delivered to a push subscription, in arrival order.
pub struct PushSubscription {
  receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl PushSubscription {
  pub fn new(receiver: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
    Self { receiver }
  }

  /// `None` once the subscription is torn down.
  pub async fn next(&mut self) -> Option<Vec<u8>> {
    self.receiver.recv().await
  }
}

#[async_trait]
pub trait Broker: Send + Sync {
  /// Creates the durable stream if absent; an existing stream is fine.
  async fn ensure_stream(&self, stream: &str) -> Result<(), TransportError>;
  async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError>;
  async fn pull_subscribe(&self, subject: &str, durable: &str) -> Result<Box<dyn PullSubscription>, TransportError>;
  async fn subscribe(&self, subject: &str) -> Result<PushSubscription, TransportError>;
  /// Stops push deliveries and flushes what is in flight.
  async fn drain(&self) -> Result<(), TransportError>;
  async fn close(&self) -> Result<(), TransportError>;
  fn max_payload(&self) -> usize;
}

#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self, identity: Option<ConnectIdentity>) -> Result<Arc<dyn Broker>, ConnectError>;
}
