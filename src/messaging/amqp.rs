use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
  BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
  ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

use super::auth::ChallengeProof;
use super::{
  Acknowledger, Broker, ConnectError, ConnectIdentity, Connector, InboundMessage, PullSubscription, PushSubscription,
  TransportError, check_payload,
};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_POLL: Duration = Duration::from_millis(100);
const PERSISTENT: u8 = 2;

#[derive(Debug, Clone)]
pub struct AmqpConnector {
  url: String,
  exchange: String,
  max_payload: usize,
  allow_unauthenticated_fallback: bool,
}

impl AmqpConnector {
  pub fn new(url: impl Into<String>, exchange: impl Into<String>, max_payload: usize) -> Self {
    Self { url: url.into(), exchange: exchange.into(), max_payload, allow_unauthenticated_fallback: true }
  }

  pub fn with_unauthenticated_fallback(mut self, allow: bool) -> Self {
    self.allow_unauthenticated_fallback = allow;
    self
  }

  fn failed(&self, reason: impl ToString) -> ConnectError {
    ConnectError::Failed { url: self.url.clone(), reason: reason.to_string() }
  }

  async fn open(&self, uri: AMQPUri, properties: ConnectionProperties) -> Result<AmqpBroker, ConnectError> {
    let attempt = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
      Connection::connect_uri(uri.clone(), properties.clone())
    });
    let connection = match timeout(CONNECT_TIMEOUT, attempt).await {
      Ok(Ok(connection)) => connection,
      Ok(Err(err)) => return Err(self.failed(err)),
      Err(_) => return Err(ConnectError::Timeout { url: self.url.clone(), after: CONNECT_TIMEOUT }),
    };
    let channel = connection.create_channel().await.map_err(|err| self.failed(err))?;
    info!(exchange = %self.exchange, "broker channel created");
    Ok(AmqpBroker {
      connection,
      channel,
      exchange: self.exchange.clone(),
      max_payload: self.max_payload,
      consumers: Mutex::new(Vec::new()),
    })
  }

  async fn connect_authenticated(&self, identity: &ConnectIdentity) -> Result<AmqpBroker, ConnectError> {
    let mut uri: AMQPUri = self.url.parse().map_err(|err: String| self.failed(err))?;
    uri.authority.userinfo.username = identity.user.clone();
    uri.authority.userinfo.password = identity.jwt.clone();

    let proof = ChallengeProof::new(identity.signer.as_ref());
    let mut properties = ConnectionProperties::default();
    for (key, value) in [("nonce", proof.nonce), ("public_key", proof.public_key), ("signature", proof.signature)] {
      properties.client_properties.insert(ShortString::from(key), AMQPValue::LongString(LongString::from(value)));
    }
    self.open(uri, properties).await
  }

  async fn connect_plain(&self) -> Result<AmqpBroker, ConnectError> {
    let uri: AMQPUri = self.url.parse().map_err(|err: String| self.failed(err))?;
    self.open(uri, ConnectionProperties::default()).await
  }
}

#[async_trait]
impl Connector for AmqpConnector {
  async fn connect(&self, identity: Option<ConnectIdentity>) -> Result<Arc<dyn Broker>, ConnectError> {
    let Some(identity) = identity else {
      return Ok(Arc::new(self.connect_plain().await?));
    };
    match self.connect_authenticated(&identity).await {
      Ok(broker) => {
        info!(user = %identity.user, "connected with queue credentials");
        Ok(Arc::new(broker))
      }
      Err(err) if self.allow_unauthenticated_fallback => {
        warn!(error = %err, "authenticated connect failed, retrying without credentials");
        Ok(Arc::new(self.connect_plain().await?))
      }
      Err(err) => Err(err),
    }
  }
}

pub struct AmqpBroker {
  connection: Connection,
  channel: Channel,
  exchange: String,
  max_payload: usize,
  consumers: Mutex<Vec<ShortString>>,
}

impl AmqpBroker {
  async fn declare_exchange(&self, name: &str) -> Result<(), lapin::Error> {
    let options = ExchangeDeclareOptions { durable: true, ..Default::default() };
    self.channel.exchange_declare(name, ExchangeKind::Topic, options, FieldTable::default()).await
  }
}

#[async_trait]
impl Broker for AmqpBroker {
  async fn ensure_stream(&self, stream: &str) -> Result<(), TransportError> {
    // A failed passive declare closes the channel it ran on.
    let probe = self.connection.create_channel().await?;
    let options = ExchangeDeclareOptions { passive: true, ..Default::default() };
    if probe.exchange_declare(stream, ExchangeKind::Topic, options, FieldTable::default()).await.is_ok() {
      if let Err(err) = probe.close(200, "probe done").await {
        debug!(error = %err, "closing probe channel failed");
      }
      debug!(%stream, "stream already present");
      return Ok(());
    }
    self.declare_exchange(stream).await?;
    info!(%stream, "stream created");
    Ok(())
  }

  async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
    check_payload(payload.len(), self.max_payload)?;
    self
      .channel
      .basic_publish(
        &self.exchange,
        subject,
        BasicPublishOptions::default(),
        &payload,
        BasicProperties::default().with_delivery_mode(PERSISTENT),
      )
      .await?;
    Ok(())
  }

  async fn pull_subscribe(&self, subject: &str, durable: &str) -> Result<Box<dyn PullSubscription>, TransportError> {
    let options = QueueDeclareOptions { durable: true, ..Default::default() };
    self.channel.queue_declare(durable, options, FieldTable::default()).await?;
    self
      .channel
      .queue_bind(durable, &self.exchange, subject, QueueBindOptions::default(), FieldTable::default())
      .await?;
    info!(%subject, %durable, "durable pull subscription ready");
    Ok(Box::new(AmqpPull { channel: self.channel.clone(), queue: durable.to_string() }))
  }

  async fn subscribe(&self, subject: &str) -> Result<PushSubscription, TransportError> {
    self.declare_exchange(&self.exchange).await?;
    let options = QueueDeclareOptions { exclusive: true, auto_delete: true, ..Default::default() };
    let queue = self.channel.queue_declare("", options, FieldTable::default()).await?;
    let queue_name = queue.name().as_str().to_string();
    self
      .channel
      .queue_bind(&queue_name, &self.exchange, subject, QueueBindOptions::default(), FieldTable::default())
      .await?;
    let options = BasicConsumeOptions { no_ack: true, ..Default::default() };
    let mut consumer = self.channel.basic_consume(&queue_name, "", options, FieldTable::default()).await?;
    if let Ok(mut tags) = self.consumers.lock() {
      tags.push(consumer.tag());
    }

    let (sender, receiver) = mpsc::unbounded_channel();
    let subject = subject.to_string();
    tokio::spawn(async move {
      while let Some(delivery) = consumer.next().await {
        match delivery {
          Ok(delivery) => {
            if sender.send(delivery.data).is_err() {
              break;
            }
          }
          Err(e) => {
            warn!(%subject, "push consumer error: {:?}", e);
            break;
          }
        }
      }
      debug!(%subject, "push consumer finished");
    });
    Ok(PushSubscription::new(receiver))
  }

  async fn drain(&self) -> Result<(), TransportError> {
    let tags = self.consumers.lock().map(|mut tags| std::mem::take(&mut *tags)).unwrap_or_default();
    for tag in tags {
      self.channel.basic_cancel(tag.as_str(), BasicCancelOptions::default()).await?;
    }
    self.channel.close(200, "drain").await?;
    Ok(())
  }

  async fn close(&self) -> Result<(), TransportError> {
    self.connection.close(200, "shutdown").await?;
    Ok(())
  }

  fn max_payload(&self) -> usize {
    self.max_payload
  }
}

struct AmqpPull {
  channel: Channel,
  queue: String,
}

#[async_trait]
impl PullSubscription for AmqpPull {
  async fn fetch(&self, batch: usize, timeout: Duration) -> Result<Vec<InboundMessage>, TransportError> {
    let deadline = Instant::now() + timeout;
    let mut messages = Vec::with_capacity(batch);
    while messages.len() < batch {
      match self.channel.basic_get(&self.queue, BasicGetOptions { no_ack: false }).await? {
        Some(message) => messages.push(inbound(message.delivery)),
        None => {
          if Instant::now() + FETCH_POLL > deadline {
            break;
          }
          sleep(FETCH_POLL).await;
        }
      }
    }
    Ok(messages)
  }
}

fn inbound(delivery: Delivery) -> InboundMessage {
  InboundMessage::new(delivery.routing_key.as_str(), delivery.data, Box::new(DeliveryAcker(delivery.acker)))
}

struct DeliveryAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for DeliveryAcker {
  async fn ack(&self) -> Result<(), TransportError> {
    self.0.ack(BasicAckOptions::default()).await?;
    Ok(())
  }

  async fn nak(&self) -> Result<(), TransportError> {
    self.0.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connector_defaults_to_allowing_fallback() {
    let connector = AmqpConnector::new("amqp://127.0.0.1:5672/%2f", "AGENTS", 1024);
    assert!(connector.allow_unauthenticated_fallback);
    assert!(!connector.with_unauthenticated_fallback(false).allow_unauthenticated_fallback);
  }

  #[tokio::test]
  async fn malformed_url_is_a_connect_error() {
    let connector = AmqpConnector::new("not a url", "AGENTS", 1024);
    let err = connector.connect(None).await.err().unwrap();
    assert!(matches!(err, ConnectError::Failed { .. }));
  }
}
