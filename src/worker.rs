use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use qa_agent::config::{AgentArgs, Config};
use qa_agent::controller::{Controller, Services};
use qa_agent::events::{EventKind, EventReceiver, event_queue};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  let args = AgentArgs::parse();
  let mut config = Config::from_env()?;
  config.apply_args(&args);

  let filter = EnvFilter::try_new(format!("{},lapin=warn,amq_protocol=warn", config.log_level))
    .unwrap_or_else(|_| EnvFilter::new("info,lapin=warn,amq_protocol=warn"));
  tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

  let services = Services::from_config(&config).await?;
  let agent_id = services.resolve_agent_id(&config).await.context("resolving worker id")?;
  let version = env!("CARGO_PKG_VERSION");
  if let Err(e) = services.credentials.record_version(version).await {
    warn!("Could not record worker version: {}", e);
  }
  if args.logout {
    services.credentials.clear_core_token(&agent_id).await?;
    services.credentials.clear_nats_jwt().await?;
    info!("Agent {}: cached credentials cleared", agent_id);
  }

  let (events, receiver) = event_queue();
  tokio::spawn(print_prompts(receiver));

  let shutdown = CancellationToken::new();
  let signal_shutdown = shutdown.clone();
  tokio::spawn(async move {
    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
      (Ok(term), Ok(int)) => (term, int),
      (Err(e), _) | (_, Err(e)) => {
        error!("Failed to register signal handlers: {:?}", e);
        return;
      }
    };
    tokio::select! {
      _ = sigterm.recv() => info!("Received SIGTERM"),
      _ = sigint.recv() => info!("Received SIGINT"),
    }
    signal_shutdown.cancel();
  });

  info!("Agent {}: worker {} starting against {}", agent_id, version, config.broker_url);
  Controller::new(config, agent_id, version, services, events).run(shutdown).await
}

/// The headless worker has no screen; authentication prompts go to stdout
/// so an operator can follow the link.
async fn print_prompts(mut receiver: EventReceiver) {
  while let Some(event) = receiver.recv().await {
    if let EventKind::AuthRequired { url } = event.kind {
      println!("Authenticate this worker at: {url}");
    }
  }
}
