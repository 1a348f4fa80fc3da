//! Overview (worker identity, status and where to authenticate)
//! Runs (results and steps as they are published)
//! Logs (latest log entries)

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode, KeyEventKind, KeyModifiers},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs, Wrap},
};

use qa_agent::config::{AgentArgs, Config};
use qa_agent::controller::{Controller, Services};
use qa_agent::events::{AgentView, EventLayer, EventReceiver, event_queue};

const TICK_RATE: Duration = Duration::from_millis(250);

#[derive(Clone, Copy)]
enum DashboardTab {
  Overview,
  Runs,
  Logs,
}

struct App {
  current_tab: DashboardTab,
  view: AgentView,
}

impl App {
  fn new(agent_id: &str) -> Self {
    Self { current_tab: DashboardTab::Overview, view: AgentView::new(agent_id) }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Runs,
      DashboardTab::Runs => DashboardTab::Logs,
      DashboardTab::Logs => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Logs,
      DashboardTab::Runs => DashboardTab::Overview,
      DashboardTab::Logs => DashboardTab::Runs,
    }
  }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  let args = AgentArgs::parse();
  let mut config = Config::from_env()?;
  config.apply_args(&args);

  let (events, mut receiver) = event_queue();
  let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry().with(filter).with(EventLayer::new(events.clone())).init();

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

  let shutdown = CancellationToken::new();
  let term_shutdown = shutdown.clone();
  tokio::spawn(async move {
    match signal(SignalKind::terminate()) {
      Ok(mut sigterm) => {
        sigterm.recv().await;
        term_shutdown.cancel();
      }
      Err(e) => warn!("Failed to register SIGTERM handler: {:?}", e),
    }
  });

  let mut app = App::new(&agent_id);
  let controller = tokio::spawn(Controller::new(config, agent_id, version, services, events).run(shutdown.clone()));

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let outcome = run_app(&mut terminal, &mut app, &mut receiver, &shutdown, &controller).await;

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;

  shutdown.cancel();
  let stopped = controller.await.context("controller task failed")?;
  outcome.and(stopped)
}

/// Redraws every tick until `q`, Ctrl-C, SIGTERM or the controller giving up.
async fn run_app<B: Backend>(
  terminal: &mut Terminal<B>,
  app: &mut App,
  receiver: &mut EventReceiver,
  shutdown: &CancellationToken,
  controller: &JoinHandle<Result<()>>,
) -> Result<()> {
  let mut tick = tokio::time::interval(TICK_RATE);
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      _ = tick.tick() => {}
    }
    app.view.apply_all(receiver.drain());
    terminal.draw(|f| ui(f, app))?;

    while event::poll(Duration::ZERO)? {
      let CEvent::Key(key) = event::read()? else {
        continue;
      };
      if key.kind != KeyEventKind::Press {
        continue;
      }
      match key.code {
        KeyCode::Char('q') => return Ok(()),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return Ok(()),
        KeyCode::Right => app.next_tab(),
        KeyCode::Left => app.previous_tab(),
        _ => {}
      }
    }
    if controller.is_finished() {
      return Ok(());
    }
  }
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tab_titles = ["Overview", "Runs", "Logs"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
  .block(Block::default().borders(Borders::ALL).title(format!("QA Agent {}", app.view.agent_id)))
  .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
  .select(match app.current_tab {
    DashboardTab::Overview => 0,
    DashboardTab::Runs => 1,
    DashboardTab::Logs => 2,
  });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, &app.view, chunks[1]),
    DashboardTab::Runs => render_runs(f, &app.view, chunks[1]),
    DashboardTab::Logs => render_logs(f, &app.view, chunks[1]),
  }

  let footer = Paragraph::new("←/→: Switch Tabs | q: Quit")
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn status_color(label: &str) -> Color {
  match label {
    "online" | "running" => Color::Green,
    "offline" | "stopped" => Color::Red,
    _ => Color::Yellow,
  }
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, view: &AgentView, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([Constraint::Length(7), Constraint::Min(0)].as_ref())
    .split(area);

  let status = view.status_label(Utc::now());
  let last_heartbeat = view
    .last_heartbeat
    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| "N/A".into());
  let lines = vec![
    Spans::from(Span::styled(format!("ID: {}", view.agent_id), Style::default().add_modifier(Modifier::BOLD))),
    Spans::from(vec![Span::raw("Status: "), Span::styled(status.clone(), Style::default().fg(status_color(&status)))]),
    Spans::from(Span::raw(format!("Version: {}", view.version.as_deref().unwrap_or("N/A")))),
    Spans::from(Span::raw(format!("Last HB: {}", last_heartbeat))),
  ];
  let summary = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Worker"));
  f.render_widget(summary, chunks[0]);

  let auth = match &view.auth_url {
    Some(url) => Paragraph::new(vec![
      Spans::from(Span::raw("Open this link to authenticate the worker:")),
      Spans::from(Span::styled(url.as_str(), Style::default().fg(Color::Cyan))),
    ]),
    None => Paragraph::new(Span::raw("No authentication required")),
  };
  f.render_widget(
    auth.wrap(Wrap { trim: false }).block(Block::default().borders(Borders::ALL).title("Authentication")),
    chunks[1],
  );
}

fn render_runs<B: Backend>(f: &mut tui::Frame<B>, view: &AgentView, area: Rect) {
  let run_items: Vec<ListItem> = view
    .runs
    .iter()
    .rev()
    .map(|line| ListItem::new(Spans::from(Span::raw(line.as_str()))))
    .collect();
  let runs_list = List::new(if run_items.is_empty() {
    vec![ListItem::new(Spans::from(Span::raw("No runs yet")))]
  } else {
    run_items
  })
  .block(Block::default().borders(Borders::ALL).title("Runs (newest first)"));
  f.render_widget(runs_list, area);
}

fn render_logs<B: Backend>(f: &mut tui::Frame<B>, view: &AgentView, area: Rect) {
  let log_items: Vec<ListItem> = view
    .logs
    .iter()
    .rev()
    .map(|line| {
      let (stamp, message) = line.split_once(' ').unwrap_or(("", line.as_str()));
      ListItem::new(Spans::from(vec![
        Span::styled(stamp, Style::default().fg(Color::Green)),
        Span::raw(" - "),
        Span::raw(message),
      ]))
    })
    .collect();
  let logs_list = List::new(log_items).block(Block::default().borders(Borders::ALL).title("Worker Logs"));
  f.render_widget(logs_list, area);
}
