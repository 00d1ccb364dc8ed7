mod ambient;
mod audio;
mod core;
mod http;
mod mpv;
mod scanner;
mod socket;
mod timer;
mod widget;

use std::sync::Arc;

use scanner_proto::calls::CallsClient;
use scanner_proto::config::Config;
use scanner_proto::state::{load_feeds, StateManager};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::ambient::AmbientController;
use crate::audio::MpvAudio;
use crate::core::{CoreChannels, DaemonCore, DaemonEvent};
use crate::scanner::ScannerController;
use crate::timer::Scheduler;
use crate::widget::MpvWidgetHost;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Log(String),
    /// A client command was rejected.
    Error(String),
}

/// Forwards WARN and ERROR lines to connected clients.
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut MessageVisitor(&mut message));

        // No receivers is fine.
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    // Config comes first: it names the log file.
    let config = Config::load()?;

    let log_path = config.daemon.log_file.clone();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,scanner_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);
    info!("Config loaded from: {:?}", Config::config_path());

    let feeds = load_feeds(&config)?;
    let modes: Vec<String> = config.modes.keys().cloned().collect();
    let state_manager = Arc::new(StateManager::new(feeds.clone(), modes));

    // Every input into the core has its own channel.
    let (event_tx, event_rx) = mpsc::channel::<DaemonEvent>(256);
    let (scanner_sched, scanner_rx) = Scheduler::channel();
    let (ambient_sched, ambient_rx) = Scheduler::channel();
    let (audio_tx, audio_rx) = mpsc::unbounded_channel();
    let (widget_tx, widget_rx) = mpsc::unbounded_channel();

    let mut scanner = ScannerController::new(
        config.scanner.clone(),
        feeds,
        MpvAudio::new(audio_tx),
        CallsClient::new(&config.scanner)?,
        scanner_sched,
    );
    scanner.set_volume(config.scanner.default_volume).await;

    let mut ambient = AmbientController::new(
        config.ambient.clone(),
        config.modes.clone(),
        ambient_sched,
    );
    ambient.boot(MpvWidgetHost::new(widget_tx, config.ambient.default_volume));

    let daemon_core = DaemonCore::new(scanner, ambient, state_manager.clone(), broadcast_tx.clone());

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        scanner_proto::platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx.clone(),
        );
    }

    let signal_tx = event_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = signal_tx.send(DaemonEvent::Shutdown).await;
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    info!("Daemon initialised, running event loop");
    daemon_core
        .run(CoreChannels {
            events: event_rx,
            scanner: scanner_rx,
            ambient: ambient_rx,
            audio: audio_rx,
            widget: widget_rx,
        })
        .await
}
