/// DaemonCore: single-owner event loop for both players.
///
/// Owns the scanner and ambient controllers exclusively.  Client commands,
/// controller timers, audio transport events and widget events all arrive on
/// their own channels and are handled one at a time.  After every event the
/// controllers' views are published to the `StateManager`; a real change
/// bumps the revision and broadcasts `BroadcastMessage::StateUpdated`.
use std::sync::Arc;

use scanner_proto::calls::CallSource;
use scanner_proto::protocol::Command;
use scanner_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::ambient::{AmbientController, AmbientEvent};
use crate::audio::{AudioNotice, AudioOutput};
use crate::scanner::{ScannerController, ScannerEvent};
use crate::widget::{Widget, WidgetEvent};
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// External inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    Shutdown,
}

/// Receiving ends of every channel the core listens on.
pub struct CoreChannels<W> {
    pub events: mpsc::Receiver<DaemonEvent>,
    pub scanner: mpsc::UnboundedReceiver<ScannerEvent>,
    pub ambient: mpsc::UnboundedReceiver<AmbientEvent<W>>,
    pub audio: mpsc::UnboundedReceiver<AudioNotice>,
    pub widget: mpsc::UnboundedReceiver<WidgetEvent>,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore<A, C, W> {
    scanner: ScannerController<A, C>,
    ambient: AmbientController<W>,
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl<A, C, W> DaemonCore<A, C, W>
where
    A: AudioOutput,
    C: CallSource,
    W: Widget + Send + 'static,
{
    pub fn new(
        scanner: ScannerController<A, C>,
        ambient: AmbientController<W>,
        state_manager: Arc<StateManager>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self {
            scanner,
            ambient,
            state_manager,
            broadcast_tx,
        }
    }

    #[cfg(test)]
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run until a `Shutdown` event arrives or every client-facing sender is
    /// gone.
    pub async fn run(mut self, mut channels: CoreChannels<W>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        self.publish().await;

        loop {
            tokio::select! {
                evt = channels.events.recv() => match evt {
                    None => {
                        info!("DaemonCore: event channel closed, shutting down");
                        break;
                    }
                    Some(DaemonEvent::Shutdown) => {
                        info!("DaemonCore: shutdown requested");
                        break;
                    }
                    Some(DaemonEvent::ClientCommand(cmd)) => self.dispatch(cmd).await,
                },
                Some(evt) = channels.scanner.recv() => self.scanner.handle_event(evt).await,
                Some(evt) = channels.audio.recv() => {
                    debug!("DaemonCore: audio {:?}", evt);
                    self.scanner.handle_audio_event(evt).await
                }
                Some(evt) = channels.ambient.recv() => self.ambient.handle_event(evt).await,
                Some(evt) = channels.widget.recv() => {
                    debug!("DaemonCore: widget {:?}", evt);
                    self.ambient.handle_widget_event(evt).await
                }
            }
            self.publish().await;
        }

        Ok(())
    }

    async fn dispatch(&mut self, cmd: Command) {
        info!("DaemonCore: command {:?}", cmd);
        if let Err(e) = self.handle_command(cmd).await {
            error!("DaemonCore: command error: {}", e);
            let _ = self
                .broadcast_tx
                .send(BroadcastMessage::Error(e.to_string()));
        }
    }

    pub async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::SelectFeed { index } => self.scanner.select_feed(index).await?,
            Command::TogglePlayback => self.scanner.toggle_playback().await,
            Command::ScannerVolume { value } => self.scanner.set_volume(value).await,
            Command::SwitchMode { mode } => self.ambient.switch_mode(&mode).await?,
            Command::AmbientToggle => self.ambient.toggle().await,
            Command::AmbientNext => self.ambient.next().await,
            Command::AmbientPrev => self.ambient.prev().await,
            Command::AmbientVolume { value } => self.ambient.set_volume(value).await,
            // Read-only: the socket answers every command with a snapshot.
            Command::GetState => {}
        }
        Ok(())
    }

    /// Push both views to the shared state; broadcast when anything changed.
    pub async fn publish(&self) {
        if self
            .state_manager
            .publish(self.scanner.view(), self.ambient.view())
            .await
        {
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SourceId;
    use crate::timer::Scheduler;
    use crate::widget::{LoadOptions, Sound};
    use chrono::{DateTime, Utc};
    use scanner_proto::calls::CallsError;
    use scanner_proto::config::Config;
    use scanner_proto::protocol::{CallRecord, FeedDescriptor, FeedKind};

    struct NullAudio;

    impl AudioOutput for NullAudio {
        async fn set_source(&mut self, _url: &str) -> anyhow::Result<SourceId> {
            Ok(SourceId::default())
        }
        async fn play(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn pause(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn clear_source(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn set_volume(&mut self, _level: u8) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone)]
    struct NoCalls;

    impl CallSource for NoCalls {
        async fn fetch_newer(
            &self,
            _system_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<CallRecord>, CallsError> {
            Ok(Vec::new())
        }
    }

    struct NullWidget;

    impl Widget for NullWidget {
        async fn load(&mut self, _url: &str, _options: LoadOptions) -> anyhow::Result<()> {
            Ok(())
        }
        async fn play(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn pause(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn skip(&mut self, _index: usize) -> anyhow::Result<()> {
            Ok(())
        }
        async fn set_volume(&mut self, _level: u8) -> anyhow::Result<()> {
            Ok(())
        }
        async fn sounds(&mut self) -> anyhow::Result<Vec<Sound>> {
            Ok(Vec::new())
        }
        async fn current_sound(&mut self) -> anyhow::Result<Option<Sound>> {
            Ok(None)
        }
    }

    fn test_core() -> (
        DaemonCore<NullAudio, NoCalls, NullWidget>,
        broadcast::Receiver<BroadcastMessage>,
    ) {
        let config = Config::default();
        let feeds = vec![FeedDescriptor {
            city: "Boston".into(),
            state: "MA".into(),
            description: "Boston police".into(),
            kind: FeedKind::DirectStream {
                url: "https://stream.test/boston".into(),
            },
        }];
        let modes: Vec<String> = config.modes.keys().cloned().collect();
        let (scanner_sched, _scanner_rx) = Scheduler::channel();
        let (ambient_sched, _ambient_rx) = Scheduler::channel();
        let scanner = ScannerController::new(
            config.scanner.clone(),
            feeds.clone(),
            NullAudio,
            NoCalls,
            scanner_sched,
        );
        let ambient = AmbientController::new(config.ambient.clone(), config.modes.clone(), ambient_sched);
        let (broadcast_tx, broadcast_rx) = broadcast::channel(16);
        let state_manager = Arc::new(StateManager::new(feeds, modes));
        (
            DaemonCore::new(scanner, ambient, state_manager, broadcast_tx),
            broadcast_rx,
        )
    }

    #[tokio::test]
    async fn test_command_publishes_new_state() {
        let (mut core, mut rx) = test_core();
        core.publish().await;
        let _ = rx.try_recv();
        let rev = core.state_manager().get_state().await.rev;

        core.handle_command(Command::SelectFeed { index: 0 })
            .await
            .unwrap();
        core.publish().await;

        let state = core.state_manager().get_state().await;
        assert!(state.rev > rev);
        assert_eq!(state.scanner.current_feed, Some(0));
        assert!(state.scanner.is_playing);
        assert!(matches!(rx.try_recv(), Ok(BroadcastMessage::StateUpdated)));

        // Nothing changed: no new revision, no broadcast.
        core.publish().await;
        assert_eq!(core.state_manager().get_state().await.rev, state.rev);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_command_broadcasts_error() {
        let (mut core, mut rx) = test_core();
        core.dispatch(Command::SelectFeed { index: 42 }).await;
        core.dispatch(Command::SwitchMode {
            mode: "polka".into(),
        })
        .await;

        match rx.try_recv() {
            Ok(BroadcastMessage::Error(message)) => assert!(message.contains("42")),
            other => panic!("expected error broadcast, got {:?}", other),
        }
        match rx.try_recv() {
            Ok(BroadcastMessage::Error(message)) => assert!(message.contains("polka")),
            other => panic!("expected error broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (core, _rx) = test_core();
        let (event_tx, events) = mpsc::channel(8);
        let (_scanner_tx, scanner) = mpsc::unbounded_channel();
        let (_ambient_tx, ambient) = mpsc::unbounded_channel();
        let (_audio_tx, audio) = mpsc::unbounded_channel();
        let (_widget_tx, widget) = mpsc::unbounded_channel();
        let state = core.state_manager();

        event_tx
            .send(DaemonEvent::ClientCommand(Command::ScannerVolume { value: 12 }))
            .await
            .unwrap();
        event_tx.send(DaemonEvent::Shutdown).await.unwrap();

        core.run(CoreChannels {
            events,
            scanner,
            ambient,
            audio,
            widget,
        })
        .await
        .unwrap();
        assert_eq!(state.get_state().await.scanner.volume, 12);
    }
}
