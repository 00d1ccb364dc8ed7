//! The ambient player's embedded widget: a playlist player that loads out of
//! band and only accepts commands once it has been bound.
//!
//! Binding is a typed handshake: a `WidgetHost` is polled with backoff until
//! it hands back a `Widget`, and only a bound `Widget` exposes commands.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::mpv::{MpvDriver, MpvEvent, MpvHandle};
use scanner_proto::config::AmbientConfig;
use scanner_proto::platform::MpvRole;

/// Lifecycle notifications from the widget.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetEvent {
    /// A playlist finished loading and the widget accepts commands.
    Ready,
    Play,
    Pause,
    /// The current track played to the end.
    Finish,
    /// The current track could not be played.
    Error(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadOptions {
    pub auto_play: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sound {
    pub index: usize,
    pub title: Option<String>,
    pub url: String,
}

impl Sound {
    pub fn display_title(&self) -> String {
        self.title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.url.rsplit('/').next().unwrap_or(&self.url).to_string())
    }
}

/// Command interface of a bound widget.
pub trait Widget {
    /// Swap the loaded playlist in place.  Completion is signalled by a
    /// `WidgetEvent::Ready`.
    fn load(&mut self, url: &str, options: LoadOptions) -> impl Future<Output = anyhow::Result<()>>;
    fn play(&mut self) -> impl Future<Output = anyhow::Result<()>>;
    fn pause(&mut self) -> impl Future<Output = anyhow::Result<()>>;
    fn skip(&mut self, index: usize) -> impl Future<Output = anyhow::Result<()>>;
    /// `level` on the 0–100 UI scale.
    fn set_volume(&mut self, level: u8) -> impl Future<Output = anyhow::Result<()>>;
    fn sounds(&mut self) -> impl Future<Output = anyhow::Result<Vec<Sound>>>;
    fn current_sound(&mut self) -> impl Future<Output = anyhow::Result<Option<Sound>>>;
}

/// Something that eventually produces a bound widget.
pub trait WidgetHost: Send + 'static {
    type Widget: Widget + Send + 'static;

    /// One binding attempt.  `Ok(None)` means "not available yet".
    fn try_bind(&mut self) -> impl Future<Output = anyhow::Result<Option<Self::Widget>>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    #[error("widget did not become available after {attempts} attempts")]
    BindTimeout { attempts: u32 },
}

/// Exponential backoff for the bind handshake.
#[derive(Debug, Clone)]
pub struct BindPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl BindPolicy {
    pub fn from_config(config: &AmbientConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.bind_initial_backoff_ms),
            max: Duration::from_millis(config.bind_max_backoff_ms),
            attempts: config.bind_max_attempts.max(1),
        }
    }

    /// Delay after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

pub async fn bind_with_backoff<H: WidgetHost>(
    host: &mut H,
    policy: &BindPolicy,
) -> Result<H::Widget, WidgetError> {
    for attempt in 0..policy.attempts {
        match host.try_bind().await {
            Ok(Some(widget)) => {
                info!("widget: bound after {} attempt(s)", attempt + 1);
                return Ok(widget);
            }
            Ok(None) => debug!("widget: not available yet (attempt {})", attempt + 1),
            Err(e) => debug!("widget: bind attempt {} failed: {}", attempt + 1, e),
        }
        tokio::time::sleep(policy.delay_for(attempt)).await;
    }
    Err(WidgetError::BindTimeout {
        attempts: policy.attempts,
    })
}

// ── mpv translation ───────────────────────────────────────────────────────────

pub const OBS_PAUSE: u64 = 1;

/// Turns raw mpv notifications into `WidgetEvent`s.  `awaiting_ready` is
/// armed by `load()` so only the first file of a fresh playlist reports
/// `Ready`; later tracks loading are ordinary skips.
pub struct WidgetEventMapper {
    awaiting_ready: Arc<AtomicBool>,
    paused: bool,
}

impl WidgetEventMapper {
    pub fn new(awaiting_ready: Arc<AtomicBool>) -> Self {
        Self {
            awaiting_ready,
            paused: true,
        }
    }

    pub fn map(&mut self, evt: &MpvEvent) -> Option<WidgetEvent> {
        if let Some((id, data)) = evt.as_property_change() {
            if id != OBS_PAUSE {
                return None;
            }
            let paused = data.as_bool().unwrap_or(self.paused);
            if paused == self.paused {
                return None;
            }
            self.paused = paused;
            return Some(if paused {
                WidgetEvent::Pause
            } else {
                WidgetEvent::Play
            });
        }

        match evt.event_name()? {
            "file-loaded" if self.awaiting_ready.swap(false, Ordering::SeqCst) => {
                Some(WidgetEvent::Ready)
            }
            "end-file" => match evt.end_file_reason() {
                Some("eof") => Some(WidgetEvent::Finish),
                Some("error") => Some(WidgetEvent::Error(
                    evt.file_error().unwrap_or("track unavailable").to_string(),
                )),
                _ => None,
            },
            _ => None,
        }
    }
}

// ── mpv-backed widget ─────────────────────────────────────────────────────────

pub struct MpvWidgetHost {
    driver: Option<MpvDriver>,
    spawned: bool,
    events: mpsc::UnboundedSender<WidgetEvent>,
}

impl MpvWidgetHost {
    pub fn new(events: mpsc::UnboundedSender<WidgetEvent>, volume: u8) -> Self {
        let mut driver = MpvDriver::new(MpvRole::Ambient);
        driver.last_volume = volume;
        Self {
            driver: Some(driver),
            spawned: false,
            events,
        }
    }
}

impl WidgetHost for MpvWidgetHost {
    type Widget = MpvWidget;

    async fn try_bind(&mut self) -> anyhow::Result<Option<MpvWidget>> {
        let Some(driver) = self.driver.as_mut() else {
            anyhow::bail!("widget already bound");
        };
        if !self.spawned {
            driver.spawn().await?;
            self.spawned = true;
            return Ok(None);
        }
        if !driver.process_alive() {
            self.spawned = false;
            anyhow::bail!("ambient mpv exited before binding");
        }

        let awaiting_ready = Arc::new(AtomicBool::new(false));
        let (mpv_tx, mut mpv_rx) = mpsc::channel::<MpvEvent>(64);
        let handle = match driver.connect(mpv_tx).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!("widget: IPC not up yet: {}", e);
                return Ok(None);
            }
        };
        handle.ping().await?;
        handle.observe(OBS_PAUSE, "pause").await;

        let events = self.events.clone();
        let mut mapper = WidgetEventMapper::new(awaiting_ready.clone());
        tokio::spawn(async move {
            while let Some(evt) = mpv_rx.recv().await {
                if let Some(widget_evt) = mapper.map(&evt) {
                    debug!("widget: {:?}", widget_evt);
                    if events.send(widget_evt).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(self.driver.take().map(|driver| MpvWidget {
            _driver: driver,
            handle,
            awaiting_ready,
        }))
    }
}

/// Bound ambient player.  Owns its mpv process for the rest of the session.
pub struct MpvWidget {
    _driver: MpvDriver,
    handle: MpvHandle,
    awaiting_ready: Arc<AtomicBool>,
}

impl Widget for MpvWidget {
    async fn load(&mut self, url: &str, options: LoadOptions) -> anyhow::Result<()> {
        self.awaiting_ready.store(true, Ordering::SeqCst);
        self.handle.set_pause(!options.auto_play).await?;
        self.handle.loadfile(url).await
    }

    async fn play(&mut self) -> anyhow::Result<()> {
        self.handle.set_pause(false).await
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        self.handle.set_pause(true).await
    }

    async fn skip(&mut self, index: usize) -> anyhow::Result<()> {
        self.handle.playlist_play_index(index).await
    }

    async fn set_volume(&mut self, level: u8) -> anyhow::Result<()> {
        self.handle.set_volume(level).await
    }

    async fn sounds(&mut self) -> anyhow::Result<Vec<Sound>> {
        let playlist = self.handle.get_property("playlist").await?;
        Ok(parse_playlist(&playlist))
    }

    async fn current_sound(&mut self) -> anyhow::Result<Option<Sound>> {
        let pos = self.handle.get_property("playlist-pos").await?;
        let Some(index) = pos.as_i64().and_then(|p| usize::try_from(p).ok()) else {
            return Ok(None);
        };
        let title = match self.handle.get_property("media-title").await {
            Ok(v) => v.as_str().map(str::to_string),
            Err(e) => {
                warn!("widget: media-title unavailable: {}", e);
                None
            }
        };
        let playlist = self.handle.get_property("playlist").await?;
        Ok(sound_at(&playlist, index).map(|sound| Sound {
            title: title.or(sound.title),
            ..sound
        }))
    }
}

/// Entry at mpv playlist position `index`; entries without a filename are
/// left out of `parse_playlist`, so positions are matched, not counted.
fn sound_at(playlist: &Value, index: usize) -> Option<Sound> {
    parse_playlist(playlist)
        .into_iter()
        .find(|sound| sound.index == index)
}

fn parse_playlist(value: &Value) -> Vec<Sound> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| {
                    let url = entry.get("filename")?.as_str()?.to_string();
                    let title = entry
                        .get("title")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    Some(Sound { index, title, url })
                })
                .collect()
        })
        .unwrap_or_default()
}
