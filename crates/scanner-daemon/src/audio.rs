//! The scanner's audio output: one player, one source at a time.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::mpv::{MpvDriver, MpvEvent, MpvHandle};
use scanner_proto::platform::MpvRole;

/// Transport notifications from the audio output.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// Audio is flowing.
    Playing,
    /// Stalled waiting for data.
    Waiting,
    Paused,
    /// The source reached its end.
    Ended,
    Error(String),
}

/// One `set_source` call.  Every event names the source it was raised for,
/// so notifications about a replaced source can be told apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u64);

/// An `AudioEvent` stamped with the source it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioNotice {
    pub source: SourceId,
    pub event: AudioEvent,
}

/// Command side of the audio output.  Mirrors a media element: attach a
/// source, then play; everything else arrives later as `AudioNotice`s.
pub trait AudioOutput {
    /// Attach and load `url`, paused.  Later notices about this source carry
    /// the returned id.
    fn set_source(&mut self, url: &str) -> impl Future<Output = anyhow::Result<SourceId>>;
    fn play(&mut self) -> impl Future<Output = anyhow::Result<()>>;
    fn pause(&mut self) -> impl Future<Output = anyhow::Result<()>>;
    /// Detach the current source entirely.
    fn clear_source(&mut self) -> impl Future<Output = anyhow::Result<()>>;
    /// `level` on the 0–100 UI scale.
    fn set_volume(&mut self, level: u8) -> impl Future<Output = anyhow::Result<()>>;
}

// ── mpv translation ───────────────────────────────────────────────────────────

pub const OBS_PAUSE: u64 = 1;
pub const OBS_CORE_IDLE: u64 = 2;
pub const OBS_PAUSED_FOR_CACHE: u64 = 3;

/// Turns raw mpv notifications into `AudioEvent`s.
#[derive(Debug, Default)]
pub struct AudioEventMapper {
    paused: bool,
    loaded: SourceId,
}

impl AudioEventMapper {
    /// Like `map`, stamped with the source mpv is currently working on.
    /// `latest` is the newest id handed out by `set_source`; mpv reports
    /// `start-file` only after it has processed that load, so everything
    /// before it still belongs to the previous source.
    pub fn map_notice(&mut self, evt: &MpvEvent, latest: SourceId) -> Option<AudioNotice> {
        if evt.event_name() == Some("start-file") {
            self.loaded = latest;
            return None;
        }
        self.map(evt).map(|event| AudioNotice {
            source: self.loaded,
            event,
        })
    }

    pub fn map(&mut self, evt: &MpvEvent) -> Option<AudioEvent> {
        if let Some((id, data)) = evt.as_property_change() {
            return match id {
                OBS_PAUSE => {
                    self.paused = data.as_bool().unwrap_or(false);
                    self.paused.then_some(AudioEvent::Paused)
                }
                OBS_CORE_IDLE => match data.as_bool() {
                    Some(false) if !self.paused => Some(AudioEvent::Playing),
                    _ => None,
                },
                OBS_PAUSED_FOR_CACHE => match data.as_bool() {
                    Some(true) => Some(AudioEvent::Waiting),
                    _ => None,
                },
                _ => None,
            };
        }

        match evt.end_file_reason() {
            Some("eof") => Some(AudioEvent::Ended),
            Some("error") => Some(AudioEvent::Error(
                evt.file_error().unwrap_or("playback error").to_string(),
            )),
            // "stop" / "redirect" / "quit" are our own doing
            _ => None,
        }
    }
}

// ── mpv-backed output ─────────────────────────────────────────────────────────

pub struct MpvAudio {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    events: mpsc::UnboundedSender<AudioNotice>,
    latest_source: Arc<AtomicU64>,
}

impl MpvAudio {
    pub fn new(events: mpsc::UnboundedSender<AudioNotice>) -> Self {
        Self {
            driver: MpvDriver::new(MpvRole::Scanner),
            handle: None,
            events,
            latest_source: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Live handle, (re)spawning mpv when there is none or it died.
    async fn ensure_handle(&mut self) -> anyhow::Result<MpvHandle> {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("scanner audio: mpv process died, respawning");
            self.handle = None;
        }
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }

        let (mpv_tx, mut mpv_rx) = mpsc::channel::<MpvEvent>(64);
        let events = self.events.clone();
        let latest_source = Arc::clone(&self.latest_source);
        tokio::spawn(async move {
            let mut mapper = AudioEventMapper::default();
            while let Some(evt) = mpv_rx.recv().await {
                let latest = SourceId(latest_source.load(Ordering::SeqCst));
                if let Some(notice) = mapper.map_notice(&evt, latest) {
                    debug!("scanner audio: {:?}", notice);
                    if events.send(notice).is_err() {
                        break;
                    }
                }
            }
        });

        let handle = self.driver.spawn_and_connect(mpv_tx).await?;
        handle.observe(OBS_PAUSE, "pause").await;
        handle.observe(OBS_CORE_IDLE, "core-idle").await;
        handle.observe(OBS_PAUSED_FOR_CACHE, "paused-for-cache").await;
        info!("scanner audio: mpv ready");
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

impl AudioOutput for MpvAudio {
    async fn set_source(&mut self, url: &str) -> anyhow::Result<SourceId> {
        let handle = self.ensure_handle().await?;
        handle.set_pause(true).await?;
        // Bump before loading so the new start-file can only see this id.
        let id = SourceId(self.latest_source.fetch_add(1, Ordering::SeqCst) + 1);
        handle.loadfile(url).await?;
        Ok(id)
    }

    async fn play(&mut self) -> anyhow::Result<()> {
        let handle = self.ensure_handle().await?;
        handle.set_pause(false).await
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        match &self.handle {
            Some(handle) => handle.set_pause(true).await,
            None => Ok(()),
        }
    }

    async fn clear_source(&mut self) -> anyhow::Result<()> {
        match &self.handle {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    async fn set_volume(&mut self, level: u8) -> anyhow::Result<()> {
        self.driver.last_volume = level.min(100);
        match &self.handle {
            Some(handle) => handle.set_volume(level).await,
            None => Ok(()),
        }
    }
}
