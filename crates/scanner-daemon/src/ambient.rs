//! Ambient controller: one embedded playlist widget, several modes.
//!
//! The widget is bound once per session.  Every playlist load (boot and each
//! mode switch) ends in a `WidgetEvent::Ready`, after which the controller
//! shuffles the track order and, when the session intends to be playing,
//! fires a few staggered play attempts.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::timer::{Generation, Scheduler};
use crate::widget::{bind_with_backoff, BindPolicy, LoadOptions, Widget, WidgetEvent, WidgetHost};
use scanner_proto::config::AmbientConfig;
use scanner_proto::protocol::AmbientView;
use scanner_proto::shuffle::PlaybackCursor;
use scanner_proto::visual::Visualizer;

pub const STATUS_NO_TRACKS: &str = "No tracks in playlist";
pub const STATUS_SKIPPING: &str = "Track unavailable, skipping…";
pub const STATUS_PLAYER_UNAVAILABLE: &str = "Player unavailable";

#[derive(Debug, thiserror::Error)]
pub enum AmbientError {
    #[error("unknown mode '{0}'")]
    UnknownMode(String),
}

/// Self-addressed ambient events.
///
/// `generation` changes with every playlist load and user pause, `skip_seq`
/// with every navigation; a delayed event only acts when the counters it
/// carries are still current.
#[derive(Debug)]
pub enum AmbientEvent<W> {
    Bound(W),
    BindFailed(String),
    PlayAttempt {
        generation: Generation,
        attempt: usize,
    },
    RefreshTrack {
        generation: Generation,
    },
    Settle {
        generation: Generation,
        skip_seq: Generation,
        resume: bool,
    },
    SkipUnavailable {
        generation: Generation,
        skip_seq: Generation,
    },
}

pub struct AmbientController<W> {
    config: AmbientConfig,
    modes: BTreeMap<String, String>,
    scheduler: Scheduler<AmbientEvent<W>>,
    widget: Option<W>,
    bind_started: bool,

    mode: String,
    ready: bool,
    /// A mode switch is in flight; the widget's own pause during the swap is
    /// not a state change.
    switching: bool,
    is_playing: bool,
    has_played: bool,
    visual: Visualizer,

    cursor: PlaybackCursor,
    rng: StdRng,
    track_title: Option<String>,
    status: Option<String>,
    volume: u8,

    generation: Generation,
    skip_seq: Generation,
}

impl<W: Widget + Send + 'static> AmbientController<W> {
    pub fn new(
        config: AmbientConfig,
        modes: BTreeMap<String, String>,
        scheduler: Scheduler<AmbientEvent<W>>,
    ) -> Self {
        let mode = config.default_mode.clone();
        let volume = config.default_volume.min(100);
        Self {
            config,
            modes,
            scheduler,
            widget: None,
            bind_started: false,
            mode,
            ready: false,
            switching: false,
            is_playing: false,
            has_played: false,
            visual: Visualizer::default(),
            cursor: PlaybackCursor::default(),
            rng: StdRng::from_entropy(),
            track_title: None,
            status: None,
            volume,
            generation: Generation::default(),
            skip_seq: Generation::default(),
        }
    }

    /// Replace the shuffle source (deterministic orders in tests).
    #[cfg(test)]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn view(&self) -> AmbientView {
        AmbientView {
            mode: self.mode.clone(),
            label: self.mode.to_uppercase(),
            theme: format!("theme-{}", self.mode),
            is_playing: self.is_playing,
            ready: self.ready,
            visual_active: self.visual.is_active(),
            track_title: self.track_title.clone(),
            status: self.status.clone(),
            volume: self.volume,
        }
    }

    #[cfg(test)]
    pub fn cursor(&self) -> &PlaybackCursor {
        &self.cursor
    }

    #[cfg(test)]
    pub fn is_bound(&self) -> bool {
        self.widget.is_some()
    }

    /// Start binding the widget in the background.  Later calls are no-ops.
    pub fn boot<H>(&mut self, mut host: H)
    where
        H: WidgetHost<Widget = W>,
    {
        if self.bind_started {
            debug!("[ambient] boot already running");
            return;
        }
        self.bind_started = true;

        let policy = BindPolicy::from_config(&self.config);
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            match bind_with_backoff(&mut host, &policy).await {
                Ok(widget) => scheduler.send(AmbientEvent::Bound(widget)),
                Err(e) => scheduler.send(AmbientEvent::BindFailed(e.to_string())),
            };
        });
    }

    // ── commands ──────────────────────────────────────────────────────────────

    pub async fn switch_mode(&mut self, mode: &str) -> Result<(), AmbientError> {
        if mode == self.mode {
            debug!("[ambient] already in mode {}", mode);
            return Ok(());
        }
        let url = self
            .modes
            .get(mode)
            .cloned()
            .ok_or_else(|| AmbientError::UnknownMode(mode.to_string()))?;

        let resume = self.is_playing || self.has_played;
        info!("[ambient] mode {} -> {} (resume: {})", self.mode, mode, resume);
        let previous = std::mem::replace(&mut self.mode, mode.to_string());
        let was_ready = std::mem::replace(&mut self.ready, false);
        self.switching = true;
        self.status = None;
        self.generation.bump();

        if let Some(widget) = self.widget.as_mut() {
            if let Err(e) = widget.load(&url, LoadOptions { auto_play: resume }).await {
                // The old playlist is still loaded; keep driving it.
                warn!("[ambient] loading {} failed: {}", url, e);
                self.mode = previous;
                self.ready = was_ready;
                self.switching = false;
                self.status = Some(STATUS_PLAYER_UNAVAILABLE.to_string());
            }
        }
        Ok(())
    }

    pub async fn next(&mut self) {
        let index = self.cursor.advance(&mut self.rng);
        self.skip_to(index).await;
    }

    pub async fn prev(&mut self) {
        let index = self.cursor.retreat();
        self.skip_to(index).await;
    }

    /// Play/pause button.
    pub async fn toggle(&mut self) {
        if !self.ready {
            debug!("[ambient] toggle ignored, widget not ready");
            return;
        }
        let Some(widget) = self.widget.as_mut() else {
            return;
        };
        let result = if self.is_playing {
            // A user pause outranks any play attempt still pending.
            self.generation.bump();
            widget.pause().await
        } else {
            widget.play().await
        };
        if let Err(e) = result {
            warn!("[ambient] toggle failed: {}", e);
        }
    }

    pub async fn set_volume(&mut self, level: u8) {
        self.volume = level.min(100);
        if !self.ready {
            return;
        }
        if let Some(widget) = self.widget.as_mut() {
            if let Err(e) = widget.set_volume(self.volume).await {
                warn!("[ambient] volume change failed: {}", e);
            }
        }
    }

    // ── playlist lifecycle ────────────────────────────────────────────────────

    async fn skip_to(&mut self, index: Option<usize>) {
        let Some(index) = index else {
            return;
        };
        let Some(widget) = self.widget.as_mut() else {
            return;
        };
        if let Err(e) = widget.skip(index).await {
            warn!("[ambient] skip to {} failed: {}", index, e);
            return;
        }

        self.scheduler.after(
            Duration::from_millis(self.config.settle_delay_ms),
            AmbientEvent::Settle {
                generation: self.generation,
                skip_seq: self.skip_seq.bump(),
                resume: self.is_playing,
            },
        );
    }

    async fn on_playlist_loaded(&mut self) {
        let Some(widget) = self.widget.as_mut() else {
            return;
        };
        let count = match widget.sounds().await {
            Ok(sounds) => sounds.len(),
            Err(e) => {
                warn!("[ambient] reading playlist failed: {}", e);
                0
            }
        };

        self.cursor.reset(count, &mut self.rng);
        let Some(first) = self.cursor.current() else {
            info!("[ambient] {} playlist is empty", self.mode);
            self.status = Some(STATUS_NO_TRACKS.to_string());
            self.track_title = None;
            return;
        };
        self.status = None;
        debug!("[ambient] {} tracks, starting at {}", count, first);

        if let Err(e) = widget.skip(first).await {
            warn!("[ambient] skip to first track failed: {}", e);
        }
        self.skip_seq.bump();

        if self.is_playing || self.has_played {
            let delays: &[u64] = if self.config.play_attempt_delays_ms.is_empty() {
                &[0]
            } else {
                &self.config.play_attempt_delays_ms
            };
            for (attempt, delay) in delays.iter().enumerate() {
                self.scheduler.after(
                    Duration::from_millis(*delay),
                    AmbientEvent::PlayAttempt {
                        generation: self.generation,
                        attempt,
                    },
                );
            }
        } else {
            self.scheduler.after(
                Duration::from_millis(self.config.settle_delay_ms),
                AmbientEvent::RefreshTrack {
                    generation: self.generation,
                },
            );
        }
    }

    async fn load_current_mode(&mut self) {
        let Some(url) = self.modes.get(&self.mode).cloned() else {
            warn!("[ambient] mode {} has no playlist", self.mode);
            return;
        };
        let Some(widget) = self.widget.as_mut() else {
            return;
        };
        if let Err(e) = widget.load(&url, LoadOptions { auto_play: false }).await {
            warn!("[ambient] loading {} failed: {}", url, e);
        }
    }

    async fn refresh_track(&mut self) {
        let Some(widget) = self.widget.as_mut() else {
            return;
        };
        match widget.current_sound().await {
            Ok(sound) => self.track_title = sound.map(|s| s.display_title()),
            Err(e) => debug!("[ambient] track metadata unavailable: {}", e),
        }
    }

    // ── event handlers ────────────────────────────────────────────────────────

    pub async fn handle_event(&mut self, event: AmbientEvent<W>) {
        match event {
            AmbientEvent::Bound(widget) => {
                if self.widget.is_some() {
                    debug!("[ambient] widget already bound, dropping duplicate");
                    return;
                }
                info!("[ambient] widget bound");
                self.widget = Some(widget);
                self.load_current_mode().await;
            }
            AmbientEvent::BindFailed(reason) => {
                warn!("[ambient] widget never became available: {}", reason);
                self.status = Some(STATUS_PLAYER_UNAVAILABLE.to_string());
            }
            AmbientEvent::PlayAttempt {
                generation,
                attempt,
            } if generation == self.generation => {
                if let Some(widget) = self.widget.as_mut() {
                    debug!("[ambient] play attempt {}", attempt + 1);
                    if let Err(e) = widget.play().await {
                        debug!("[ambient] play attempt {} failed: {}", attempt + 1, e);
                    }
                }
                self.refresh_track().await;
            }
            AmbientEvent::RefreshTrack { generation } if generation == self.generation => {
                self.refresh_track().await
            }
            AmbientEvent::Settle {
                generation,
                skip_seq,
                resume,
            } if generation == self.generation && skip_seq == self.skip_seq => {
                self.refresh_track().await;
                if resume {
                    if let Some(widget) = self.widget.as_mut() {
                        if let Err(e) = widget.play().await {
                            warn!("[ambient] resume after skip failed: {}", e);
                        }
                    }
                }
            }
            AmbientEvent::SkipUnavailable {
                generation,
                skip_seq,
            } if generation == self.generation && skip_seq == self.skip_seq => self.next().await,
            stale => debug!("[ambient] dropping stale {}", event_name(&stale)),
        }
    }

    pub async fn handle_widget_event(&mut self, event: WidgetEvent) {
        match event {
            WidgetEvent::Ready => {
                self.ready = true;
                self.switching = false;
                let volume = self.volume;
                self.set_volume(volume).await;
                self.on_playlist_loaded().await;
            }
            WidgetEvent::Play => {
                self.is_playing = true;
                self.has_played = true;
                self.visual.start();
                if self.status.as_deref() == Some(STATUS_SKIPPING) {
                    self.status = None;
                }
            }
            WidgetEvent::Pause if self.switching => {
                debug!("[ambient] pause during mode switch ignored")
            }
            WidgetEvent::Pause => {
                self.is_playing = false;
                self.visual.stop();
            }
            WidgetEvent::Finish => self.next().await,
            WidgetEvent::Error(reason) => {
                warn!("[ambient] track unavailable: {}", reason);
                self.status = Some(STATUS_SKIPPING.to_string());
                self.scheduler.after(
                    Duration::from_millis(self.config.skip_delay_ms),
                    AmbientEvent::SkipUnavailable {
                        generation: self.generation,
                        skip_seq: self.skip_seq,
                    },
                );
            }
        }
    }
}

fn event_name<W>(event: &AmbientEvent<W>) -> &'static str {
    match event {
        AmbientEvent::Bound(_) => "Bound",
        AmbientEvent::BindFailed(_) => "BindFailed",
        AmbientEvent::PlayAttempt { .. } => "PlayAttempt",
        AmbientEvent::RefreshTrack { .. } => "RefreshTrack",
        AmbientEvent::Settle { .. } => "Settle",
        AmbientEvent::SkipUnavailable { .. } => "SkipUnavailable",
    }
}
