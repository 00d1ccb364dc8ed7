//! Scanner controller: one audio output, one selected feed.
//!
//! Direct-stream feeds hand the stream URL straight to the output.  Call-queue
//! feeds poll the calls API every few seconds, queue whatever is new and play
//! the queue back to back.  Selecting a feed, stopping, or a fatal stream
//! error bumps the controller's `Generation`, which silently retires every
//! poll tick, fetch result and retry that was still in flight.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioEvent, AudioNotice, AudioOutput, SourceId};
use crate::timer::{Generation, Scheduler};
use scanner_proto::calls::{CallBatch, CallSource, CallsError};
use scanner_proto::config::{ScannerConfig, MAX_LOOKBACK_SECS};
use scanner_proto::protocol::{CallRecord, FeedDescriptor, FeedKind, ScannerPhase, ScannerView};
use scanner_proto::visual::Visualizer;

pub const STATUS_WAITING: &str = "Waiting for activity…";
pub const STATUS_UNAVAILABLE: &str = "Stream unavailable";

#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("no feed at index {0}")]
    UnknownFeed(usize),
}

/// Self-addressed scanner events, each stamped with the generation that
/// issued it.
#[derive(Debug)]
pub enum ScannerEvent {
    PollTick {
        generation: Generation,
    },
    CallsFetched {
        generation: Generation,
        result: Result<Vec<CallRecord>, CallsError>,
    },
    RetryNext {
        generation: Generation,
    },
}

pub struct ScannerController<A, C> {
    config: ScannerConfig,
    feeds: Vec<FeedDescriptor>,
    audio: A,
    calls: C,
    scheduler: Scheduler<ScannerEvent>,

    current: Option<usize>,
    phase: ScannerPhase,
    /// Playback intent.  Only an explicit stop or a fatal stream error
    /// clears it; pauses between calls do not.
    active: bool,
    visual: Visualizer,
    status: String,

    queue: VecDeque<CallRecord>,
    /// Call handed to the output and not yet ended.  `None` means idle.
    now_playing: Option<CallRecord>,
    /// Source the output is attached to on our behalf.  Notices about any
    /// other source are late arrivals from before a swap.
    source: Option<SourceId>,
    watermark: Option<DateTime<Utc>>,
    fetch_in_flight: bool,

    generation: Generation,
    poller: Option<CancellationToken>,
    volume: u8,
}

impl<A: AudioOutput, C: CallSource> ScannerController<A, C> {
    pub fn new(
        config: ScannerConfig,
        feeds: Vec<FeedDescriptor>,
        audio: A,
        calls: C,
        scheduler: Scheduler<ScannerEvent>,
    ) -> Self {
        let volume = config.default_volume.min(100);
        Self {
            config,
            feeds,
            audio,
            calls,
            scheduler,
            current: None,
            phase: ScannerPhase::Idle,
            active: false,
            visual: Visualizer::default(),
            status: String::new(),
            queue: VecDeque::new(),
            now_playing: None,
            source: None,
            watermark: None,
            fetch_in_flight: false,
            generation: Generation::default(),
            poller: None,
            volume,
        }
    }

    pub fn view(&self) -> ScannerView {
        ScannerView {
            current_feed: self.current,
            phase: self.phase,
            is_playing: self.active,
            live: self.active,
            visual_active: self.visual.is_active(),
            status: self.status.clone(),
            now_playing: self.now_playing.clone(),
            queued: self.queue.len(),
            volume: self.volume,
        }
    }

    #[cfg(test)]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[cfg(test)]
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    #[cfg(test)]
    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    fn current_feed(&self) -> Option<&FeedDescriptor> {
        self.current.and_then(|idx| self.feeds.get(idx))
    }

    fn feed_status(feed: &FeedDescriptor) -> String {
        if feed.description.is_empty() {
            feed.label()
        } else {
            feed.description.clone()
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    /// Switch to feed `index`, tearing down whatever was playing first.
    pub async fn select_feed(&mut self, index: usize) -> Result<(), ScannerError> {
        let feed = self
            .feeds
            .get(index)
            .cloned()
            .ok_or(ScannerError::UnknownFeed(index))?;

        self.teardown().await;
        self.current = Some(index);
        self.watermark = None;
        self.status = Self::feed_status(&feed);
        info!("[scanner] selected feed {} ({})", index, feed.label());

        self.start(&feed).await;
        Ok(())
    }

    /// Stop when playing, resume when stopped.  No-op without a feed.
    pub async fn toggle_playback(&mut self) {
        let Some(feed) = self.current_feed().cloned() else {
            debug!("[scanner] toggle ignored, no feed selected");
            return;
        };

        if self.active {
            info!("[scanner] stop");
            self.stop_polling();
            self.queue.clear();
            self.now_playing = None;
            if let Err(e) = self.audio.pause().await {
                warn!("[scanner] pause failed: {}", e);
            }
            self.deactivate();
        } else {
            info!("[scanner] resume {}", feed.label());
            self.status = Self::feed_status(&feed);
            self.start(&feed).await;
        }
    }

    pub async fn set_volume(&mut self, level: u8) {
        self.volume = level.min(100);
        if let Err(e) = self.audio.set_volume(self.volume).await {
            warn!("[scanner] volume change failed: {}", e);
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    async fn start(&mut self, feed: &FeedDescriptor) {
        self.active = true;
        self.visual.start();
        self.phase = ScannerPhase::Connecting;

        match &feed.kind {
            FeedKind::DirectStream { url } => {
                // Always a fresh attach: a paused live connection does not
                // reliably resume.
                if let Err(e) = self.load_and_play(url).await {
                    self.stream_failed(&e.to_string()).await;
                }
            }
            FeedKind::CallQueue { system_id } => self.start_polling(system_id),
        }
    }

    async fn teardown(&mut self) {
        self.stop_polling();
        self.queue.clear();
        self.now_playing = None;
        self.source = None;
        if let Err(e) = self.audio.clear_source().await {
            warn!("[scanner] clearing source failed: {}", e);
        }
        self.deactivate();
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.visual.stop();
        self.phase = ScannerPhase::Idle;
    }

    fn stop_polling(&mut self) {
        if let Some(token) = self.poller.take() {
            token.cancel();
        }
        self.fetch_in_flight = false;
        self.generation.bump();
    }

    fn start_polling(&mut self, system_id: &str) {
        let lookback = self.config.lookback_secs.min(MAX_LOOKBACK_SECS) as i64;
        let floor = Utc::now() - chrono::Duration::seconds(lookback);
        self.watermark = Some(match self.watermark {
            Some(mark) if mark > floor => mark,
            _ => floor,
        });

        let token = CancellationToken::new();
        let child = token.clone();
        let scheduler = self.scheduler.clone();
        let generation = self.generation;
        let period = Duration::from_secs(self.config.poll_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if !scheduler.send(ScannerEvent::PollTick { generation }) {
                            break;
                        }
                    }
                }
            }
        });

        info!(
            "[scanner] polling {} every {:?} from {:?}",
            system_id, period, self.watermark
        );
        self.poller = Some(token);
    }

    async fn load_and_play(&mut self, url: &str) -> anyhow::Result<()> {
        self.source = None;
        self.source = Some(self.audio.set_source(url).await?);
        self.audio.play().await
    }

    /// A direct stream failed: nothing to fall back to, so the session ends
    /// until the user picks a feed again.
    async fn stream_failed(&mut self, reason: &str) {
        warn!("[scanner] stream unavailable: {}", reason);
        self.stop_polling();
        self.source = None;
        if let Err(e) = self.audio.clear_source().await {
            debug!("[scanner] clearing failed stream: {}", e);
        }
        self.deactivate();
        self.status = STATUS_UNAVAILABLE.to_string();
    }

    // ── call queue ────────────────────────────────────────────────────────────

    fn poll(&mut self) {
        if self.fetch_in_flight {
            debug!("[scanner] previous fetch still running, skipping tick");
            return;
        }
        let Some(FeedKind::CallQueue { system_id }) = self.current_feed().map(|f| f.kind.clone())
        else {
            return;
        };
        let since = self.watermark.unwrap_or_else(Utc::now);

        self.fetch_in_flight = true;
        let calls = self.calls.clone();
        let scheduler = self.scheduler.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = calls.fetch_newer(&system_id, since).await;
            scheduler.send(ScannerEvent::CallsFetched { generation, result });
        });
    }

    async fn on_calls_fetched(&mut self, result: Result<Vec<CallRecord>, CallsError>) {
        self.fetch_in_flight = false;

        let calls = match result {
            Ok(calls) => calls,
            Err(e) => {
                warn!("[scanner] poll failed, retrying next tick: {}", e);
                if self.now_playing.is_none() {
                    self.status = STATUS_WAITING.to_string();
                }
                return;
            }
        };

        let batch = CallBatch::accept(calls, self.config.min_call_secs);
        if let Some(next) = batch.watermark {
            if self.watermark.map_or(true, |mark| next > mark) {
                self.watermark = Some(next);
            }
        }
        if !batch.accepted.is_empty() || batch.discarded > 0 {
            debug!(
                "[scanner] fetched {} calls ({} too short), watermark {:?}",
                batch.accepted.len(),
                batch.discarded,
                self.watermark
            );
        }
        self.queue.extend(batch.accepted);

        if self.active && self.now_playing.is_none() {
            self.play_next_call().await;
        }
    }

    /// Play the oldest queued call, skipping entries with no audio.
    async fn play_next_call(&mut self) {
        while let Some(call) = self.queue.pop_front() {
            let Some(url) = call.audio_url(&self.config.audio_base_url) else {
                debug!("[scanner] skipping call at {} without audio", call.time);
                continue;
            };

            if let Some(feed) = self.current_feed() {
                self.status = Self::feed_status(feed);
            }
            debug!("[scanner] playing call {} ({:.1}s)", call.time, call.len);
            self.now_playing = Some(call);

            if let Err(e) = self.load_and_play(&url).await {
                warn!("[scanner] call failed to start, retrying shortly: {}", e);
                self.now_playing = None;
                self.scheduler.after(
                    Duration::from_millis(self.config.retry_delay_ms),
                    ScannerEvent::RetryNext {
                        generation: self.generation,
                    },
                );
            }
            return;
        }

        self.now_playing = None;
        self.status = STATUS_WAITING.to_string();
    }

    // ── event handlers ────────────────────────────────────────────────────────

    pub async fn handle_event(&mut self, event: ScannerEvent) {
        match event {
            ScannerEvent::PollTick { generation } if generation == self.generation => self.poll(),
            ScannerEvent::CallsFetched { generation, result } if generation == self.generation => {
                self.on_calls_fetched(result).await
            }
            ScannerEvent::RetryNext { generation } if generation == self.generation => {
                if self.active && self.now_playing.is_none() {
                    self.play_next_call().await;
                }
            }
            stale => debug!("[scanner] dropping stale {:?}", stale),
        }
    }

    pub async fn handle_audio_event(&mut self, notice: AudioNotice) {
        let AudioNotice { source, event } = notice;
        if self.source != Some(source) {
            debug!("[scanner] dropping {:?} for replaced source {:?}", event, source);
            return;
        }
        let Some(is_queue) = self.current_feed().map(FeedDescriptor::is_call_queue) else {
            return;
        };

        match event {
            AudioEvent::Playing => {
                if self.active {
                    self.phase = ScannerPhase::Playing;
                }
            }
            AudioEvent::Waiting => {
                if self.phase == ScannerPhase::Playing {
                    self.phase = ScannerPhase::Buffering;
                }
            }
            // Gaps between calls and our own source swaps pause the output;
            // none of that is the user stopping playback.
            AudioEvent::Paused => debug!("[scanner] output paused"),
            AudioEvent::Ended if is_queue => {
                self.now_playing = None;
                if self.active {
                    self.play_next_call().await;
                }
            }
            AudioEvent::Ended => {
                if self.active {
                    self.stream_failed("stream ended").await;
                }
            }
            AudioEvent::Error(reason) if !self.active => {
                debug!("[scanner] ignoring output error while stopped: {}", reason);
            }
            AudioEvent::Error(reason) if is_queue => {
                warn!("[scanner] call playback failed, advancing: {}", reason);
                self.now_playing = None;
                self.play_next_call().await;
            }
            AudioEvent::Error(reason) => self.stream_failed(&reason).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        SetSource(String),
        Play,
        Pause,
        Clear,
        Volume(u8),
    }

    #[derive(Clone, Default)]
    struct FakeAudio {
        ops: Arc<Mutex<Vec<Op>>>,
        fail_play: Arc<Mutex<bool>>,
        sources: Arc<Mutex<u64>>,
    }

    impl FakeAudio {
        fn take(&self) -> Vec<Op> {
            std::mem::take(&mut *self.ops.lock().unwrap())
        }

        fn current(&self) -> SourceId {
            SourceId(*self.sources.lock().unwrap())
        }
    }

    impl AudioOutput for FakeAudio {
        async fn set_source(&mut self, url: &str) -> anyhow::Result<SourceId> {
            self.ops.lock().unwrap().push(Op::SetSource(url.to_string()));
            let mut sources = self.sources.lock().unwrap();
            *sources += 1;
            Ok(SourceId(*sources))
        }
        async fn play(&mut self) -> anyhow::Result<()> {
            self.ops.lock().unwrap().push(Op::Play);
            if *self.fail_play.lock().unwrap() {
                anyhow::bail!("autoplay rejected");
            }
            Ok(())
        }
        async fn pause(&mut self) -> anyhow::Result<()> {
            self.ops.lock().unwrap().push(Op::Pause);
            Ok(())
        }
        async fn clear_source(&mut self) -> anyhow::Result<()> {
            self.ops.lock().unwrap().push(Op::Clear);
            Ok(())
        }
        async fn set_volume(&mut self, level: u8) -> anyhow::Result<()> {
            self.ops.lock().unwrap().push(Op::Volume(level));
            Ok(())
        }
    }

    /// Scripted call source: each system answers from its own queue of
    /// batches (empty once exhausted) and records every request.
    #[derive(Clone, Default)]
    struct FakeCalls {
        batches: Arc<Mutex<HashMap<String, VecDeque<Result<Vec<CallRecord>, u16>>>>>,
        requests: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
    }

    impl FakeCalls {
        fn push(&self, system: &str, batch: Result<Vec<CallRecord>, u16>) {
            self.batches
                .lock()
                .unwrap()
                .entry(system.to_string())
                .or_default()
                .push_back(batch);
        }

        fn requests_for(&self, system: &str) -> Vec<DateTime<Utc>> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == system)
                .map(|(_, t)| *t)
                .collect()
        }
    }

    impl CallSource for FakeCalls {
        async fn fetch_newer(
            &self,
            system_id: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<CallRecord>, CallsError> {
            self.requests
                .lock()
                .unwrap()
                .push((system_id.to_string(), since));
            let next = self
                .batches
                .lock()
                .unwrap()
                .get_mut(system_id)
                .and_then(VecDeque::pop_front);
            match next {
                Some(Ok(calls)) => Ok(calls),
                Some(Err(code)) => Err(CallsError::Status(code)),
                None => Ok(Vec::new()),
            }
        }
    }

    fn feeds() -> Vec<FeedDescriptor> {
        vec![
            FeedDescriptor {
                city: "Seattle".into(),
                state: "WA".into(),
                description: "Seattle fire".into(),
                kind: FeedKind::CallQueue {
                    system_id: "sea".into(),
                },
            },
            FeedDescriptor {
                city: "Boston".into(),
                state: "MA".into(),
                description: "Boston police".into(),
                kind: FeedKind::DirectStream {
                    url: "https://stream.test/boston".into(),
                },
            },
            FeedDescriptor {
                city: "Tacoma".into(),
                state: "WA".into(),
                description: "Tacoma fire".into(),
                kind: FeedKind::CallQueue {
                    system_id: "tac".into(),
                },
            },
        ]
    }

    fn call(name: &str, len: f64, time: DateTime<Utc>) -> CallRecord {
        CallRecord {
            url: Some(format!("https://audio.test/{name}.m4a")),
            filename: None,
            len,
            time,
        }
    }

    struct Harness {
        ctrl: ScannerController<FakeAudio, FakeCalls>,
        rx: mpsc::UnboundedReceiver<ScannerEvent>,
        audio: FakeAudio,
        calls: FakeCalls,
    }

    impl Harness {
        fn new() -> Self {
            let (scheduler, rx) = Scheduler::channel();
            let audio = FakeAudio::default();
            let calls = FakeCalls::default();
            let ctrl = ScannerController::new(
                ScannerConfig::default(),
                feeds(),
                audio.clone(),
                calls.clone(),
                scheduler,
            );
            Self {
                ctrl,
                rx,
                audio,
                calls,
            }
        }

        /// Deliver the next scheduled event (waits, in paused time, for it).
        async fn step(&mut self) -> Generation {
            let event = self.rx.recv().await.expect("scheduler closed");
            let generation = match &event {
                ScannerEvent::PollTick { generation }
                | ScannerEvent::CallsFetched { generation, .. }
                | ScannerEvent::RetryNext { generation } => *generation,
            };
            self.ctrl.handle_event(event).await;
            generation
        }

        /// Deliver an output event for whatever source is attached now.
        async fn audio_event(&mut self, event: AudioEvent) {
            let source = self.audio.current();
            self.ctrl
                .handle_audio_event(AudioNotice { source, event })
                .await;
        }

        /// Run one poll round trip: tick + fetch result.
        async fn poll_once(&mut self) {
            self.step().await;
            self.step().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_feed_filters_short_calls_and_advances_watermark() {
        let mut h = Harness::new();
        let now = Utc::now();
        let t0 = now - chrono::Duration::seconds(90);
        let t1 = now - chrono::Duration::seconds(60);
        let t2 = now - chrono::Duration::seconds(30);
        h.calls.push(
            "sea",
            Ok(vec![call("blip", 0.5, t0), call("a", 5.0, t1), call("b", 10.0, t2)]),
        );

        h.ctrl.select_feed(0).await.unwrap();
        let first_since = h.ctrl.watermark().unwrap();
        assert!(now - first_since >= chrono::Duration::seconds(119));
        h.poll_once().await;

        // One call playing, one queued, the blip discarded.
        let view = h.ctrl.view();
        assert_eq!(view.now_playing.as_ref().unwrap().time, t1);
        assert_eq!(view.queued, 1);
        assert_eq!(
            h.ctrl.watermark().unwrap(),
            t2 + chrono::Duration::milliseconds(1)
        );
        assert!(h
            .audio
            .take()
            .contains(&Op::SetSource("https://audio.test/a.m4a".into())));

        // The next poll asks from the new watermark.
        h.poll_once().await;
        let requests = h.calls.requests_for("sea");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], first_since);
        assert_eq!(requests[1], t2 + chrono::Duration::milliseconds(1));
    }

    #[tokio::test(start_paused = true)]
    async fn calls_play_back_to_back() {
        let mut h = Harness::new();
        let now = Utc::now();
        h.calls.push(
            "sea",
            Ok(vec![
                call("a", 3.0, now - chrono::Duration::seconds(20)),
                call("b", 4.0, now - chrono::Duration::seconds(10)),
            ]),
        );
        h.ctrl.select_feed(0).await.unwrap();
        h.poll_once().await;
        h.audio.take();

        h.audio_event(AudioEvent::Playing).await;
        assert_eq!(h.ctrl.view().phase, ScannerPhase::Playing);

        // Pause between calls must not drop the active state.
        h.audio_event(AudioEvent::Paused).await;
        h.audio_event(AudioEvent::Ended).await;
        let view = h.ctrl.view();
        assert!(view.is_playing);
        assert!(view.live);
        assert_eq!(view.queued, 0);
        assert_eq!(
            h.audio.take(),
            vec![Op::SetSource("https://audio.test/b.m4a".into()), Op::Play]
        );

        // Queue drained: idle, waiting for the next poll.
        h.audio_event(AudioEvent::Ended).await;
        let view = h.ctrl.view();
        assert!(view.now_playing.is_none());
        assert!(view.is_playing);
        assert_eq!(view.status, STATUS_WAITING);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_error_advances_without_touching_live_state() {
        let mut h = Harness::new();
        let now = Utc::now();
        h.calls.push(
            "sea",
            Ok(vec![
                call("broken", 3.0, now - chrono::Duration::seconds(20)),
                call("fine", 4.0, now - chrono::Duration::seconds(10)),
            ]),
        );
        h.ctrl.select_feed(0).await.unwrap();
        h.poll_once().await;
        h.audio.take();
        let before = h.ctrl.view();

        h.audio_event(AudioEvent::Error("decode error".into()))
            .await;

        let after = h.ctrl.view();
        assert_eq!(after.live, before.live);
        assert!(after.is_playing);
        assert_eq!(
            after.now_playing.as_ref().unwrap().url.as_deref(),
            Some("https://audio.test/fine.m4a")
        );
        assert_eq!(
            h.audio.take(),
            vec![Op::SetSource("https://audio.test/fine.m4a".into()), Op::Play]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn calls_without_audio_are_skipped() {
        let mut h = Harness::new();
        let now = Utc::now();
        let mut silent = call("silent", 6.0, now - chrono::Duration::seconds(20));
        silent.url = None;
        h.calls.push(
            "sea",
            Ok(vec![silent, call("real", 6.0, now - chrono::Duration::seconds(10))]),
        );
        h.ctrl.select_feed(0).await.unwrap();
        h.poll_once().await;

        assert_eq!(
            h.audio.take(),
            vec![
                Op::Clear,
                Op::SetSource("https://audio.test/real.m4a".into()),
                Op::Play
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_play_retries_next_call_after_delay() {
        let mut h = Harness::new();
        let now = Utc::now();
        h.calls.push(
            "sea",
            Ok(vec![
                call("a", 3.0, now - chrono::Duration::seconds(20)),
                call("b", 3.0, now - chrono::Duration::seconds(10)),
            ]),
        );
        *h.audio.fail_play.lock().unwrap() = true;
        h.ctrl.select_feed(0).await.unwrap();
        h.poll_once().await;
        assert!(h.ctrl.view().now_playing.is_none());
        assert_eq!(h.ctrl.view().queued, 1);

        *h.audio.fail_play.lock().unwrap() = false;
        h.audio.take();
        let started = tokio::time::Instant::now();
        h.step().await; // RetryNext
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(
            h.audio.take(),
            vec![Op::SetSource("https://audio.test/b.m4a".into()), Op::Play]
        );
        assert!(h.ctrl.view().is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failure_shows_waiting_and_retries() {
        let mut h = Harness::new();
        h.calls.push("sea", Err(503));
        h.ctrl.select_feed(0).await.unwrap();
        let mark = h.ctrl.watermark();
        h.poll_once().await;

        let view = h.ctrl.view();
        assert_eq!(view.status, STATUS_WAITING);
        assert!(view.is_playing);
        assert_eq!(h.ctrl.watermark(), mark);

        h.poll_once().await;
        assert_eq!(h.calls.requests_for("sea").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reselect_tears_down_previous_poller() {
        let mut h = Harness::new();
        h.ctrl.select_feed(0).await.unwrap();
        h.poll_once().await;
        let old_generation = h.ctrl.generation();

        h.ctrl.select_feed(2).await.unwrap();
        assert!(h.ctrl.generation() > old_generation);
        assert!(h.ctrl.is_polling());

        // Several intervals later, only the new feed's poller is ticking.
        for _ in 0..6 {
            let generation = h.step().await;
            assert_eq!(generation, h.ctrl.generation());
        }
        assert_eq!(h.calls.requests_for("sea").len(), 1);
        assert_eq!(h.calls.requests_for("tac").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_landing_after_feed_change_is_dropped() {
        let mut h = Harness::new();
        let now = Utc::now();
        h.calls.push(
            "sea",
            Ok(vec![call("late", 5.0, now - chrono::Duration::seconds(5))]),
        );
        h.ctrl.select_feed(0).await.unwrap();
        h.step().await; // tick → fetch spawned

        h.ctrl.select_feed(1).await.unwrap();
        h.audio.take();
        h.step().await; // stale CallsFetched

        let view = h.ctrl.view();
        assert_eq!(view.current_feed, Some(1));
        assert_eq!(view.queued, 0);
        assert!(view.now_playing.is_none());
        assert!(h.audio.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn direct_stream_error_is_terminal() {
        let mut h = Harness::new();
        h.ctrl.select_feed(1).await.unwrap();
        assert_eq!(
            h.audio.take(),
            vec![
                Op::Clear,
                Op::SetSource("https://stream.test/boston".into()),
                Op::Play
            ]
        );
        h.audio_event(AudioEvent::Playing).await;
        h.audio_event(AudioEvent::Waiting).await;
        assert_eq!(h.ctrl.view().phase, ScannerPhase::Buffering);

        h.audio_event(AudioEvent::Error("connection reset".into()))
            .await;
        let view = h.ctrl.view();
        assert_eq!(view.status, STATUS_UNAVAILABLE);
        assert!(!view.is_playing);
        assert!(!view.live);
        assert!(!view.visual_active);
        assert_eq!(view.phase, ScannerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn late_event_from_previous_feed_is_ignored() {
        let mut h = Harness::new();
        let now = Utc::now();
        h.calls.push(
            "sea",
            Ok(vec![call("a", 5.0, now - chrono::Duration::seconds(10))]),
        );
        h.ctrl.select_feed(0).await.unwrap();
        h.poll_once().await;
        let call_source = h.audio.current();

        h.ctrl.select_feed(1).await.unwrap();
        assert!(h.audio.current() > call_source);

        // The old call's end lands after the switch.
        h.ctrl
            .handle_audio_event(AudioNotice {
                source: call_source,
                event: AudioEvent::Ended,
            })
            .await;
        h.ctrl
            .handle_audio_event(AudioNotice {
                source: call_source,
                event: AudioEvent::Error("gone".into()),
            })
            .await;

        let view = h.ctrl.view();
        assert_eq!(view.current_feed, Some(1));
        assert!(view.is_playing);
        assert_ne!(view.status, STATUS_UNAVAILABLE);

        // The stream's own events still count.
        h.audio_event(AudioEvent::Playing).await;
        assert_eq!(h.ctrl.view().phase, ScannerPhase::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_event_on_direct_stream_keeps_active_state() {
        let mut h = Harness::new();
        h.ctrl.select_feed(1).await.unwrap();
        h.audio_event(AudioEvent::Paused).await;
        assert!(h.ctrl.view().is_playing);
        assert!(h.ctrl.view().live);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_twice_restores_state() {
        let mut h = Harness::new();
        h.ctrl.select_feed(1).await.unwrap();
        h.audio.take();

        h.ctrl.toggle_playback().await;
        assert!(!h.ctrl.view().is_playing);
        assert_eq!(h.audio.take(), vec![Op::Pause]);

        h.ctrl.toggle_playback().await;
        assert!(h.ctrl.view().is_playing);
        // Resume re-attaches the stream instead of unpausing a stale connection.
        assert_eq!(
            h.audio.take(),
            vec![
                Op::SetSource("https://stream.test/boston".into()),
                Op::Play
            ]
        );

        h.ctrl.toggle_playback().await;
        h.ctrl.toggle_playback().await;
        assert!(h.ctrl.view().is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_polling_and_resume_restarts_it() {
        let mut h = Harness::new();
        h.ctrl.select_feed(0).await.unwrap();
        h.poll_once().await;

        let running_generation = h.ctrl.generation();

        h.ctrl.toggle_playback().await;
        assert!(!h.ctrl.is_polling());
        assert!(!h.ctrl.view().is_playing);
        assert!(h.ctrl.generation() > running_generation);

        h.ctrl.toggle_playback().await;
        assert!(h.ctrl.is_polling());
        let generation = h.step().await;
        assert_eq!(generation, h.ctrl.generation());
        assert_eq!(h.calls.requests_for("sea").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_without_feed_is_noop() {
        let mut h = Harness::new();
        h.ctrl.toggle_playback().await;
        h.ctrl.toggle_playback().await;
        assert!(!h.ctrl.view().is_playing);
        assert!(h.audio.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_feed_leaves_playback_alone() {
        let mut h = Harness::new();
        h.ctrl.select_feed(1).await.unwrap();
        h.audio.take();

        assert!(matches!(
            h.ctrl.select_feed(9).await,
            Err(ScannerError::UnknownFeed(9))
        ));
        assert!(h.ctrl.view().is_playing);
        assert_eq!(h.ctrl.view().current_feed, Some(1));
        assert!(h.audio.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_never_refetches_old_calls() {
        let mut h = Harness::new();
        let t = Utc.timestamp_millis_opt(Utc::now().timestamp_millis() - 5_000).unwrap();
        h.calls.push("sea", Ok(vec![call("a", 5.0, t)]));
        h.ctrl.select_feed(0).await.unwrap();
        h.poll_once().await;

        h.ctrl.toggle_playback().await;
        h.ctrl.toggle_playback().await;
        assert_eq!(
            h.ctrl.watermark().unwrap(),
            t + chrono::Duration::milliseconds(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn volume_is_clamped_and_forwarded() {
        let mut h = Harness::new();
        h.ctrl.set_volume(140).await;
        assert_eq!(h.ctrl.view().volume, 100);
        assert_eq!(h.audio.take(), vec![Op::Volume(100)]);
    }
}
