use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a UI client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    SelectFeed { index: usize },
    TogglePlayback,
    ScannerVolume { value: u8 },
    SwitchMode { mode: String },
    AmbientToggle,
    AmbientNext,
    AmbientPrev,
    AmbientVolume { value: u8 },
    GetState,
}

/// Messages sent from the daemon to UI clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

// ── feeds ─────────────────────────────────────────────────────────────────────

/// How a feed delivers audio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedKind {
    /// Continuous HTTP(S) audio stream played as-is.
    DirectStream { url: String },
    /// Discrete call recordings fetched from the polling API.
    CallQueue { system_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedDescriptor {
    pub city: String,
    pub state: String,
    pub description: String,
    #[serde(flatten)]
    pub kind: FeedKind,
}

impl FeedDescriptor {
    pub fn label(&self) -> String {
        format!("{}, {}", self.city, self.state)
    }

    pub fn is_call_queue(&self) -> bool {
        matches!(self.kind, FeedKind::CallQueue { .. })
    }
}

// ── calls ─────────────────────────────────────────────────────────────────────

/// One recorded transmission returned by the polling API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    /// Duration in seconds.
    #[serde(default)]
    pub len: f64,
    #[serde(deserialize_with = "deserialize_call_time")]
    pub time: DateTime<Utc>,
}

impl CallRecord {
    /// Playable URL: the absolute `url` if present, else `filename` under
    /// `audio_base`.  `None` when the record carries no audio reference.
    pub fn audio_url(&self, audio_base: &str) -> Option<String> {
        if let Some(url) = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            return Some(url.to_string());
        }
        let filename = self
            .filename
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())?;
        if filename.starts_with("http://") || filename.starts_with("https://") {
            return Some(filename.to_string());
        }
        Some(format!(
            "{}/{}",
            audio_base.trim_end_matches('/'),
            filename.trim_start_matches('/')
        ))
    }
}

/// The API is loose about timestamps: RFC 3339, naive ISO (assumed UTC) and
/// unix milliseconds have all been observed.
pub(crate) fn deserialize_call_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTime {
        Millis(i64),
        Text(String),
    }

    match RawTime::deserialize(deserializer)? {
        RawTime::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
        RawTime::Text(text) => parse_call_time(&text).map_err(serde::de::Error::custom),
    }
}

pub fn parse_call_time(text: &str) -> Result<DateTime<Utc>, String> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(format!("unrecognised call timestamp '{text}'"))
}

// ── controller views ──────────────────────────────────────────────────────────

/// Scanner playback phase.
///
/// Transitions:
///   Idle -> Connecting -> Playing <-> Buffering
///   Playing -> Idle (stop / stream error)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ScannerPhase {
    #[default]
    Idle,
    Connecting,
    Playing,
    Buffering,
}

/// What the UI shows for the scanner side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScannerView {
    pub current_feed: Option<usize>,
    pub phase: ScannerPhase,
    /// Playback intent: true between a start and an explicit stop / fatal error.
    pub is_playing: bool,
    /// Live indicator next to the feed name.
    pub live: bool,
    pub visual_active: bool,
    pub status: String,
    /// Call currently being played (queue feeds only).
    pub now_playing: Option<CallRecord>,
    pub queued: usize,
    pub volume: u8,
}

/// What the UI shows for the ambient side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AmbientView {
    pub mode: String,
    /// Upper-cased mode name shown as the display label.
    pub label: String,
    /// Background theme class for the current mode.
    pub theme: String,
    pub is_playing: bool,
    pub ready: bool,
    pub visual_active: bool,
    pub track_title: Option<String>,
    /// Transient informational text ("No tracks", "skipping", ...).
    pub status: Option<String>,
    pub volume: u8,
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonState {
    #[serde(default)]
    pub rev: u64,
    pub feeds: Vec<FeedDescriptor>,
    pub modes: Vec<String>,
    pub scanner: ScannerView,
    pub ambient: AmbientView,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Length of the first frame in `data` once all of it has arrived.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        let len = 4 + u32::from_be_bytes(header) as usize;
        (data.len() >= len).then_some(len)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
