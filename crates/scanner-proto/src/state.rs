use crate::config::Config;
use crate::protocol::{AmbientView, DaemonState, FeedDescriptor, FeedKind, ScannerView};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Shared, read-mostly snapshot of both controllers.  The core loop is the
/// only writer; socket and HTTP handlers read it.
pub struct StateManager {
    state: Arc<RwLock<DaemonState>>,
}

impl StateManager {
    pub fn new(feeds: Vec<FeedDescriptor>, modes: Vec<String>) -> Self {
        let state = DaemonState {
            rev: 1,
            feeds,
            modes,
            scanner: ScannerView::default(),
            ambient: AmbientView::default(),
        };

        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn get_state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    /// Store fresh controller views.  Returns true (and bumps `rev`) only
    /// when something actually changed.
    pub async fn publish(&self, scanner: ScannerView, ambient: AmbientView) -> bool {
        let mut state = self.state.write().await;
        if state.scanner == scanner && state.ambient == ambient {
            return false;
        }
        state.scanner = scanner;
        state.ambient = ambient;
        state.rev += 1;
        true
    }
}

// ── TOML feed loader ──────────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[feed]]` table.  A feed names
/// either a `url` (direct stream) or a `system_id` (call queue), never both.
#[derive(Debug, serde::Deserialize)]
struct TomlFeedFile {
    feed: Vec<TomlFeed>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlFeed {
    city: String,
    state: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    system_id: Option<String>,
}

pub fn parse_feeds_from_toml_str(content: &str) -> anyhow::Result<Vec<FeedDescriptor>> {
    let file: TomlFeedFile = toml::from_str(content)?;
    file.feed
        .into_iter()
        .map(|f| {
            let kind = match (f.url, f.system_id) {
                (Some(url), None) => FeedKind::DirectStream { url },
                (None, Some(system_id)) => FeedKind::CallQueue { system_id },
                (Some(_), Some(_)) => {
                    anyhow::bail!("feed '{}, {}' has both url and system_id", f.city, f.state)
                }
                (None, None) => {
                    anyhow::bail!("feed '{}, {}' needs a url or a system_id", f.city, f.state)
                }
            };
            Ok(FeedDescriptor {
                city: f.city,
                state: f.state,
                description: f.description,
                kind,
            })
        })
        .collect()
}

pub fn load_feeds_from_toml(path: &Path) -> anyhow::Result<Vec<FeedDescriptor>> {
    let content = std::fs::read_to_string(path)?;
    parse_feeds_from_toml_str(&content)
}

/// Feed list for this run: the configured TOML file when present, otherwise
/// the built-in list.  A file that fails to parse is an error rather than a
/// silent fallback.
pub fn load_feeds(config: &Config) -> anyhow::Result<Vec<FeedDescriptor>> {
    let path = &config.feeds.feeds_toml;
    if path.exists() {
        let feeds = load_feeds_from_toml(path)?;
        info!("Loaded {} feeds from {:?}", feeds.len(), path);
        return Ok(feeds);
    }
    warn!("No feed file at {:?}, using built-in feeds", path);
    parse_feeds_from_toml_str(BUILTIN_FEEDS)
}

const BUILTIN_FEEDS: &str = r#"
[[feed]]
city = "Seattle"
state = "WA"
description = "King County fire and EMS"
system_id = "kcers1b"

[[feed]]
city = "Chicago"
state = "IL"
description = "Chicago police zones"
system_id = "chi_cpd"

[[feed]]
city = "San Francisco"
state = "CA"
description = "SF fire dispatch"
system_id = "sfp25"

[[feed]]
city = "Boston"
state = "MA"
description = "Boston police district dispatch"
url = "https://broadcastify.cdnstream1.com/29045"
"#;
