/// mpv IPC driver with separated reader/writer tasks.
///
/// ```text
///   MpvDriver::connect()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → event_tx channel
/// ```
///
/// Two drivers run side by side, one per `MpvRole`: the scanner's single-URL
/// audio output and the ambient playlist player.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use scanner_proto::platform::{self, MpvRole};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `reason` of an end-file event ("eof", "error", "stop", "redirect", ...).
    pub fn end_file_reason(&self) -> Option<&str> {
        if self.event_name()? != "end-file" {
            return None;
        }
        self.raw.get("reason")?.as_str()
    }

    pub fn file_error(&self) -> Option<&str> {
        self.raw.get("file_error")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn loadfile(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// `level` on the 0–100 UI scale.
    pub async fn set_volume(&self, level: u8) -> anyhow::Result<()> {
        let pct = f64::from(level.min(100));
        self.send(json!(["set_property", "volume", pct])).await?;
        Ok(())
    }

    pub async fn playlist_play_index(&self, index: usize) -> anyhow::Result<()> {
        self.send(json!(["playlist-play-index", index])).await?;
        Ok(())
    }

    pub async fn get_property(&self, name: &str) -> anyhow::Result<Value> {
        let resp = self.send(json!(["get_property", name])).await?;
        Ok(resp.get("data").cloned().unwrap_or(Value::Null))
    }

    pub async fn observe(&self, id: u64, name: &str) {
        match self.send(json!(["observe_property", id, name])).await {
            Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
            Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
        }
    }

    /// Health-check: returns Ok(()) if mpv is responsive.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.send(json!(["get_property", "volume"])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns one mpv child process.  The process is killed when the driver is
/// dropped.
pub struct MpvDriver {
    role: MpvRole,
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: u8,
}

impl MpvDriver {
    pub fn new(role: MpvRole) -> Self {
        Self {
            role,
            socket_name: platform::mpv_socket_name(role),
            process: None,
            last_volume: 50,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Start a fresh mpv process (killing any previous one).  Returns as soon
    /// as the process is spawned; the IPC socket shows up a little later.
    pub async fn spawn(&mut self) -> anyhow::Result<()> {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }

        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket_name).await;

        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv[{}]: spawning {}", self.role.as_str(), mpv_binary.display());

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(platform::mpv_socket_arg(self.role))
            .arg(format!("--volume={}", self.last_volume.min(100)))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    /// One connection attempt to the IPC endpoint.
    pub async fn connect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
        #[cfg(unix)]
        let stream = tokio::net::UnixStream::connect(&self.socket_name).await?;

        #[cfg(windows)]
        let stream = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(format!(r"\\.\pipe\{}", self.socket_name))?;

        debug!("mpv[{}]: connected to IPC endpoint", self.role.as_str());
        Ok(start_io_tasks(stream, event_tx))
    }

    /// Spawn and wait (up to 5 s) for the IPC endpoint to accept us.
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn().await?;
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(handle) = self.connect(event_tx.clone()).await {
                info!("mpv[{}]: IPC ready", self.role.as_str());
                return Ok(handle);
            }
        }
        anyhow::bail!("mpv[{}] IPC endpoint did not appear", self.role.as_str())
    }
}

fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);

    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(Value::as_u64) else {
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                    continue;
                };

                let Some(tx) = pending.lock().await.remove(&req_id) else {
                    debug!("mpv reader: response for unknown req={}", req_id);
                    continue;
                };
                let result = match val["error"].as_str() {
                    Some("success") => Ok(val),
                    other => Err(anyhow::anyhow!(
                        "mpv error: {}",
                        other.unwrap_or("unknown error")
                    )),
                };
                let _ = tx.send(result);
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "read error").await;
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}
