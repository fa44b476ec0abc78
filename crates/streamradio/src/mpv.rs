//! mpv audio backend.
//!
//! Each acquired resource is its own mpv process with its own IPC socket:
//!
//! ```text
//!   MpvBackend::acquire(resource_id)
//!         │
//!         ├── MpvDriver::spawn_and_connect()
//!         │     ├── writer_task   ← MpvRequest via mpsc → socket
//!         │     └── reader_task   ← JSON lines from socket
//!         │                           ├── response (request_id) → oneshot
//!         │                           └── event / property-change → forwarder
//!         └── forwarder        ← MpvEventTranslator → PlaybackEvent{resource_id}
//! ```
//!
//! Releasing a resource aborts its forwarder and watchdog, sends `stop` and
//! kills the process, so nothing it emits afterwards reaches the controller.
//!
//! Platform notes:
//! - Unix:   Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamradio_proto::config::MpvConfig;
use streamradio_proto::platform;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::playback::{
    AudioBackend, AudioResource, PlaybackEvent, PlaybackEventKind, ResourceId, StreamRequest,
};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;

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
}

// ── event translation ─────────────────────────────────────────────────────────

/// Turns the raw mpv event stream of one process into playback events.
///
/// `core-idle` flips to false once audio is flowing; while paused mpv
/// reports core-idle too, so Started is only emitted when not paused.
#[derive(Debug, Default)]
pub struct MpvEventTranslator {
    paused: bool,
    core_idle: Option<bool>,
    playing: bool,
}

impl MpvEventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, evt: &MpvEvent) -> Option<PlaybackEventKind> {
        if let Some((obs_id, data)) = evt.as_property_change() {
            return match obs_id {
                OBS_PAUSE => {
                    let paused = data.as_bool().unwrap_or(false);
                    if paused == self.paused {
                        return None;
                    }
                    self.paused = paused;
                    if paused {
                        self.playing = false;
                        Some(PlaybackEventKind::Paused)
                    } else if self.core_idle == Some(false) {
                        self.playing = true;
                        Some(PlaybackEventKind::Started)
                    } else {
                        None
                    }
                }
                OBS_CORE_IDLE => {
                    let idle = data.as_bool();
                    if idle == self.core_idle {
                        return None;
                    }
                    self.core_idle = idle;
                    if idle == Some(false) && !self.paused && !self.playing {
                        self.playing = true;
                        Some(PlaybackEventKind::Started)
                    } else {
                        if idle == Some(true) {
                            self.playing = false;
                        }
                        None
                    }
                }
                _ => None,
            };
        }

        match evt.event_name() {
            Some("end-file") => {
                let reason = evt
                    .raw
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                self.playing = false;
                match reason {
                    "eof" | "quit" => Some(PlaybackEventKind::Ended),
                    "error" | "network" => {
                        let detail = evt
                            .raw
                            .get("file_error")
                            .and_then(|v| v.as_str())
                            .unwrap_or(reason);
                        Some(PlaybackEventKind::Failed(format!("stream error: {detail}")))
                    }
                    // "stop" / "redirect": our own stop or a playlist hop.
                    _ => None,
                }
            }
            _ => None,
        }
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

        tokio::time::timeout(Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load_stream(&self, url: &str) -> anyhow::Result<()> {
        debug!("mpv: sending loadfile command for url={}", url);
        let resp = self.send(json!(["loadfile", url])).await?;
        debug!("mpv: loadfile response: {:?}", resp);
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

    /// Register the observations the translator relies on.  mpv pushes a
    /// property-change right away with the current value and again on every
    /// change.
    pub async fn observe_playback_properties(&self) {
        for (id, name) in [(OBS_CORE_IDLE, "core-idle"), (OBS_PAUSE, "pause")] {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns one mpv child process.  The child is spawned with `kill_on_drop`,
/// so dropping the driver cannot leave the process behind.
pub struct MpvDriver {
    pub socket_name: String,
    process: Option<tokio::process::Child>,
    volume: f32,
}

impl MpvDriver {
    pub fn new(resource: ResourceId, volume: f32) -> Self {
        Self {
            socket_name: platform::mpv_socket_name(resource),
            process: None,
            volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!("mpv process exited: {}", status);
                false
            }
            Some(Err(e)) => {
                warn!("mpv process_alive check failed: {}", e);
                false
            }
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
    }

    fn command(&self, mpv_binary: &std::path::Path) -> anyhow::Result<tokio::process::Command> {
        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let ipc_arg = platform::mpv_socket_arg(&self.socket_name);

        let data_dir = platform::data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let stderr_path = data_dir.join("mpv-stderr.log");
        let stderr_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_path)?;

        let mut cmd = tokio::process::Command::new(mpv_binary);
        cmd.arg("--no-video")
            .arg("--idle=yes")
            .arg(&ipc_arg)
            .arg("--quiet")
            .arg(&vol_arg)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(stderr_file)
            .kill_on_drop(true);
        Ok(cmd)
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let child = self.command(&mpv_binary)?.spawn()?;
        info!("mpv: spawned {:?} pid {:?}", mpv_binary, child.id());
        self.process = Some(child);

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
            if !self.process_alive() {
                anyhow::bail!("mpv exited before opening its IPC socket");
            }
        }
        if !socket_path.exists() {
            self.kill().await;
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to {}", self.socket_name);
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let child = self.command(&mpv_binary)?.spawn()?;
        info!("mpv: spawned {:?} pid {:?}", mpv_binary, child.id());
        self.process = Some(child);

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe {}", pipe_path);
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        self.kill().await;
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
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

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        debug!("mpv reader: event receiver gone");
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── backend ───────────────────────────────────────────────────────────────────

pub struct MpvBackend {
    config: MpvConfig,
    events: mpsc::Sender<PlaybackEvent>,
}

impl MpvBackend {
    pub fn new(config: MpvConfig, events: mpsc::Sender<PlaybackEvent>) -> Self {
        Self { config, events }
    }
}

#[async_trait]
impl AudioBackend for MpvBackend {
    async fn acquire(
        &self,
        resource: ResourceId,
        request: &StreamRequest,
    ) -> anyhow::Result<Box<dyn AudioResource>> {
        // mpv has no notion of cross-origin access; the flag only matters to
        // browser-style backends.
        debug!("mpv: acquire resource {} cross_origin={}", resource, request.cross_origin);

        let mut driver = MpvDriver::new(resource, self.config.default_volume);
        let (raw_tx, raw_rx) = mpsc::channel::<MpvEvent>(64);
        let handle = driver.spawn_and_connect(raw_tx).await?;
        handle.observe_playback_properties().await;

        let settled = Arc::new(AtomicBool::new(false));
        let forwarder = tokio::spawn(forward_events(
            resource,
            raw_rx,
            self.events.clone(),
            settled.clone(),
        ));

        Ok(Box::new(MpvResource {
            id: resource,
            url: request.url.clone(),
            driver,
            handle,
            events: self.events.clone(),
            settled,
            forwarder,
            watchdog: None,
            start_timeout: Duration::from_secs(self.config.start_timeout_secs),
        }))
    }
}

/// Translate one process's raw events and tag them with its resource id.
/// When mpv goes away without an end-file the stream is reported failed.
async fn forward_events(
    resource: ResourceId,
    mut raw_rx: mpsc::Receiver<MpvEvent>,
    events: mpsc::Sender<PlaybackEvent>,
    settled: Arc<AtomicBool>,
) {
    let mut translator = MpvEventTranslator::new();
    while let Some(evt) = raw_rx.recv().await {
        let Some(kind) = translator.translate(&evt) else {
            continue;
        };
        if matches!(kind, PlaybackEventKind::Started | PlaybackEventKind::Paused) {
            settled.store(true, Ordering::Relaxed);
        }
        let terminal = matches!(kind, PlaybackEventKind::Ended | PlaybackEventKind::Failed(_));
        if events.send(PlaybackEvent { resource, kind }).await.is_err() || terminal {
            return;
        }
    }
    let _ = events
        .send(PlaybackEvent {
            resource,
            kind: PlaybackEventKind::Failed("mpv connection closed".to_string()),
        })
        .await;
}

pub struct MpvResource {
    id: ResourceId,
    url: String,
    driver: MpvDriver,
    handle: MpvHandle,
    events: mpsc::Sender<PlaybackEvent>,
    /// Set once the stream produced audio or was paused.
    settled: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
    watchdog: Option<JoinHandle<()>>,
    start_timeout: Duration,
}

impl MpvResource {
    fn arm_watchdog(&mut self) {
        if let Some(prev) = self.watchdog.take() {
            prev.abort();
        }
        let resource = self.id;
        let timeout = self.start_timeout;
        let settled = self.settled.clone();
        let events = self.events.clone();
        self.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !settled.load(Ordering::Relaxed) {
                warn!("mpv: no audio after {}s on resource {}", timeout.as_secs(), resource);
                let _ = events
                    .send(PlaybackEvent {
                        resource,
                        kind: PlaybackEventKind::Failed(format!(
                            "no audio after {}s",
                            timeout.as_secs()
                        )),
                    })
                    .await;
            }
        }));
    }
}

#[async_trait]
impl AudioResource for MpvResource {
    async fn start(&mut self) -> anyhow::Result<()> {
        self.handle.load_stream(&self.url).await?;
        self.arm_watchdog();
        Ok(())
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        self.handle.set_pause(true).await
    }

    async fn resume(&mut self) -> anyhow::Result<()> {
        self.handle.set_pause(false).await
    }

    async fn release(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        self.forwarder.abort();
        if self.driver.process_alive() {
            if let Err(e) = self.handle.stop().await {
                debug!("mpv: stop on release failed: {}", e);
            }
        }
        self.driver.kill().await;
        info!("mpv: released resource {}", self.id);
    }
}

impl Drop for MpvResource {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        self.forwarder.abort();
    }
}
