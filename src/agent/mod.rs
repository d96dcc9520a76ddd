//! Device-side agent: authenticates, reports health, keeps the content cache
//! in step with the resolved playlist and drives the display.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod display;
pub mod error;
pub mod metrics;
pub mod player;

use chrono::{DurationRound, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::protocol::{
    Artifact, CommandAck, DeviceCommand, HeartbeatReport, PendingCommand, ResolvedPlaylist,
};
use backoff::Backoff;
use cache::{ContentCache, DownloadProgress};
use client::{DeviceApi, Session};
use config::AgentConfig;
use display::{DisplayBackend, PlayableItem, QuiltLayout};
use error::{AgentError, AgentResult};
use metrics::MetricsCollector;
use player::{Playback, PlayerEvent, PlayerHandle};

/// Executed command ids remembered for re-acknowledgement.
const COMMAND_MEMORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unregistered,
    Authenticating,
    Syncing,
    Playing,
    Retrying,
    Faulted,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Unregistered => "unregistered",
            AgentState::Authenticating => "authenticating",
            AgentState::Syncing => "syncing",
            AgentState::Playing => "playing",
            AgentState::Retrying => "retrying",
            AgentState::Faulted => "faulted",
        }
    }
}

struct Download {
    handle: AbortHandle,
    received: u64,
    total: u64,
}

struct DownloadDone {
    sha256: String,
    result: AgentResult<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FollowUp {
    Resync,
    Restart,
}

/// Acks we already sent, so a redelivered command is acknowledged again
/// without running twice.
#[derive(Default)]
struct CommandLog {
    acks: HashMap<String, CommandAck>,
    order: VecDeque<String>,
}

impl CommandLog {
    fn get(&self, id: &str) -> Option<&CommandAck> {
        self.acks.get(id)
    }

    fn insert(&mut self, id: String, ack: CommandAck) {
        if self.acks.insert(id.clone(), ack).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > COMMAND_MEMORY {
            if let Some(old) = self.order.pop_front() {
                self.acks.remove(&old);
            }
        }
    }
}

enum Wake {
    Heartbeat,
    Commands,
    Download(DownloadDone),
    Progress(DownloadProgress),
    Player(PlayerEvent),
}

pub struct Agent<A: DeviceApi> {
    config: AgentConfig,
    api: Arc<A>,
    cache: Arc<ContentCache>,
    player: PlayerHandle,
    player_events: mpsc::Receiver<PlayerEvent>,
    metrics: MetricsCollector,

    state: AgentState,
    session: Option<Session>,
    fault: Option<AgentError>,
    backoff: Backoff,
    heartbeat_tick: Interval,
    command_tick: Interval,

    /// Last known good playlist. Kept when the server says nothing is scheduled.
    playlist: Option<ResolvedPlaylist>,
    downloads: HashMap<String, Download>,
    done_tx: mpsc::Sender<DownloadDone>,
    done_rx: mpsc::Receiver<DownloadDone>,
    progress_tx: mpsc::Sender<DownloadProgress>,
    progress_rx: mpsc::Receiver<DownloadProgress>,
    integrity_failures: HashMap<String, u32>,
    /// Failed for another reason; retried at the next sync.
    deferred: HashSet<String>,

    executed: CommandLog,
    error_count: i64,
    last_error: Option<String>,
    last_latency_ms: Option<f64>,
}

impl<A: DeviceApi> Agent<A> {
    pub async fn new(config: AgentConfig, api: A, backend: Box<dyn DisplayBackend>) -> AgentResult<Self> {
        let cache = ContentCache::open(&config.cache_dir, config.max_cache_bytes()).await?;
        let (player, player_events) = player::spawn(backend);
        let (done_tx, done_rx) = mpsc::channel(32);
        let (progress_tx, progress_rx) = mpsc::channel(256);

        let backoff = Backoff::new(
            Duration::from_secs(config.backoff_base_secs),
            config.backoff_ceiling(),
        );
        let heartbeat_tick = ticker(config.heartbeat_interval());
        let command_tick = ticker(config.command_poll_interval());

        Ok(Agent {
            config,
            api: Arc::new(api),
            cache: Arc::new(cache),
            player,
            player_events,
            metrics: MetricsCollector::new(),
            state: AgentState::Unregistered,
            session: None,
            fault: None,
            backoff,
            heartbeat_tick,
            command_tick,
            playlist: None,
            downloads: HashMap::new(),
            done_tx,
            done_rx,
            progress_tx,
            progress_rx,
            integrity_failures: HashMap::new(),
            deferred: HashSet::new(),
            executed: CommandLog::default(),
            error_count: 0,
            last_error: None,
            last_latency_ms: None,
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn playlist(&self) -> Option<&ResolvedPlaylist> {
        self.playlist.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn player(&self) -> &PlayerHandle {
        &self.player
    }

    pub fn active_downloads(&self) -> usize {
        self.downloads.len()
    }

    /// Runs until `shutdown` resolves or the agent faults. A fault is
    /// returned as the error; the agent never recovers from one by itself.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> AgentResult<()> {
        tokio::pin!(shutdown);
        loop {
            if self.state == AgentState::Faulted {
                self.shutdown().await;
                return Err(self
                    .fault
                    .take()
                    .unwrap_or_else(|| AgentError::Protocol("agent faulted".into())));
            }
            let stop = tokio::select! {
                _ = &mut shutdown => true,
                _ = self.step() => false,
            };
            if stop {
                tracing::info!("Agent shutting down");
                self.shutdown().await;
                return Ok(());
            }
        }
    }

    /// Performs the work of the current state once.
    pub async fn step(&mut self) {
        match self.state {
            AgentState::Unregistered => {
                self.session = None;
                self.transition(AgentState::Authenticating);
            }
            AgentState::Authenticating => match self.authenticate().await {
                Ok(()) => self.transition(AgentState::Syncing),
                Err(e) => self.fail(e).await,
            },
            AgentState::Syncing => match self.sync().await {
                Ok(()) => self.transition(AgentState::Playing),
                Err(e) => self.fail(e).await,
            },
            AgentState::Playing => self.wait_and_handle().await,
            AgentState::Retrying => {
                let delay = self.backoff.next_delay();
                tracing::debug!(attempt = self.backoff.attempt(), "Retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                let next = if self.session.is_some() {
                    AgentState::Syncing
                } else {
                    AgentState::Authenticating
                };
                self.transition(next);
            }
            AgentState::Faulted => {}
        }
    }

    fn transition(&mut self, next: AgentState) {
        if self.state != next {
            tracing::debug!("Agent {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }

    async fn fail(&mut self, e: AgentError) {
        if e.is_fatal() {
            tracing::error!("Agent faulted: {}", e);
            self.abort_downloads();
            self.player.stop().await;
            self.session = None;
            self.fault = Some(e);
            self.transition(AgentState::Faulted);
            return;
        }
        match &e {
            AgentError::Unauthenticated => {
                tracing::info!("Token rejected; re-authenticating");
                self.session = None;
            }
            e if e.is_transient() => tracing::warn!("{}", e),
            e => {
                tracing::warn!("{}", e);
                self.record_error(e.to_string());
            }
        }
        self.transition(AgentState::Retrying);
    }

    fn record_error(&mut self, message: String) {
        self.error_count += 1;
        self.last_error = Some(message);
    }

    // ─── Authenticating ─────────────────────────────────────────────────────

    async fn authenticate(&mut self) -> AgentResult<()> {
        let hardware_id = self.config.hardware_id.as_deref().unwrap_or("");
        let secret = self.config.device_secret.as_deref().unwrap_or("");
        tracing::info!("Authenticating as {}", hardware_id);
        let auth = self.api.authenticate(hardware_id, secret).await?;
        tracing::info!(device_id = %auth.device_id, "Authenticated");
        self.session = Some(Session::from_auth(auth, Utc::now()));
        Ok(())
    }

    fn current_session(&mut self) -> AgentResult<Session> {
        match &self.session {
            Some(s) if !s.is_expired(Utc::now()) => Ok(s.clone()),
            Some(_) => {
                self.session = None;
                Err(AgentError::Unauthenticated)
            }
            None => Err(AgentError::Unauthenticated),
        }
    }

    // ─── Syncing ────────────────────────────────────────────────────────────

    async fn sync(&mut self) -> AgentResult<()> {
        let session = self.current_session()?;
        self.deferred.clear();
        self.send_heartbeat(&session).await?;

        match self.api.playlist(&session).await? {
            Some(playlist) => {
                if self.playlist.as_ref().map(|p| &p.id) != Some(&playlist.id) {
                    tracing::info!(
                        playlist_id = %playlist.id,
                        items = playlist.items.len(),
                        "Playlist changed to {:?}",
                        playlist.name
                    );
                }
                self.playlist = Some(playlist);
            }
            None => tracing::debug!("Nothing scheduled; holding the current playlist"),
        }

        self.reconcile().await?;
        self.backoff.reset();
        self.heartbeat_tick.reset();
        Ok(())
    }

    async fn send_heartbeat(&mut self, session: &Session) -> AgentResult<()> {
        let sample = self.metrics.sample();
        let now_playing = self.player.now_playing();
        let now = Utc::now();

        let report = HeartbeatReport {
            // Millisecond precision so a retried report keeps the same key.
            time: Some(now.duration_trunc(chrono::Duration::milliseconds(1)).unwrap_or(now)),
            cpu_usage_percent: sample.cpu_usage_percent,
            memory_usage_percent: sample.memory_usage_percent,
            storage_used_percent: sample.storage_used_percent,
            temperature_celsius: sample.temperature_celsius,
            latency_ms: self.last_latency_ms,
            current_playlist_id: now_playing.playlist_id.clone(),
            current_asset_id: now_playing.asset_id.clone(),
            playback_position_sec: now_playing.position_secs(),
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            firmware_version: Some(self.config.firmware_version.clone()),
            client_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            network_info: Some(metrics::network_info()),
            ..Default::default()
        };

        let started = std::time::Instant::now();
        self.api.heartbeat(session, &report).await?;
        self.last_latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
        self.error_count = 0;
        self.last_error = None;
        Ok(())
    }

    /// Artifacts the current playlist needs on this display, by item.
    fn wanted(&self, playlist: &ResolvedPlaylist) -> Vec<(Artifact, Option<QuiltLayout>)> {
        playlist
            .items
            .iter()
            .map(|item| {
                let (artifact, quilt) = self.config.display_type.select_artifact(item);
                let mut artifact = artifact.clone();
                artifact.sha256 = artifact.sha256.to_ascii_lowercase();
                (artifact, quilt)
            })
            .collect()
    }

    /// Brings the cache and downloads in line with the current playlist and
    /// hands the player whatever is ready.
    async fn reconcile(&mut self) -> AgentResult<()> {
        let Some(playlist) = self.playlist.clone() else {
            return Ok(());
        };
        let wanted = self.wanted(&playlist);
        let needed: HashSet<String> = wanted.iter().map(|(a, _)| a.sha256.clone()).collect();

        self.cache.set_pinned(needed.clone());
        self.cache
            .touch(needed.iter().map(String::as_str), Utc::now())
            .await?;

        self.downloads.retain(|sha, download| {
            let keep = needed.contains(sha);
            if !keep {
                tracing::debug!("Abandoning download of {}", sha);
                download.handle.abort();
            }
            keep
        });
        self.integrity_failures.retain(|sha, _| needed.contains(sha));

        let mut queued = HashSet::new();
        for (artifact, _) in &wanted {
            let sha = &artifact.sha256;
            if !queued.insert(sha.clone())
                || self.downloads.contains_key(sha)
                || self.deferred.contains(sha)
                || self.gave_up_on(sha)
                || self.cache.contains(sha).await
            {
                continue;
            }
            self.spawn_download(artifact);
        }

        self.refresh_playback(&playlist, &wanted).await;
        Ok(())
    }

    fn gave_up_on(&self, sha: &str) -> bool {
        self.integrity_failures.get(sha).copied().unwrap_or(0) >= self.config.max_integrity_retries
    }

    fn spawn_download(&mut self, artifact: &Artifact) {
        let sha = artifact.sha256.clone();
        let url = artifact.url.clone();
        let size = artifact.size.max(0) as u64;
        let api = Arc::clone(&self.api);
        let cache = Arc::clone(&self.cache);
        let done = self.done_tx.clone();
        let progress = self.progress_tx.clone();

        tracing::info!("Downloading {} ({} bytes)", sha, size);
        let key = sha.clone();
        let task = tokio::spawn(async move {
            let result = match api.fetch_artifact(&url).await {
                Ok(body) => cache.store(&key, size, body, Some(progress), Utc::now()).await,
                Err(e) => Err(e),
            };
            let _ = done.send(DownloadDone { sha256: key, result }).await;
        });
        self.downloads.insert(
            sha,
            Download {
                handle: task.abort_handle(),
                received: 0,
                total: size,
            },
        );
    }

    async fn refresh_playback(&mut self, playlist: &ResolvedPlaylist, wanted: &[(Artifact, Option<QuiltLayout>)]) {
        let mut items = Vec::new();
        let mut settled = true;
        for (item, (artifact, quilt)) in playlist.items.iter().zip(wanted) {
            match self.cache.get(&artifact.sha256).await {
                Some(path) => items.push(PlayableItem {
                    asset_id: item.asset_id.clone(),
                    path,
                    duration: Duration::from_secs(item.duration_seconds.max(1) as u64),
                    transition: item.transition_override.unwrap_or(playlist.transition_type),
                    transition_ms: playlist.transition_duration_ms.max(0) as u64,
                    quilt: *quilt,
                }),
                None if self.gave_up_on(&artifact.sha256) => {}
                None => settled = false,
            }
        }

        // Keep showing the old content until the new playlist is complete,
        // unless there is nothing on screen at all.
        let idle = self.player.now_playing().asset_id.is_none();
        if !settled && !(idle && !items.is_empty()) {
            return;
        }
        if items.is_empty() {
            self.player.stop().await;
            return;
        }
        self.player
            .load(Playback {
                playlist_id: playlist.id.clone(),
                items,
                loop_mode: playlist.loop_mode,
                shuffle: playlist.shuffle_mode,
            })
            .await;
    }

    fn abort_downloads(&mut self) {
        for (_, download) in self.downloads.drain() {
            download.handle.abort();
        }
    }

    // ─── Playing ────────────────────────────────────────────────────────────

    async fn wait_and_handle(&mut self) {
        let wake = tokio::select! {
            _ = self.heartbeat_tick.tick() => Wake::Heartbeat,
            _ = self.command_tick.tick() => Wake::Commands,
            Some(done) = self.done_rx.recv() => Wake::Download(done),
            Some(progress) = self.progress_rx.recv() => Wake::Progress(progress),
            Some(event) = self.player_events.recv() => Wake::Player(event),
        };

        match wake {
            Wake::Heartbeat => self.transition(AgentState::Syncing),
            Wake::Commands => self.handle_commands().await,
            Wake::Download(done) => self.on_download_done(done).await,
            Wake::Progress(p) => {
                if let Some(d) = self.downloads.get_mut(&p.sha256) {
                    d.received = p.received;
                    d.total = p.total.max(d.total);
                    tracing::trace!("{}: {}/{} bytes", p.sha256, d.received, d.total);
                }
            }
            Wake::Player(event) => self.on_player_event(event),
        }
    }

    async fn on_download_done(&mut self, done: DownloadDone) {
        if self.downloads.remove(&done.sha256).is_none() {
            // Abandoned while finishing.
            return;
        }
        match done.result {
            Ok(_) => {
                tracing::info!("Downloaded {}", done.sha256);
                self.integrity_failures.remove(&done.sha256);
            }
            Err(AgentError::IntegrityFailure { expected, actual }) => {
                let failures = self.integrity_failures.entry(expected.clone()).or_insert(0);
                *failures += 1;
                let failures = *failures;
                if failures >= self.config.max_integrity_retries {
                    tracing::error!("Giving up on {} after {} integrity failures", expected, failures);
                    self.record_error(format!(
                        "artifact {expected} failed verification {failures} times (last digest {actual})"
                    ));
                } else {
                    tracing::warn!("Integrity check failed for {} (attempt {}), retrying", expected, failures);
                }
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("Download of {} failed: {}", done.sha256, e);
                self.deferred.insert(done.sha256);
            }
            Err(e) => {
                tracing::warn!("Download of {} failed: {}", done.sha256, e);
                self.record_error(e.to_string());
                self.deferred.insert(done.sha256);
            }
        }
        if let Err(e) = self.reconcile().await {
            self.fail(e).await;
        }
    }

    fn on_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::ItemStarted { asset_id, .. } => tracing::debug!("Showing {}", asset_id),
            PlayerEvent::PassCompleted { looping: false, .. } => {
                tracing::debug!("Playlist pass complete; re-syncing");
                self.transition(AgentState::Syncing);
            }
            PlayerEvent::PassCompleted { .. } => {}
            PlayerEvent::DisplayError(message) => self.record_error(message),
        }
    }

    // ─── Commands ───────────────────────────────────────────────────────────

    /// Polls, executes and acknowledges pending commands, then applies any
    /// restart or re-sync they asked for.
    pub async fn handle_commands(&mut self) {
        match self.process_commands().await {
            Ok(Some(FollowUp::Restart)) => self.soft_restart().await,
            Ok(Some(FollowUp::Resync)) => self.transition(AgentState::Syncing),
            Ok(None) => {}
            Err(e) => self.fail(e).await,
        }
    }

    async fn process_commands(&mut self) -> AgentResult<Option<FollowUp>> {
        let session = self.current_session()?;
        let pending = self.api.poll_commands(&session).await?;
        let mut follow_up = None;

        for cmd in pending {
            if let Some(ack) = self.executed.get(&cmd.command_id).cloned() {
                tracing::debug!("Command {} redelivered; acknowledging again", cmd.command_id);
                self.api.ack_command(&session, &cmd.command_id, &ack).await?;
                continue;
            }
            tracing::info!(command_id = %cmd.command_id, kind = %cmd.kind, "Executing command");
            let (ack, next) = self.execute(&cmd).await;
            self.executed.insert(cmd.command_id.clone(), ack.clone());
            self.api.ack_command(&session, &cmd.command_id, &ack).await?;
            follow_up = follow_up.max(next);
        }
        Ok(follow_up)
    }

    async fn execute(&mut self, cmd: &PendingCommand) -> (CommandAck, Option<FollowUp>) {
        let command = match DeviceCommand::from_parts(cmd.kind, &cmd.params) {
            Ok(command) => command,
            Err(e) => return (failure(e.to_string()), None),
        };

        match command {
            DeviceCommand::Restart => (success("restarting", None), Some(FollowUp::Restart)),
            DeviceCommand::ClearCache => match self.cache.clear().await {
                Ok(removed) => (
                    success("cache cleared", Some(serde_json::json!({ "removed": removed }))),
                    None,
                ),
                Err(e) => (failure(e.to_string()), None),
            },
            DeviceCommand::Screenshot => match self.player.screenshot().await {
                Ok(Some(png)) => match self.save_screenshot(&cmd.command_id, &png).await {
                    Ok(data) => (success("screenshot captured", Some(data)), None),
                    Err(e) => (failure(e.to_string()), None),
                },
                Ok(None) => (success("display has no frame to capture", None), None),
                Err(e) => (failure(e.to_string()), None),
            },
            DeviceCommand::UpdatePlaylist { playlist_id } => (
                success(
                    "re-syncing",
                    Some(serde_json::json!({ "playlist_id": playlist_id })),
                ),
                Some(FollowUp::Resync),
            ),
        }
    }

    async fn save_screenshot(&self, command_id: &str, png: &[u8]) -> AgentResult<serde_json::Value> {
        use sha2::{Digest, Sha256};

        let dir = self.cache.root().join("screenshots");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{command_id}.png"));
        tokio::fs::write(&path, png).await?;
        Ok(serde_json::json!({
            "path": path.display().to_string(),
            "size": png.len(),
            "sha256": hex::encode(Sha256::digest(png)),
        }))
    }

    async fn soft_restart(&mut self) {
        tracing::info!("Soft restart");
        self.abort_downloads();
        self.session = None;
        if let Err(e) = self.player.reinitialize().await {
            tracing::error!("Display failed to come back: {}", e);
            self.record_error(e.to_string());
        }
        self.backoff.reset();
        self.transition(AgentState::Unregistered);
    }

    async fn shutdown(&mut self) {
        self.abort_downloads();
        self.player.stop().await;
    }
}

fn ticker(period: Duration) -> Interval {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

fn success(message: &str, data: Option<serde_json::Value>) -> CommandAck {
    CommandAck {
        success: true,
        message: Some(message.to_string()),
        data,
    }
}

fn failure(message: String) -> CommandAck {
    CommandAck {
        success: false,
        message: Some(message),
        data: None,
    }
}
