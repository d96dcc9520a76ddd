use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::display::{DisplayBackend, PlayableItem};
use super::error::AgentResult;

/// Shortest time an item stays on screen.
const MIN_ITEM_DURATION: Duration = Duration::from_secs(1);

/// A playlist ready to show: every item already has a verified local file.
#[derive(Debug, Clone, PartialEq)]
pub struct Playback {
    pub playlist_id: String,
    pub items: Vec<PlayableItem>,
    pub loop_mode: bool,
    pub shuffle: bool,
}

pub enum PlayerCommand {
    /// Start playing, unless this exact playback is already running.
    Load(Playback),
    Stop,
    Screenshot(oneshot::Sender<AgentResult<Option<Vec<u8>>>>),
    /// Tear down and bring the display back up.
    Reinitialize(oneshot::Sender<AgentResult<()>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    ItemStarted { playlist_id: String, asset_id: String },
    /// Every item was shown once.
    PassCompleted { playlist_id: String, looping: bool },
    DisplayError(String),
}

/// What's on screen, for heartbeats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NowPlaying {
    pub playlist_id: Option<String>,
    pub asset_id: Option<String>,
    pub started_at: Option<Instant>,
}

impl NowPlaying {
    pub fn position_secs(&self) -> Option<i64> {
        self.started_at.map(|t| t.elapsed().as_secs() as i64)
    }
}

#[derive(Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<PlayerCommand>,
    now_playing: watch::Receiver<NowPlaying>,
}

impl PlayerHandle {
    pub async fn load(&self, playback: Playback) {
        self.send(PlayerCommand::Load(playback)).await;
    }

    pub async fn stop(&self) {
        self.send(PlayerCommand::Stop).await;
    }

    pub async fn screenshot(&self) -> AgentResult<Option<Vec<u8>>> {
        let (reply, rx) = oneshot::channel();
        self.send(PlayerCommand::Screenshot(reply)).await;
        rx.await.unwrap_or(Ok(None))
    }

    pub async fn reinitialize(&self) -> AgentResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(PlayerCommand::Reinitialize(reply)).await;
        rx.await.unwrap_or(Ok(()))
    }

    pub fn now_playing(&self) -> NowPlaying {
        self.now_playing.borrow().clone()
    }

    async fn send(&self, cmd: PlayerCommand) {
        if self.tx.send(cmd).await.is_err() {
            tracing::warn!("Player task has stopped");
        }
    }
}

/// Spawns the playback task. It owns the display backend and runs until every
/// handle is dropped.
pub fn spawn(mut backend: Box<dyn DisplayBackend>) -> (PlayerHandle, mpsc::Receiver<PlayerEvent>) {
    let (tx, rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(NowPlaying::default());

    tokio::spawn(async move {
        if let Err(e) = backend.initialize() {
            tracing::error!("Display initialization failed: {}", e);
            let _ = event_tx.try_send(PlayerEvent::DisplayError(e.to_string()));
        }
        Player {
            backend,
            event_tx,
            status_tx,
            current: None,
            order: Vec::new(),
            cursor: 0,
            deadline: None,
        }
        .run(rx)
        .await;
    });

    (
        PlayerHandle {
            tx,
            now_playing: status_rx,
        },
        event_rx,
    )
}

struct Player {
    backend: Box<dyn DisplayBackend>,
    event_tx: mpsc::Sender<PlayerEvent>,
    status_tx: watch::Sender<NowPlaying>,
    current: Option<Playback>,
    order: Vec<usize>,
    cursor: usize,
    deadline: Option<Instant>,
}

impl Player {
    async fn run(mut self, mut rx: mpsc::Receiver<PlayerCommand>) {
        loop {
            let deadline = self.deadline;
            let next_item = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = next_item => self.advance().await,
            }
        }
        self.backend.shutdown();
        tracing::debug!("Player stopped");
    }

    async fn handle(&mut self, cmd: PlayerCommand) {
        match cmd {
            PlayerCommand::Load(playback) => {
                let running = self.deadline.is_some() && self.current.as_ref() == Some(&playback);
                if running {
                    return;
                }
                if playback.items.is_empty() {
                    self.stop();
                    return;
                }
                tracing::info!(
                    playlist_id = %playback.playlist_id,
                    items = playback.items.len(),
                    "Starting playback"
                );
                self.current = Some(playback);
                self.start_pass();
                self.show_current().await;
            }
            PlayerCommand::Stop => self.stop(),
            PlayerCommand::Screenshot(reply) => {
                let _ = reply.send(self.backend.screenshot());
            }
            PlayerCommand::Reinitialize(reply) => {
                self.backend.shutdown();
                let result = self.backend.initialize();
                if result.is_ok() && self.deadline.is_some() {
                    self.show_current().await;
                }
                let _ = reply.send(result);
            }
        }
    }

    fn stop(&mut self) {
        self.current = None;
        self.deadline = None;
        self.order.clear();
        self.status_tx.send_replace(NowPlaying::default());
    }

    fn start_pass(&mut self) {
        let Some(playback) = &self.current else { return };
        self.order = (0..playback.items.len()).collect();
        if playback.shuffle {
            self.order.shuffle(&mut rand::thread_rng());
        }
        self.cursor = 0;
    }

    async fn advance(&mut self) {
        let Some(playback) = &self.current else {
            self.deadline = None;
            return;
        };
        self.cursor += 1;
        if self.cursor < self.order.len() {
            self.show_current().await;
            return;
        }

        let playlist_id = playback.playlist_id.clone();
        let looping = playback.loop_mode;
        self.notify(PlayerEvent::PassCompleted {
            playlist_id,
            looping,
        });
        if looping {
            self.start_pass();
            self.show_current().await;
        } else {
            // Hold the last frame until told otherwise.
            self.cursor = self.order.len().saturating_sub(1);
            self.deadline = None;
        }
    }

    async fn show_current(&mut self) {
        let Some(playback) = &self.current else { return };
        let Some(item) = self.order.get(self.cursor).and_then(|&i| playback.items.get(i)) else {
            self.deadline = None;
            return;
        };
        let playlist_id = playback.playlist_id.clone();
        let item = item.clone();

        if let Err(e) = self.backend.show(&item) {
            tracing::warn!(asset_id = %item.asset_id, "Display rejected item: {}", e);
            self.notify(PlayerEvent::DisplayError(e.to_string()));
        }
        let now = Instant::now();
        self.deadline = Some(now + item.duration.max(MIN_ITEM_DURATION));
        self.status_tx.send_replace(NowPlaying {
            playlist_id: Some(playlist_id.clone()),
            asset_id: Some(item.asset_id.clone()),
            started_at: Some(now),
        });
        self.notify(PlayerEvent::ItemStarted {
            playlist_id,
            asset_id: item.asset_id,
        });
    }

    /// Events are advisory: the agent only reads them while `Playing`, and
    /// playback must never wait on it.
    fn notify(&self, event: PlayerEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            tracing::trace!("Agent busy, dropping player event {:?}", event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::display::SimulatedDisplay;
    use crate::protocol::TransitionType;
    use std::path::PathBuf;

    fn item(id: &str, secs: u64) -> PlayableItem {
        PlayableItem {
            asset_id: id.into(),
            path: PathBuf::from(format!("/cache/{id}")),
            duration: Duration::from_secs(secs),
            transition: TransitionType::Fade,
            transition_ms: 500,
            quilt: None,
        }
    }

    fn playback(loop_mode: bool) -> Playback {
        Playback {
            playlist_id: "pl-1".into(),
            items: vec![item("a", 2), item("b", 3)],
            loop_mode,
            shuffle: false,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<PlayerEvent>) -> PlayerEvent {
        rx.recv().await.expect("player event")
    }

    #[tokio::test(start_paused = true)]
    async fn plays_in_order_and_honors_durations() {
        let (player, mut events) = spawn(Box::new(SimulatedDisplay::default()));
        player.load(playback(true)).await;

        let started = Instant::now();
        assert_eq!(
            next_event(&mut events).await,
            PlayerEvent::ItemStarted { playlist_id: "pl-1".into(), asset_id: "a".into() }
        );
        assert_eq!(
            next_event(&mut events).await,
            PlayerEvent::ItemStarted { playlist_id: "pl-1".into(), asset_id: "b".into() }
        );
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(
            next_event(&mut events).await,
            PlayerEvent::PassCompleted { playlist_id: "pl-1".into(), looping: true }
        );
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(
            next_event(&mut events).await,
            PlayerEvent::ItemStarted { playlist_id: "pl-1".into(), asset_id: "a".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_looping_playlist_holds_after_one_pass() {
        let (player, mut events) = spawn(Box::new(SimulatedDisplay::default()));
        player.load(playback(false)).await;

        next_event(&mut events).await;
        next_event(&mut events).await;
        assert_eq!(
            next_event(&mut events).await,
            PlayerEvent::PassCompleted { playlist_id: "pl-1".into(), looping: false }
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(player.now_playing().asset_id.as_deref(), Some("b"));

        // Loading it again starts a fresh pass.
        player.load(playback(false)).await;
        assert_eq!(
            next_event(&mut events).await,
            PlayerEvent::ItemStarted { playlist_id: "pl-1".into(), asset_id: "a".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reloading_the_running_playlist_does_not_restart_it() {
        let (player, mut events) = spawn(Box::new(SimulatedDisplay::default()));
        player.load(playback(true)).await;
        next_event(&mut events).await;

        player.load(playback(true)).await;
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
        assert_eq!(player.now_playing().asset_id.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_now_playing_and_simulation_has_no_screenshot() {
        let (player, mut events) = spawn(Box::new(SimulatedDisplay::default()));
        player.load(playback(true)).await;
        next_event(&mut events).await;
        assert_eq!(player.screenshot().await.unwrap(), None);

        player.stop().await;
        player.reinitialize().await.unwrap();
        assert_eq!(player.now_playing(), NowPlaying::default());
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_playing_when_nobody_reads_events() {
        let (player, _events) = spawn(Box::new(SimulatedDisplay::default()));
        let mut pb = playback(true);
        pb.items = vec![item("a", 1), item("b", 1)];
        player.load(pb).await;

        // Far more item changes than the event channel holds.
        tokio::time::sleep(Duration::from_secs(200)).await;
        let started = player.now_playing().started_at.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn shuffle_shows_every_item_once_per_pass() {
        let (player, mut events) = spawn(Box::new(SimulatedDisplay::default()));
        let mut pb = playback(true);
        pb.shuffle = true;
        pb.items = (0..6).map(|i| item(&format!("x{i}"), 1)).collect();
        player.load(pb).await;

        let mut seen = Vec::new();
        loop {
            match next_event(&mut events).await {
                PlayerEvent::ItemStarted { asset_id, .. } => seen.push(asset_id),
                PlayerEvent::PassCompleted { .. } => break,
                PlayerEvent::DisplayError(e) => panic!("{e}"),
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["x0", "x1", "x2", "x3", "x4", "x5"]);
    }
}
