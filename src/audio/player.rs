use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        session::{CurrentTrack, PlayerPhase, Session, SessionRegistry, SessionState, MAX_LOOP_RETRIES},
        supervisor::{ConnectionSupervisor, DisconnectKind},
        tracker::ElapsedTimeTracker,
        transport::{EngineEvent, SessionId, VoiceGateway, VoiceLocation},
    },
    error::PlaybackError,
    sources::{TrackFetcher, TrackRef},
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tracker_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tracker_interval: Duration::from_secs(1),
        }
    }
}

/// Why a track started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayCause {
    Command,
    QueueAdvance,
    Loop,
    Resume,
}

/// Announcements the command layer may forward to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    NowPlaying {
        session: SessionId,
        track: TrackRef,
        offset: Duration,
        cause: PlayCause,
    },
    Finished {
        session: SessionId,
    },
    ReconnectFailed {
        session: SessionId,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    Started(TrackRef),
    Queued { track: TrackRef, position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub track: TrackRef,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub loop_enabled: bool,
}

/// Point-in-time view of a session, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: PlayerPhase,
    pub connected: bool,
    pub current: Option<TrackRef>,
    pub loop_enabled: bool,
    pub play_now_active: bool,
    pub elapsed_seconds: u64,
    pub queued: usize,
}

/// Per-session playback state machine.
///
/// Every operation locks the session it targets; sessions never contend
/// with each other. Backend events (track end, connection loss) arrive on
/// an internal channel and are handled in order by a per-session worker
/// under the same per-session lock.
pub struct PlaybackEngine {
    registry: SessionRegistry,
    supervisor: ConnectionSupervisor,
    fetcher: Arc<dyn TrackFetcher>,
    notices: broadcast::Sender<SessionNotice>,
    config: EngineConfig,
}

impl PlaybackEngine {
    /// Builds the engine and spawns its event loop on the current runtime.
    pub fn start(gateway: Arc<dyn VoiceGateway>, fetcher: Arc<dyn TrackFetcher>, config: EngineConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(64);

        let engine = Arc::new(Self {
            registry: SessionRegistry::new(),
            supervisor: ConnectionSupervisor::new(gateway, events_tx),
            fetcher,
            notices,
            config,
        });

        tokio::spawn(run_event_loop(Arc::downgrade(&engine), events_rx));
        info!("🎵 Playback engine started");
        engine
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Fetches `url` and plays it immediately, replacing whatever is playing.
    pub async fn play_now(
        &self,
        id: SessionId,
        url: &str,
        requester: Option<VoiceLocation>,
    ) -> Result<TrackRef, PlaybackError> {
        let track = self.fetch(url).await?;

        let session = self.registry.get_or_create(id);
        let mut state = session.lock().await;
        self.ensure_connected(&session, &mut state, requester).await?;

        if state.is_playing() {
            info!("⏹️ Interrupting current track in session {} for play-now", id);
            self.halt_current(&mut state).await;
        }

        state.play_now_active = true;
        if let Err(e) = self.start_playback(&session, &mut state, track.clone(), Duration::ZERO, PlayCause::Command).await {
            state.play_now_active = false;
            return Err(e);
        }
        Ok(track)
    }

    /// Fetches `url` and appends it; starts playback if the session is idle.
    pub async fn enqueue(
        &self,
        id: SessionId,
        url: &str,
        requester: Option<VoiceLocation>,
    ) -> Result<PlayOutcome, PlaybackError> {
        let track = self.fetch(url).await?;

        let session = self.registry.get_or_create(id);
        let mut state = session.lock().await;
        let position = session.queue().push_back(track.clone());
        info!("➕ Queued {} in session {} at position {}", track.source_url(), id, position);

        if state.is_playing() {
            return Ok(PlayOutcome::Queued { track, position });
        }

        self.ensure_connected(&session, &mut state, requester).await?;
        self.play_next_locked(&session, &mut state, PlayCause::Command).await
    }

    pub async fn play_next(&self, id: SessionId) -> Result<PlayOutcome, PlaybackError> {
        let session = self.registry.get_or_create(id);
        let mut state = session.lock().await;
        self.play_next_locked(&session, &mut state, PlayCause::Command).await
    }

    /// Stops the current track and moves on to the next queued one.
    pub async fn skip(&self, id: SessionId) -> Result<PlayOutcome, PlaybackError> {
        let session = self.registry.get_or_create(id);
        let mut state = session.lock().await;
        if !state.is_connected() {
            return Err(PlaybackError::NotConnected);
        }

        if state.is_playing() {
            info!("⏭️ Skipping current track in session {}", id);
            self.halt_current(&mut state).await;
        }
        self.play_next_locked(&session, &mut state, PlayCause::Command).await
    }

    /// Full reset: loop off, playback stopped, queue emptied.
    pub async fn stop(&self, id: SessionId) -> usize {
        let session = self.registry.get_or_create(id);
        let mut state = session.lock().await;

        state.loop_enabled = false;
        state.play_now_active = false;
        self.halt_current(&mut state).await;
        let cleared = session.queue().clear();

        info!("⏹️ Session {} stopped, {} queued track(s) dropped", id, cleared);
        cleared
    }

    pub async fn toggle_loop(&self, id: SessionId) -> bool {
        let session = self.registry.get_or_create(id);
        let mut state = session.lock().await;
        state.loop_enabled = !state.loop_enabled;

        if state.loop_enabled {
            info!("🔂 Loop enabled in session {}", id);
        } else {
            info!("➡️ Loop disabled in session {}", id);
        }
        state.loop_enabled
    }

    pub async fn now_playing(&self, id: SessionId) -> Option<NowPlaying> {
        let session = self.registry.get_or_create(id);
        let state = session.lock().await;
        state.current.as_ref().map(|current| NowPlaying {
            track: current.track.clone(),
            started_at: current.started_at,
            elapsed: state.elapsed,
            loop_enabled: state.loop_enabled,
        })
    }

    pub fn list_queue(&self, id: SessionId) -> Vec<TrackRef> {
        self.registry.get_or_create(id).queue().peek_all()
    }

    /// Joins `location`. Anything playing on a previous connection is halted.
    pub async fn join(&self, id: SessionId, location: Option<VoiceLocation>) -> Result<VoiceLocation, PlaybackError> {
        let session = self.registry.get_or_create(id);
        let mut state = session.lock().await;

        let location = location.ok_or(PlaybackError::NotInVoice)?;
        if state.is_playing() {
            self.halt_current(&mut state).await;
        }
        self.supervisor.join(id, &mut state, Some(location)).await
    }

    /// Leaves voice. The queue is kept for a later join.
    pub async fn leave(&self, id: SessionId) -> Result<(), PlaybackError> {
        let session = self.registry.get_or_create(id);
        let mut state = session.lock().await;
        if !state.is_connected() {
            return Err(PlaybackError::NotConnected);
        }

        state.play_now_active = false;
        self.halt_current(&mut state).await;
        self.supervisor.leave(id, &mut state).await
    }

    pub async fn snapshot(&self, id: SessionId) -> SessionSnapshot {
        let session = self.registry.get_or_create(id);
        let state = session.lock().await;
        SessionSnapshot {
            phase: state.phase,
            connected: state.is_connected(),
            current: state.current.as_ref().map(|c| c.track.clone()),
            loop_enabled: state.loop_enabled,
            play_now_active: state.play_now_active,
            elapsed_seconds: state.elapsed_seconds(),
            queued: session.queue().len(),
        }
    }

    pub fn reap_idle_sessions(&self, max_idle: Duration) -> usize {
        self.registry.reap_idle(max_idle).len()
    }

    pub(crate) async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TrackEnded {
                session,
                generation,
                error,
            } => self.on_track_end(session, generation, error).await,
            EngineEvent::ConnectionLost { session, connection } => {
                self.on_connection_lost(session, connection).await
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<TrackRef, PlaybackError> {
        self.fetcher.fetch(url).await.map_err(|e| {
            error!("❌ Fetch failed for {}: {}", url, e);
            PlaybackError::from(e)
        })
    }

    async fn ensure_connected(
        &self,
        session: &Session,
        state: &mut SessionState,
        requester: Option<VoiceLocation>,
    ) -> Result<(), PlaybackError> {
        if state.is_connected() {
            return Ok(());
        }
        debug!("Session {} not connected, joining requester's channel", session.id());
        self.supervisor.join(session.id(), state, requester).await.map(|_| ())
    }

    async fn play_next_locked(
        &self,
        session: &Arc<Session>,
        state: &mut SessionState,
        cause: PlayCause,
    ) -> Result<PlayOutcome, PlaybackError> {
        if state.is_playing() {
            info!("Session {} is already playing, play-next ignored", session.id());
            return Err(PlaybackError::AlreadyPlaying);
        }
        if !state.is_connected() {
            return Err(PlaybackError::NotConnected);
        }

        let Some(track) = session.queue().try_pop_front() else {
            info!("📭 Queue empty in session {}", session.id());
            self.clear_playback(state);
            return Err(PlaybackError::QueueEmpty);
        };

        state.play_now_active = false;
        if let Err(e) = self.start_playback(session, state, track.clone(), Duration::ZERO, cause).await {
            // Keep the track so a later command can retry it.
            session.queue().push_front(track);
            return Err(e);
        }
        Ok(PlayOutcome::Started(track))
    }

    async fn start_playback(
        &self,
        session: &Arc<Session>,
        state: &mut SessionState,
        track: TrackRef,
        seek: Duration,
        cause: PlayCause,
    ) -> Result<(), PlaybackError> {
        let transport = state.transport.clone().ok_or(PlaybackError::NotConnected)?;

        state.cancel_tracker();
        if cause != PlayCause::Loop {
            state.loop_failures = 0;
        }
        let generation = state.bump_generation();
        let notifier = self.supervisor.completion_notifier(session.id(), generation);

        if let Err(e) = transport.play(&track, seek, notifier).await {
            error!("❌ Backend refused to play {} in session {}: {}", track.file_id(), session.id(), e);
            state.bump_generation();
            state.current = None;
            state.elapsed = Duration::ZERO;
            state.phase = PlayerPhase::Idle;
            return Err(e);
        }

        info!("🎵 Session {} playing {} from {}s", session.id(), track.source_url(), seek.as_secs());
        state.current = Some(CurrentTrack {
            track: track.clone(),
            started_at: Utc::now(),
            generation,
        });
        state.elapsed = seek;
        state.phase = PlayerPhase::Playing;
        state.tracker = Some(ElapsedTimeTracker::spawn(
            Arc::downgrade(session),
            transport,
            generation,
            seek,
            self.config.tracker_interval,
        ));

        let _ = self.notices.send(SessionNotice::NowPlaying {
            session: session.id(),
            track,
            offset: seek,
            cause,
        });
        Ok(())
    }

    /// Stops the active track without touching the queue or loop flag.
    async fn halt_current(&self, state: &mut SessionState) {
        state.cancel_tracker();
        state.bump_generation();
        let was_playing = state.current.take().is_some();
        state.elapsed = Duration::ZERO;
        state.phase = PlayerPhase::Idle;

        if was_playing {
            if let Some(transport) = &state.transport {
                transport.stop().await;
            }
        }
    }

    fn clear_playback(&self, state: &mut SessionState) {
        state.cancel_tracker();
        state.current = None;
        state.play_now_active = false;
        state.elapsed = Duration::ZERO;
        state.phase = PlayerPhase::Idle;
    }

    fn finish(&self, session: &Session, state: &mut SessionState) {
        self.clear_playback(state);
        info!("🏁 Queue empty, playback finished in session {}", session.id());
        let _ = self.notices.send(SessionNotice::Finished { session: session.id() });
    }

    async fn on_track_end(&self, id: SessionId, generation: u64, error: Option<String>) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let mut state = session.lock().await;

        let current = match &state.current {
            Some(current) if current.generation == generation => current.track.clone(),
            _ => {
                debug!("Ignoring stale completion (generation {}) in session {}", generation, id);
                return;
            }
        };

        state.cancel_tracker();
        if let Some(reason) = &error {
            warn!("⚠️ Track {} ended with error in session {}: {}", current.file_id(), id, reason);
        }

        match error {
            Some(_) => state.loop_failures += 1,
            None => state.loop_failures = 0,
        }

        if state.loop_enabled && state.loop_failures <= MAX_LOOP_RETRIES {
            info!("🔂 Looping {} in session {}", current.source_url(), id);
            if let Err(e) = self.start_playback(&session, &mut state, current, Duration::ZERO, PlayCause::Loop).await {
                error!("Failed to restart looped track in session {}: {}", id, e);
                self.finish(&session, &mut state);
            }
            return;
        }

        if state.loop_enabled {
            warn!(
                "⚠️ Giving up on looping {} in session {} after {} failed plays",
                current.source_url(),
                id,
                state.loop_failures
            );
        }
        state.loop_failures = 0;
        state.current = None;
        state.elapsed = Duration::ZERO;
        state.phase = PlayerPhase::Idle;

        if session.queue().is_empty() {
            self.finish(&session, &mut state);
            return;
        }

        if let Err(e) = self.play_next_locked(&session, &mut state, PlayCause::QueueAdvance).await {
            warn!("Could not continue queue in session {}: {}", id, e);
            self.finish(&session, &mut state);
        }
    }

    async fn on_connection_lost(&self, id: SessionId, connection: u64) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let mut state = session.lock().await;

        match self.supervisor.classify_disconnect(&mut state, connection) {
            DisconnectKind::Expected => {
                debug!("Expected disconnect observed in session {}", id);
                return;
            }
            DisconnectKind::Stale => {
                debug!("Ignoring disconnect of replaced connection {} in session {}", connection, id);
                return;
            }
            DisconnectKind::Unexpected => {}
        }

        warn!("🔌 Voice connection lost unexpectedly in session {}", id);
        state.phase = PlayerPhase::PendingReconnect;
        // Elapsed time is kept for the resume below.
        state.cancel_tracker();

        if let Err(e) = self.supervisor.reconnect(id, &mut state).await {
            error!("❌ {} (session {})", e, id);
            state.bump_generation();
            self.clear_playback(&mut state);
            let _ = self.notices.send(SessionNotice::ReconnectFailed {
                session: id,
                reason: e.to_string(),
            });
            return;
        }

        let interrupted = state.current.as_ref().map(|c| c.track.clone());
        match interrupted {
            Some(track) if state.play_now_active => {
                let offset = state.elapsed;
                info!("▶️ Resuming {} at {}s in session {}", track.source_url(), offset.as_secs(), id);
                if let Err(e) = self.start_playback(&session, &mut state, track, offset, PlayCause::Resume).await {
                    error!("Failed to resume in session {}: {}", id, e);
                    self.finish(&session, &mut state);
                }
            }
            Some(_) => {
                // Queue-driven tracks are not resumed; carry on with the queue.
                state.bump_generation();
                state.current = None;
                state.elapsed = Duration::ZERO;
                state.phase = PlayerPhase::Idle;
                if !session.queue().is_empty() {
                    if let Err(e) = self.play_next_locked(&session, &mut state, PlayCause::QueueAdvance).await {
                        warn!("Could not continue queue after reconnect in session {}: {}", id, e);
                    }
                }
            }
            None => state.phase = PlayerPhase::Idle,
        }
    }
}

/// Routes backend events to one worker per session.
///
/// A session's events are handled strictly in arrival order; different
/// sessions never wait on each other.
async fn run_event_loop(engine: Weak<PlaybackEngine>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    let mut workers: HashMap<SessionId, mpsc::UnboundedSender<EngineEvent>> = HashMap::new();

    while let Some(event) = events.recv().await {
        let Some(strong) = engine.upgrade() else {
            break;
        };
        // A dropped sender lets the worker drain what it has and exit.
        workers.retain(|id, _| strong.registry.get(*id).is_some());
        drop(strong);

        let session = event.session();
        let worker = workers
            .entry(session)
            .or_insert_with(|| spawn_session_worker(engine.clone(), session));

        if let Err(mpsc::error::SendError(event)) = worker.send(event) {
            debug!("Event worker for session {} had exited, restarting it", session);
            let worker = spawn_session_worker(engine.clone(), session);
            if worker.send(event).is_err() {
                warn!("Could not deliver event to session {}", session);
            }
            workers.insert(session, worker);
        }
    }
    debug!("Engine event loop finished");
}

fn spawn_session_worker(engine: Weak<PlaybackEngine>, session: SessionId) -> mpsc::UnboundedSender<EngineEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            engine.handle_event(event).await;
        }
        debug!("Event worker for session {} finished", session);
    });
    tx
}
