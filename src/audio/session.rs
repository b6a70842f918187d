use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::{
    audio::{
        queue::TrackQueue,
        tracker::ElapsedTimeTracker,
        transport::{SessionId, Transport, VoiceLocation},
    },
    sources::TrackRef,
};

/// Loop is on for every new session. Kept as-is pending a product decision.
pub const DEFAULT_LOOP_ENABLED: bool = true;

/// Consecutive failed plays of a looping track before it is dropped.
pub const MAX_LOOP_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerPhase {
    Idle,
    Playing,
    PendingReconnect,
}

/// The track currently owned by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentTrack {
    pub track: TrackRef,
    pub started_at: DateTime<Utc>,
    pub generation: u64,
}

/// Mutable per-session state. Only reachable through [`Session::lock`].
pub struct SessionState {
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) location: Option<VoiceLocation>,
    pub(crate) connection_id: u64,
    pub(crate) current: Option<CurrentTrack>,
    pub(crate) loop_enabled: bool,
    /// Failed completions of the current looping track in a row.
    pub(crate) loop_failures: u32,
    pub(crate) play_now_active: bool,
    pub(crate) expecting_disconnect: bool,
    pub(crate) elapsed: Duration,
    pub(crate) tracker: Option<ElapsedTimeTracker>,
    pub(crate) generation: u64,
    pub(crate) phase: PlayerPhase,
}

impl SessionState {
    fn new() -> Self {
        Self {
            transport: None,
            location: None,
            connection_id: 0,
            current: None,
            loop_enabled: DEFAULT_LOOP_ENABLED,
            loop_failures: 0,
            play_now_active: false,
            expecting_disconnect: false,
            elapsed: Duration::ZERO,
            tracker: None,
            generation: 0,
            phase: PlayerPhase::Idle,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed.as_secs()
    }

    pub fn has_live_tracker(&self) -> bool {
        self.tracker.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Invalidates every completion and tracker issued so far.
    pub(crate) fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub(crate) fn cancel_tracker(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.cancel();
        }
    }

    fn is_reapable(&self) -> bool {
        self.transport.is_none() && self.current.is_none() && !self.has_live_tracker()
    }
}

/// One guild's playback context.
pub struct Session {
    id: SessionId,
    queue: TrackQueue,
    state: Mutex<SessionState>,
    last_activity: parking_lot::Mutex<Instant>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            queue: TrackQueue::new(),
            state: Mutex::new(SessionState::new()),
            last_activity: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn queue(&self) -> &TrackQueue {
        &self.queue
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn is_reapable(&self, max_idle: Duration) -> bool {
        if self.idle_for() < max_idle || !self.queue.is_empty() {
            return false;
        }
        // A held lock means someone is working on this session right now.
        match self.state.try_lock() {
            Ok(state) => state.is_reapable(),
            Err(_) => false,
        }
    }
}

/// Owns every session, keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `id`, creating it on first use.
    pub fn get_or_create(&self, id: SessionId) -> Arc<Session> {
        let session = self
            .sessions
            .entry(id)
            .or_insert_with(|| {
                debug!("🆕 Creating session {}", id);
                Arc::new(Session::new(id))
            })
            .clone();
        session.touch();
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evicts sessions with no transport, no queue, no current track and no
    /// activity for at least `max_idle`. Returns the evicted ids.
    pub fn reap_idle(&self, max_idle: Duration) -> Vec<SessionId> {
        let mut reaped = Vec::new();
        self.sessions.retain(|id, session| {
            if session.is_reapable(max_idle) {
                reaped.push(*id);
                false
            } else {
                true
            }
        });

        if !reaped.is_empty() {
            info!("🧹 Reaped {} idle session(s)", reaped.len());
        }
        reaped
    }
}
