//! In-memory voice backend for engine tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    audio::transport::{
        CompletionNotifier, DisconnectNotifier, SessionId, Transport, VoiceGateway, VoiceLocation,
    },
    error::PlaybackError,
    sources::TrackRef,
};

#[derive(Default)]
pub struct FakeGateway {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    failing_connects: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn last_transport(&self) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .last()
            .cloned()
            .expect("no transport was connected")
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn connect(
        &self,
        _session: SessionId,
        location: VoiceLocation,
        on_disconnect: DisconnectNotifier,
    ) -> Result<Arc<dyn Transport>, PlaybackError> {
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(PlaybackError::Transport("connect refused".into()));
        }

        let transport = Arc::new(FakeTransport {
            location,
            on_disconnect: Some(on_disconnect),
            ..FakeTransport::blank(location)
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

pub struct FakeTransport {
    location: VoiceLocation,
    on_disconnect: Option<DisconnectNotifier>,
    playing: AtomicBool,
    disconnected: AtomicBool,
    plays: Mutex<Vec<(String, Duration)>>,
    pending: Mutex<Option<CompletionNotifier>>,
}

impl FakeTransport {
    fn blank(location: VoiceLocation) -> Self {
        Self {
            location,
            on_disconnect: None,
            playing: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            plays: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
        }
    }

    /// A transport not tied to any gateway or engine loop.
    pub fn detached(location: VoiceLocation) -> Arc<Self> {
        Arc::new(Self::blank(location))
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    /// File ids and seek offsets of every `play` call, in order.
    pub fn plays(&self) -> Vec<(String, Duration)> {
        self.plays.lock().clone()
    }

    pub fn last_play(&self) -> Option<(String, Duration)> {
        self.plays.lock().last().cloned()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Ends the running track as the backend would on reaching the end.
    pub fn finish_current(&self, error: Option<String>) {
        self.set_playing(false);
        if let Some(notifier) = self.pending.lock().take() {
            notifier.complete(error);
        }
    }

    /// Simulates the voice server dropping the connection.
    pub fn drop_connection(&self) {
        self.set_playing(false);
        self.disconnected.store(true, Ordering::SeqCst);
        if let Some(notifier) = &self.on_disconnect {
            notifier.notify();
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn play(
        &self,
        track: &TrackRef,
        seek: Duration,
        on_complete: CompletionNotifier,
    ) -> Result<(), PlaybackError> {
        if self.is_disconnected() {
            return Err(PlaybackError::Transport("transport is closed".into()));
        }
        self.plays.lock().push((track.file_id().to_string(), seek));
        let previous = self.pending.lock().replace(on_complete);
        if let Some(previous) = previous {
            previous.complete(None);
        }
        self.set_playing(true);
        Ok(())
    }

    async fn stop(&self) {
        self.finish_current(None);
    }

    async fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), PlaybackError> {
        self.finish_current(None);
        self.disconnected.store(true, Ordering::SeqCst);
        if let Some(notifier) = &self.on_disconnect {
            notifier.notify();
        }
        Ok(())
    }

    fn location(&self) -> VoiceLocation {
        self.location
    }
}
