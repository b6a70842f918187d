//! Songbird-backed implementation of the voice boundary.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    events::{CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent},
    input::File,
    tracks::{PlayMode, Track, TrackHandle},
    Call, Songbird,
};
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{
    audio::transport::{
        CompletionNotifier, DisconnectNotifier, SessionId, Transport, VoiceGateway, VoiceLocation,
    },
    error::PlaybackError,
    sources::TrackRef,
};

pub struct SongbirdGateway {
    manager: Arc<Songbird>,
    volume: f32,
}

impl SongbirdGateway {
    pub fn new(manager: Arc<Songbird>, volume: f32) -> Self {
        Self { manager, volume }
    }
}

fn guild_id(session: SessionId) -> Result<GuildId, PlaybackError> {
    NonZeroU64::new(session.0)
        .map(GuildId::from)
        .ok_or_else(|| PlaybackError::Transport(format!("invalid guild id {}", session)))
}

fn channel_id(location: VoiceLocation) -> Result<ChannelId, PlaybackError> {
    NonZeroU64::new(location.channel_id)
        .map(ChannelId::from)
        .ok_or(PlaybackError::NotInVoice)
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn connect(
        &self,
        session: SessionId,
        location: VoiceLocation,
        on_disconnect: DisconnectNotifier,
    ) -> Result<Arc<dyn Transport>, PlaybackError> {
        let guild = guild_id(session)?;
        let channel = channel_id(location)?;

        let call = self.manager.join(guild, channel).await.map_err(|e| {
            error!("❌ Voice join failed in guild {}: {}", guild, e);
            PlaybackError::Transport(e.to_string())
        })?;

        {
            // Songbird keeps one Call per guild across joins; drop handlers
            // registered for earlier connections.
            let mut handler = call.lock().await;
            handler.remove_all_global_events();
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectHandler {
                    notifier: on_disconnect,
                },
            );
        }

        info!("🔊 Joined voice channel {} in guild {}", channel, guild);
        Ok(Arc::new(SongbirdTransport {
            session,
            location,
            call,
            volume: self.volume,
            current: Mutex::new(None),
        }))
    }
}

pub struct SongbirdTransport {
    session: SessionId,
    location: VoiceLocation,
    call: Arc<tokio::sync::Mutex<Call>>,
    volume: f32,
    current: Mutex<Option<TrackHandle>>,
}

#[async_trait]
impl Transport for SongbirdTransport {
    async fn play(
        &self,
        track: &TrackRef,
        seek: Duration,
        on_complete: CompletionNotifier,
    ) -> Result<(), PlaybackError> {
        let generation = on_complete.generation();
        let slot = CompletionSlot::new(on_complete);
        let input = File::new(track.file_path().to_path_buf());

        let handle = {
            let mut call = self.call.lock().await;
            call.stop();
            call.play(Track::new(input.into()).volume(self.volume))
        };

        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackEndHandler {
                        session: self.session,
                        slot: slot.clone(),
                    },
                )
                .map_err(|e| PlaybackError::Transport(e.to_string()))?;
        }

        if !seek.is_zero() {
            if let Err(e) = handle.seek_async(seek).await {
                warn!("⚠️ Seek to {}s failed in session {}, playing from start: {}", seek.as_secs(), self.session, e);
            }
        }

        debug!(
            "▶️ Songbird playing {} in session {} (generation {})",
            track.file_path().display(),
            self.session,
            generation
        );
        *self.current.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        let handle = self.current.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.stop() {
                debug!("Track already gone in session {}: {}", self.session, e);
            }
        }
    }

    async fn is_playing(&self) -> bool {
        let handle = self.current.lock().clone();
        match handle {
            Some(handle) => matches!(handle.get_info().await, Ok(state) if matches!(state.playing, PlayMode::Play)),
            None => false,
        }
    }

    async fn disconnect(&self) -> Result<(), PlaybackError> {
        self.stop().await;
        let mut call = self.call.lock().await;
        call.leave().await.map_err(|e| PlaybackError::Transport(e.to_string()))
    }

    fn location(&self) -> VoiceLocation {
        self.location
    }
}

/// Shared by the End and Error handlers of one track so only the first fires.
#[derive(Clone)]
struct CompletionSlot(Arc<Mutex<Option<CompletionNotifier>>>);

impl CompletionSlot {
    fn new(notifier: CompletionNotifier) -> Self {
        Self(Arc::new(Mutex::new(Some(notifier))))
    }

    fn fire(&self, error: Option<String>) -> bool {
        let notifier = self.0.lock().take();
        match notifier {
            Some(notifier) => {
                notifier.complete(error);
                true
            }
            None => false,
        }
    }
}

struct TrackEndHandler {
    session: SessionId,
    slot: CompletionSlot,
}

#[async_trait]
impl VoiceEventHandler for TrackEndHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let error = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(format!("{e:?}")),
                _ => None,
            }),
            _ => None,
        };

        if let Some(reason) = &error {
            error!("❌ Track error in session {}: {}", self.session, reason);
        }
        self.slot.fire(error);
        Some(Event::Cancel)
    }
}

struct DisconnectHandler {
    notifier: DisconnectNotifier,
}

#[async_trait]
impl VoiceEventHandler for DisconnectHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            let connection = self.notifier.connection();
            match describe_disconnect(data.reason.as_ref()) {
                DisconnectCause::Requested => info!(
                    "🔌 Voice driver left on request in guild {:?} (connection {})",
                    data.guild_id, connection
                ),
                DisconnectCause::Failure(reason) => warn!(
                    "🔌 Voice driver disconnected in guild {:?} ({:?}, connection {}): {}",
                    data.guild_id, data.kind, connection, reason
                ),
            }
            // The engine decides from its own flags whether this was expected.
            self.notifier.notify();
        }
        None
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DisconnectCause {
    /// Songbird reports no reason for leaves it was asked to perform.
    Requested,
    Failure(String),
}

fn describe_disconnect<R: std::fmt::Debug>(reason: Option<&R>) -> DisconnectCause {
    match reason {
        None => DisconnectCause::Requested,
        Some(reason) => DisconnectCause::Failure(format!("{reason:?}")),
    }
}
