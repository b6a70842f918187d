//! Boundary between the playback engine and the voice backend.
//!
//! The backend reports track completion and connection loss from its own
//! execution context. Both are delivered as [`EngineEvent`]s over a channel
//! so the engine can serialize them against user commands.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::{error::PlaybackError, sources::TrackRef};

/// Opaque identifier of one playback session (one per guild).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Voice channel a transport connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceLocation {
    pub channel_id: u64,
}

impl VoiceLocation {
    pub fn new(channel_id: u64) -> Self {
        Self { channel_id }
    }
}

/// Messages sent by the backend into the engine's coordination loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TrackEnded {
        session: SessionId,
        generation: u64,
        error: Option<String>,
    },
    ConnectionLost {
        session: SessionId,
        connection: u64,
    },
}

impl EngineEvent {
    pub fn session(&self) -> SessionId {
        match self {
            EngineEvent::TrackEnded { session, .. } | EngineEvent::ConnectionLost { session, .. } => *session,
        }
    }
}

/// One-shot completion for a single `play` call.
///
/// Consumed by [`CompletionNotifier::complete`]. A notifier dropped without
/// completing reports an error on drop, so every play produces exactly one
/// [`EngineEvent::TrackEnded`].
#[derive(Debug)]
pub struct CompletionNotifier {
    session: SessionId,
    generation: u64,
    tx: Option<UnboundedSender<EngineEvent>>,
}

impl CompletionNotifier {
    pub fn new(session: SessionId, generation: u64, tx: UnboundedSender<EngineEvent>) -> Self {
        Self {
            session,
            generation,
            tx: Some(tx),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn complete(mut self, error: Option<String>) {
        self.send(error);
    }

    fn send(&mut self, error: Option<String>) {
        if let Some(tx) = self.tx.take() {
            let event = EngineEvent::TrackEnded {
                session: self.session,
                generation: self.generation,
                error,
            };
            if tx.send(event).is_err() {
                warn!("Engine loop gone, dropping completion for session {}", self.session);
            }
        }
    }
}

impl Drop for CompletionNotifier {
    fn drop(&mut self) {
        self.send(Some("playback ended without reporting completion".to_string()));
    }
}

/// Reports involuntary loss of one specific connection.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
    session: SessionId,
    connection: u64,
    tx: UnboundedSender<EngineEvent>,
}

impl DisconnectNotifier {
    pub fn new(session: SessionId, connection: u64, tx: UnboundedSender<EngineEvent>) -> Self {
        Self {
            session,
            connection,
            tx,
        }
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn notify(&self) {
        let event = EngineEvent::ConnectionLost {
            session: self.session,
            connection: self.connection,
        };
        if self.tx.send(event).is_err() {
            warn!("Engine loop gone, dropping disconnect for session {}", self.session);
        }
    }
}

/// Establishes transports to voice channels.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn connect(
        &self,
        session: SessionId,
        location: VoiceLocation,
        on_disconnect: DisconnectNotifier,
    ) -> Result<Arc<dyn Transport>, PlaybackError>;
}

/// A live connection streaming audio into one voice channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts `track` at `seek`. `on_complete` fires once when this playback ends.
    async fn play(
        &self,
        track: &TrackRef,
        seek: Duration,
        on_complete: CompletionNotifier,
    ) -> Result<(), PlaybackError>;

    async fn stop(&self);

    async fn is_playing(&self) -> bool;

    async fn disconnect(&self) -> Result<(), PlaybackError>;

    fn location(&self) -> VoiceLocation;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    #[test]
    fn completion_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = CompletionNotifier::new(SessionId(7), 3, tx);

        notifier.complete(None);

        assert_eq!(
            rx.try_recv().ok(),
            Some(EngineEvent::TrackEnded {
                session: SessionId(7),
                generation: 3,
                error: None
            })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_completion_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(CompletionNotifier::new(SessionId(1), 9, tx));

        match rx.try_recv() {
            Ok(EngineEvent::TrackEnded { generation, error, .. }) => {
                assert_eq!(generation, 9);
                assert!(error.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_know_their_session() {
        let ended = EngineEvent::TrackEnded {
            session: SessionId(3),
            generation: 1,
            error: None,
        };
        let lost = EngineEvent::ConnectionLost {
            session: SessionId(4),
            connection: 1,
        };

        assert_eq!(ended.session(), SessionId(3));
        assert_eq!(lost.session(), SessionId(4));
    }

    #[test]
    fn disconnect_carries_connection_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = DisconnectNotifier::new(SessionId(2), 5, tx);
        notifier.notify();

        assert_eq!(
            rx.try_recv().ok(),
            Some(EngineEvent::ConnectionLost {
                session: SessionId(2),
                connection: 5
            })
        );
    }
}
