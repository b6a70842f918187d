use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::{
    audio::{
        session::SessionState,
        transport::{CompletionNotifier, DisconnectNotifier, EngineEvent, SessionId, VoiceGateway, VoiceLocation},
    },
    error::PlaybackError,
};

/// How a reported connection loss should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// We asked for it (leave or re-join).
    Expected,
    /// The event belongs to a connection that was already replaced.
    Stale,
    Unexpected,
}

/// Owns connect/disconnect for every session's transport.
///
/// All methods take the session's locked state, so connection changes are
/// serialized with playback commands.
pub struct ConnectionSupervisor {
    gateway: Arc<dyn VoiceGateway>,
    events: UnboundedSender<EngineEvent>,
    connections: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(gateway: Arc<dyn VoiceGateway>, events: UnboundedSender<EngineEvent>) -> Self {
        Self {
            gateway,
            events,
            connections: AtomicU64::new(0),
        }
    }

    /// Connects to `location`, cleanly dropping any existing transport first.
    pub async fn join(
        &self,
        session: SessionId,
        state: &mut SessionState,
        location: Option<VoiceLocation>,
    ) -> Result<VoiceLocation, PlaybackError> {
        let location = location.ok_or(PlaybackError::NotInVoice)?;

        if let Some(previous) = state.transport.take() {
            info!("🔁 Session {} re-joining, dropping previous connection", session);
            state.expecting_disconnect = true;
            if let Err(e) = previous.disconnect().await {
                warn!("Error closing previous connection for session {}: {}", session, e);
            }
        }

        self.connect(session, state, location).await?;
        info!("🔊 Session {} connected to channel {}", session, location.channel_id);
        Ok(location)
    }

    pub async fn leave(&self, session: SessionId, state: &mut SessionState) -> Result<(), PlaybackError> {
        let transport = state.transport.take().ok_or(PlaybackError::NotConnected)?;

        state.expecting_disconnect = true;
        if let Err(e) = transport.disconnect().await {
            warn!("Error while leaving voice in session {}: {}", session, e);
        }

        info!("👋 Session {} left voice", session);
        Ok(())
    }

    /// Classifies a connection-lost event and clears the expecting flag when
    /// the loss was ours.
    pub fn classify_disconnect(&self, state: &mut SessionState, connection: u64) -> DisconnectKind {
        if state.expecting_disconnect {
            state.expecting_disconnect = false;
            return DisconnectKind::Expected;
        }
        if connection != state.connection_id || state.transport.is_none() {
            return DisconnectKind::Stale;
        }
        DisconnectKind::Unexpected
    }

    /// Single reconnect attempt to the last joined location.
    pub async fn reconnect(&self, session: SessionId, state: &mut SessionState) -> Result<(), PlaybackError> {
        state.transport = None;
        let location = state
            .location
            .ok_or_else(|| PlaybackError::ReconnectFailed("no previous voice location".into()))?;

        info!("🔄 Reconnecting session {} to channel {}", session, location.channel_id);
        self.connect(session, state, location)
            .await
            .map_err(|e| PlaybackError::ReconnectFailed(e.to_string()))
    }

    pub fn completion_notifier(&self, session: SessionId, generation: u64) -> CompletionNotifier {
        CompletionNotifier::new(session, generation, self.events.clone())
    }

    async fn connect(
        &self,
        session: SessionId,
        state: &mut SessionState,
        location: VoiceLocation,
    ) -> Result<(), PlaybackError> {
        let connection = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let notifier = DisconnectNotifier::new(session, connection, self.events.clone());
        let transport = self.gateway.connect(session, location, notifier).await?;

        state.transport = Some(transport);
        state.location = Some(location);
        state.connection_id = connection;
        state.expecting_disconnect = false;
        Ok(())
    }
}
