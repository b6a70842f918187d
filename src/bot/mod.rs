//! # Bot Module
//!
//! Discord glue for the playback engine.
//!
//! - [`commands`] - slash command definitions and registration
//! - [`handlers`] - maps each command onto one engine operation and
//!   renders the plain-text reply
//!
//! [`JukeboxBot`] implements Serenity's [`EventHandler`]. On `ready` it
//! registers commands and starts two background tasks: the maintenance loop
//! (idle-session reaping and download archive pruning) and the notice
//! forwarder that posts engine announcements to the channel each guild last
//! used a command in.

use anyhow::Result;
use dashmap::DashMap;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready},
    async_trait,
    builder::CreateMessage,
    http::Http,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::player::{PlayCause, PlaybackEngine, SessionNotice},
    config::Config,
    sources::{share::Uploader, YtDlpFetcher},
};

pub struct JukeboxBot {
    config: Arc<Config>,
    pub engine: Arc<PlaybackEngine>,
    pub fetcher: Arc<YtDlpFetcher>,
    /// Present only when a hosting service is wired in; enables `/download`.
    pub uploader: Option<Arc<dyn Uploader>>,
    /// Text channel each guild last issued a command from.
    announce_channels: Arc<DashMap<GuildId, ChannelId>>,
    background_started: AtomicBool,
}

impl JukeboxBot {
    pub fn new(
        config: Config,
        engine: Arc<PlaybackEngine>,
        fetcher: Arc<YtDlpFetcher>,
        uploader: Option<Arc<dyn Uploader>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            fetcher,
            uploader,
            announce_channels: Arc::new(DashMap::new()),
            background_started: AtomicBool::new(false),
        }
    }

    pub fn remember_channel(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.announce_channels.insert(guild_id, channel_id);
    }

    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registering slash commands...");
        let with_download = self.uploader.is_some();

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                commands::register_guild_commands(ctx, guild_id, with_download)
                    .await
                    .map_err(|e| {
                        error!("❌ Failed to register guild commands: {:?}", e);
                        anyhow::anyhow!("Could not register guild commands. Check the bot has the 'applications.commands' scope in that guild.")
                    })?;
                info!("✅ Guild commands registered for {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx, with_download)
                    .await
                    .map_err(|e| {
                        error!("❌ Failed to register global commands: {:?}", e);
                        anyhow::anyhow!("Could not register global commands")
                    })?;
                info!("✅ Global commands registered");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} servers", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error registering commands: {:?}", e);
        }

        // `ready` fires again after a gateway resume; spawn the tasks once.
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::spawn(maintenance_tasks(
            self.config.clone(),
            self.engine.clone(),
            self.fetcher.clone(),
        ));
        tokio::spawn(forward_notices(
            ctx.http.clone(),
            self.engine.clone(),
            self.announce_channels.clone(),
        ));
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                error!("Error handling command: {:?}", e);
            }
        }
    }
}

/// Reaps idle sessions and prunes archive entries whose files are gone.
async fn maintenance_tasks(config: Arc<Config>, engine: Arc<PlaybackEngine>, fetcher: Arc<YtDlpFetcher>) {
    let mut interval = tokio::time::interval(config.maintenance_interval);

    loop {
        interval.tick().await;

        let reaped = engine.reap_idle_sessions(config.session_idle_timeout);
        if let Err(e) = fetcher.prune_archive().await {
            warn!("Error pruning download archive: {:?}", e);
        }

        debug!(
            "🧹 Maintenance done: {} session(s) reaped, {} remaining",
            reaped,
            engine.registry().len()
        );
    }
}

/// Posts engine notices that were not a direct reply to a command.
async fn forward_notices(http: Arc<Http>, engine: Arc<PlaybackEngine>, channels: Arc<DashMap<GuildId, ChannelId>>) {
    let mut notices = engine.subscribe();

    loop {
        let notice = match notices.recv().await {
            Ok(notice) => notice,
            Err(RecvError::Lagged(missed)) => {
                warn!("Notice forwarder lagged, {} notice(s) dropped", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some((session, text)) = announcement(&notice) else {
            continue;
        };
        let Some(guild_id) = std::num::NonZeroU64::new(session).map(GuildId::from) else {
            continue;
        };
        let Some(channel_id) = channels.get(&guild_id).map(|c| *c) else {
            debug!("No announce channel known for guild {}", guild_id);
            continue;
        };

        if let Err(e) = channel_id.send_message(&*http, CreateMessage::new().content(text)).await {
            error!("Error sending notice to channel {}: {:?}", channel_id, e);
        }
    }
}

fn announcement(notice: &SessionNotice) -> Option<(u64, String)> {
    match notice {
        SessionNotice::NowPlaying {
            session,
            track,
            cause: PlayCause::QueueAdvance,
            ..
        } => Some((session.0, format!("🎵 Now playing: {}", track.source_url()))),
        SessionNotice::NowPlaying {
            session,
            track,
            offset,
            cause: PlayCause::Resume,
        } => Some((
            session.0,
            format!(
                "▶️ Reconnected, resuming {} at {}",
                track.source_url(),
                handlers::format_elapsed(*offset)
            ),
        )),
        SessionNotice::NowPlaying { .. } => None,
        SessionNotice::Finished { session } => Some((session.0, "🏁 Reached the end of the queue".to_string())),
        SessionNotice::ReconnectFailed { session, .. } => Some((
            session.0,
            "⚠️ Lost the voice connection and could not reconnect. Use /join to bring me back".to_string(),
        )),
    }
}
