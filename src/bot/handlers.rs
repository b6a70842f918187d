use anyhow::Result;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::CommandInteraction,
        id::{GuildId, UserId},
    },
    prelude::Context,
};
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    audio::{
        player::{NowPlaying, PlayOutcome},
        transport::{SessionId, VoiceLocation},
    },
    bot::JukeboxBot,
    error::PlaybackError,
    sources::{share, TrackRef},
};

/// Dispatches a slash command to the engine and replies in plain text.
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &JukeboxBot) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Command used outside a server"))?;

    info!(
        "📝 /{} used by {} in guild {}",
        command.data.name, command.user.name, guild_id
    );
    bot.remember_channel(guild_id, command.channel_id);
    let session = SessionId(guild_id.get());

    match command.data.name.as_str() {
        "playnow" => handle_playnow(ctx, &command, bot, session).await?,
        "queue" => handle_queue(ctx, &command, bot, session).await?,
        "list" => {
            let queued = bot.engine.list_queue(session);
            respond(ctx, &command, format_queue(&queued)).await?;
        }
        "skip" => {
            let reply = match bot.engine.skip(session).await {
                Ok(PlayOutcome::Started(track)) => format!("⏭️ Skipped. Now playing: {}", track.source_url()),
                Ok(PlayOutcome::Queued { .. }) => "⏭️ Skipped".to_string(),
                Err(e) => error_reply(&e),
            };
            respond(ctx, &command, reply).await?;
        }
        "stop" => {
            let cleared = bot.engine.stop(session).await;
            respond(ctx, &command, format!("⏹️ Stopped. Cleared {} queued track(s), loop is off", cleared)).await?;
        }
        "join" => {
            let requester = user_voice_location(ctx, guild_id, command.user.id);
            let reply = match bot.engine.join(session, requester).await {
                Ok(location) => format!("🔊 Joined <#{}>", location.channel_id),
                Err(e) => error_reply(&e),
            };
            respond(ctx, &command, reply).await?;
        }
        "leave" => {
            let reply = match bot.engine.leave(session).await {
                Ok(()) => "👋 Left the voice channel. The queue was kept".to_string(),
                Err(e) => error_reply(&e),
            };
            respond(ctx, &command, reply).await?;
        }
        "loop" => {
            let reply = if bot.engine.toggle_loop(session).await {
                "🔂 Loop enabled"
            } else {
                "➡️ Loop disabled"
            };
            respond(ctx, &command, reply).await?;
        }
        "nowplaying" => {
            let reply = match bot.engine.now_playing(session).await {
                Some(now) => format_now_playing(&now),
                None => "🔇 Nothing is playing".to_string(),
            };
            respond(ctx, &command, reply).await?;
        }
        "help" => {
            let lang = string_option(&command, "lang").unwrap_or("en");
            respond(ctx, &command, help_text(lang)).await?;
        }
        "download" => handle_download(ctx, &command, bot).await?,
        other => {
            warn!("Unknown command /{}", other);
            respond(ctx, &command, "❌ Unknown command").await?;
        }
    }

    Ok(())
}

async fn handle_playnow(ctx: &Context, command: &CommandInteraction, bot: &JukeboxBot, session: SessionId) -> Result<()> {
    let url = required_url(command)?;
    defer(ctx, command).await?;

    let requester = requester_location(ctx, command);
    let reply = match bot.engine.play_now(session, url, requester).await {
        Ok(track) => format!("🎵 Now playing: {}", track.source_url()),
        Err(e) => error_reply(&e),
    };
    edit(ctx, command, reply).await
}

async fn handle_queue(ctx: &Context, command: &CommandInteraction, bot: &JukeboxBot, session: SessionId) -> Result<()> {
    let url = required_url(command)?;
    defer(ctx, command).await?;

    let requester = requester_location(ctx, command);
    let reply = match bot.engine.enqueue(session, url, requester).await {
        Ok(PlayOutcome::Started(track)) => format!("🎵 Now playing: {}", track.source_url()),
        Ok(PlayOutcome::Queued { track, position }) => {
            format!("➕ Queued {} at position {}", track.source_url(), position)
        }
        Err(e) => error_reply(&e),
    };
    edit(ctx, command, reply).await
}

async fn handle_download(ctx: &Context, command: &CommandInteraction, bot: &JukeboxBot) -> Result<()> {
    let Some(uploader) = bot.uploader.clone() else {
        return respond(ctx, command, "❌ Downloads are not available on this bot").await;
    };
    let url = required_url(command)?;
    let days = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "days")
        .and_then(|opt| opt.value.as_i64())
        .and_then(|days| u32::try_from(days).ok())
        .unwrap_or(1);

    defer(ctx, command).await?;
    let result = share::download_and_share(
        bot.fetcher.as_ref(),
        uploader.as_ref(),
        url,
        days,
        bot.config.upload_timeout,
    )
    .await;

    let reply = match result {
        Ok(link) => format!("🔗 {} (valid for {} day(s))", link, days),
        Err(e) => format!("❌ {}", e),
    };
    edit(ctx, command, reply).await
}

// Helpers

fn string_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn required_url(command: &CommandInteraction) -> Result<&str> {
    string_option(command, "url").ok_or_else(|| anyhow::anyhow!("/{} is missing its url", command.data.name))
}

fn requester_location(ctx: &Context, command: &CommandInteraction) -> Option<VoiceLocation> {
    command
        .guild_id
        .and_then(|guild_id| user_voice_location(ctx, guild_id, command.user.id))
}

/// Voice channel the user currently sits in, from the guild cache.
fn user_voice_location(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<VoiceLocation> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .map(|channel_id| VoiceLocation::new(channel_id.get()))
}

async fn respond(ctx: &Context, command: &CommandInteraction, content: impl Into<String>) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().content(content)),
        )
        .await?;
    Ok(())
}

/// Acknowledges a command that will answer after a download.
async fn defer(ctx: &Context, command: &CommandInteraction) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;
    Ok(())
}

async fn edit(ctx: &Context, command: &CommandInteraction, content: String) -> Result<()> {
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;
    Ok(())
}

pub fn error_reply(error: &PlaybackError) -> String {
    if error.is_informational() {
        format!("ℹ️ {}", error)
    } else {
        format!("❌ {}", error)
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    humantime::format_duration(Duration::from_secs(elapsed.as_secs())).to_string()
}

pub fn format_queue(queued: &[TrackRef]) -> String {
    if queued.is_empty() {
        return "📭 The queue is empty".to_string();
    }

    let mut reply = format!("📜 {} queued track(s):", queued.len());
    for (index, track) in queued.iter().enumerate() {
        reply.push_str(&format!("\n{}. {}", index + 1, track.source_url()));
    }
    reply
}

pub fn format_now_playing(now: &NowPlaying) -> String {
    format!(
        "🎵 Now playing: {}\n⏱️ {} elapsed, loop {}",
        now.track.source_url(),
        format_elapsed(now.elapsed),
        if now.loop_enabled { "on" } else { "off" }
    )
}

pub fn help_text(lang: &str) -> &'static str {
    match lang {
        "ja" => {
            "**コマンド一覧**\n\
            `/playnow url` 今の曲を止めてすぐに再生\n\
            `/queue url` キューの最後に追加 (停止中なら再生開始)\n\
            `/list` キューを表示\n\
            `/skip` 次の曲へ\n\
            `/stop` 再生停止、キューを空にしてループをオフ\n\
            `/join` ボイスチャンネルに参加\n\
            `/leave` ボイスチャンネルから退出 (キューは保持)\n\
            `/loop` ループの切り替え\n\
            `/nowplaying` 再生中の曲を表示\n\
            `/download url days` ダウンロードして共有リンクを作成"
        }
        _ => {
            "**Commands**\n\
            `/playnow url` stop the current track and play this one\n\
            `/queue url` add to the end of the queue (starts playback when idle)\n\
            `/list` show the queue\n\
            `/skip` move to the next track\n\
            `/stop` stop, empty the queue and turn loop off\n\
            `/join` join your voice channel\n\
            `/leave` leave the voice channel (the queue is kept)\n\
            `/loop` toggle looping of the current track\n\
            `/nowplaying` show the current track\n\
            `/download url days` download and get a share link"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn track(id: &str) -> TrackRef {
        TrackRef::new(format!("https://youtu.be/{id}"), id, format!("/tmp/{id}.wav"))
    }

    #[test]
    fn informational_errors_are_not_marked_as_failures() {
        assert_eq!(error_reply(&PlaybackError::QueueEmpty), "ℹ️ Queue is empty");
        assert_eq!(
            error_reply(&PlaybackError::NotInVoice),
            "❌ You are not connected to a voice channel"
        );
    }

    #[test]
    fn queue_is_numbered_from_one() {
        assert_eq!(format_queue(&[]), "📭 The queue is empty");
        assert_eq!(
            format_queue(&[track("a"), track("b")]),
            "📜 2 queued track(s):\n1. https://youtu.be/a\n2. https://youtu.be/b"
        );
    }

    #[test]
    fn now_playing_shows_whole_seconds() {
        let now = NowPlaying {
            track: track("a"),
            started_at: Utc::now(),
            elapsed: Duration::from_millis(62_700),
            loop_enabled: true,
        };

        assert_eq!(
            format_now_playing(&now),
            "🎵 Now playing: https://youtu.be/a\n⏱️ 1m 2s elapsed, loop on"
        );
    }

    #[test]
    fn help_falls_back_to_english() {
        assert!(help_text("ja").contains("コマンド一覧"));
        assert_eq!(help_text("fr"), help_text("en"));
    }
}
