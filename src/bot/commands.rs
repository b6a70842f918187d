use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

use crate::sources::share::MAX_LIFETIME_DAYS;

/// Every slash command the bot answers. `/download` only exists when an
/// uploader is configured.
pub fn all_commands(with_download: bool) -> Vec<CreateCommand> {
    let mut commands = vec![
        playnow_command(),
        queue_command(),
        list_command(),
        skip_command(),
        stop_command(),
        join_command(),
        leave_command(),
        loop_command(),
        nowplaying_command(),
        help_command(),
    ];
    if with_download {
        commands.push(download_command());
    }
    commands
}

pub async fn register_global_commands(ctx: &Context, with_download: bool) -> Result<()> {
    for command in all_commands(with_download) {
        ctx.http.create_global_command(&command).await?;
    }
    Ok(())
}

/// Guild commands update instantly; used during development.
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId, with_download: bool) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands(with_download)).await?;
    Ok(())
}

fn url_option(description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::String, "url", description).required(true)
}

// Playback

fn playnow_command() -> CreateCommand {
    CreateCommand::new("playnow")
        .description("Play a track right away, interrupting the current one")
        .add_option(url_option("Link to the track"))
}

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Add a track to the end of the queue")
        .add_option(url_option("Link to the track"))
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Skip to the next queued track")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Stop playback, clear the queue and turn loop off")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop").description("Toggle looping of the current track")
}

// Queue and status

fn list_command() -> CreateCommand {
    CreateCommand::new("list").description("Show the queued tracks")
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Show the track that is playing")
}

// Voice

fn join_command() -> CreateCommand {
    CreateCommand::new("join").description("Join your voice channel")
}

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Leave the voice channel (the queue is kept)")
}

// Misc

fn help_command() -> CreateCommand {
    CreateCommand::new("help")
        .description("Show the command list")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "lang", "Language")
                .add_string_choice("English", "en")
                .add_string_choice("日本語", "ja"),
        )
}

fn download_command() -> CreateCommand {
    CreateCommand::new("download")
        .description("Download a track and get a temporary share link")
        .add_option(url_option("Link to the track"))
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "days", "How long the link stays valid")
                .min_int_value(1)
                .max_int_value(MAX_LIFETIME_DAYS as u64)
                .required(true),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn download_is_only_registered_with_an_uploader() {
        assert_eq!(all_commands(false).len(), 10);
        assert_eq!(all_commands(true).len(), 11);
    }
}
