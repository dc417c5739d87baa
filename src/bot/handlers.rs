use anyhow::Result;
use serenity::{
    builder::{CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::{CommandInteraction, ComponentInteraction},
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    audio::{backend::NowPlayingCard, queue::PlayOutcome, track::LoopMode},
    bot::{sink::ChannelSink, JukeboxBot},
    error::UserInputError,
    ui::{buttons, embeds},
};

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &JukeboxBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, bot, guild_id).await?,
        "playlist" => handle_playlist(ctx, &command, bot, guild_id).await?,
        "pause" => handle_pause(ctx, &command, bot, guild_id).await?,
        "resume" => handle_resume(ctx, &command, bot, guild_id).await?,
        "skip" => handle_skip(ctx, &command, bot, guild_id).await?,
        "stop" => handle_stop(ctx, &command, bot, guild_id).await?,
        "leave" => handle_leave(ctx, &command, bot, guild_id).await?,
        "queue" => handle_queue(ctx, &command, bot, guild_id).await?,
        "nowplaying" => handle_nowplaying(ctx, &command, bot, guild_id).await?,
        "shuffle" => handle_shuffle(ctx, &command, bot, guild_id).await?,
        "loop" => handle_loop(ctx, &command, bot, guild_id).await?,
        "volume" => handle_volume(ctx, &command, bot, guild_id).await?,
        "clear" => handle_clear(ctx, &command, bot, guild_id).await?,
        "help" => respond_embed(ctx, &command, embeds::help_embed(), true).await?,
        _ => respond(ctx, &command, "❌ Comando no reconocido", true).await?,
    }

    Ok(())
}

/// Maneja interacciones con componentes (botones)
pub async fn handle_component(
    ctx: &Context,
    component: ComponentInteraction,
    bot: &JukeboxBot,
) -> Result<()> {
    buttons::handle_music_component(ctx, &component, bot).await
}

// Handlers específicos para cada comando

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let query = option_str(command, "query")
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?
        .to_string();

    // Verificar que el usuario esté en un canal de voz antes de diferir
    let voice_channel_id = match get_user_voice_channel(ctx, guild_id, command.user.id) {
        Ok(channel_id) => channel_id,
        Err(e) => return respond(ctx, command, &format!("❌ {}", e), true).await,
    };

    // Defer la respuesta ya que puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let track = match bot.resolver().resolve(&query, command.user.id).await {
        Ok(track) => track,
        Err(e) => {
            warn!("🔍 Búsqueda fallida para `{}`: {:?}", query, e);
            let embed = embeds::error_embed("Sin resultados", &e.to_string());
            command
                .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
                .await?;
            return Ok(());
        }
    };

    let connection = match bot.join_voice_channel(ctx, guild_id, voice_channel_id).await {
        Ok(connection) => connection,
        Err(e) => {
            let embed = embeds::error_embed("Sin conexión de voz", &e.to_string());
            command
                .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
                .await?;
            return Ok(());
        }
    };
    let sink = Arc::new(ChannelSink::new(ctx.http.clone(), command.channel_id));

    let outcome = bot
        .queues()
        .start_or_enqueue(guild_id, track.clone(), connection, sink)
        .await;

    let response = match outcome {
        PlayOutcome::Started => EditInteractionResponse::new()
            .content(format!("🎵 Iniciando **{}**", track.title)),
        PlayOutcome::Queued(position) => {
            EditInteractionResponse::new().embed(embeds::track_added_embed(&track, position))
        }
    };
    command.edit_response(&ctx.http, response).await?;

    Ok(())
}

async fn handle_playlist(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let url = option_str(command, "url")
        .ok_or_else(|| anyhow::anyhow!("URL no proporcionada"))?
        .to_string();

    let voice_channel_id = match get_user_voice_channel(ctx, guild_id, command.user.id) {
        Ok(channel_id) => channel_id,
        Err(e) => return respond(ctx, command, &format!("❌ {}", e), true).await,
    };

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let playlist = match bot
        .resolver()
        .resolve_playlist(&url, command.user.id, bot.config().playlist_limit)
        .await
    {
        Ok(playlist) => playlist,
        Err(e) => {
            warn!("📋 Playlist fallida `{}`: {:?}", url, e);
            let embed = embeds::error_embed("Playlist no disponible", &e.to_string());
            command
                .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
                .await?;
            return Ok(());
        }
    };

    let connection = match bot.join_voice_channel(ctx, guild_id, voice_channel_id).await {
        Ok(connection) => connection,
        Err(e) => {
            let embed = embeds::error_embed("Sin conexión de voz", &e.to_string());
            command
                .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
                .await?;
            return Ok(());
        }
    };
    let sink = Arc::new(ChannelSink::new(ctx.http.clone(), command.channel_id));

    let embed = |started| embeds::playlist_added_embed(playlist.title.as_deref(), &playlist.tracks, started);
    // El resumen se muestra antes de que termine de cargar la primera canción
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed(false)))
        .await?;

    let outcome = bot
        .queues()
        .start_or_enqueue_many(guild_id, playlist.tracks.clone(), connection, sink)
        .await;

    if outcome == PlayOutcome::Started {
        command
            .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed(true)))
            .await?;
    }

    Ok(())
}

async fn handle_pause(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    if bot.queues().pause(guild_id).await {
        respond(ctx, command, "⏸️ Reproducción pausada", false).await
    } else {
        respond(ctx, command, "❌ No hay nada reproduciéndose", true).await
    }
}

async fn handle_resume(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    if bot.queues().resume(guild_id).await {
        respond(ctx, command, "▶️ Reproducción reanudada", false).await
    } else {
        respond(ctx, command, "❌ No hay nada en pausa", true).await
    }
}

async fn handle_skip(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    if bot.queues().skip(guild_id).await {
        respond(ctx, command, "⏭️ Canción saltada", false).await
    } else {
        respond(ctx, command, "❌ No hay nada que saltar", true).await
    }
}

async fn handle_stop(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    bot.queues().stop(guild_id).await;
    let embed = embeds::info_embed("Reproducción detenida", "⏹️ Cola limpiada y canal de voz liberado");
    respond_embed(ctx, command, embed, false).await
}

async fn handle_leave(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    bot.queues().stop(guild_id).await;
    bot.leave_voice_channel(ctx, guild_id).await?;
    respond(ctx, command, "👋 Desconectado del canal de voz", false).await
}

async fn handle_queue(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let page = option_i64(command, "page").unwrap_or(1).max(1) as usize;
    let snapshot = bot.queues().snapshot(guild_id).await;

    respond_embed(ctx, command, embeds::queue_embed(&snapshot, page), false).await
}

async fn handle_nowplaying(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let snapshot = bot.queues().snapshot(guild_id).await;

    let Some(track) = snapshot.current else {
        return respond(ctx, command, "❌ No hay nada reproduciéndose actualmente", true).await;
    };

    let card = NowPlayingCard {
        track,
        is_playing: snapshot.is_playing,
        loop_mode: snapshot.loop_mode,
        volume: snapshot.volume,
        queue_len: snapshot.pending.len(),
    };

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embeds::now_playing_embed(&card))
                    .components(buttons::player_controls(card.is_playing, card.loop_mode)),
            ),
        )
        .await?;
    Ok(())
}

async fn handle_shuffle(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    if bot.queues().shuffle(guild_id).await {
        respond(ctx, command, "🔀 Cola mezclada", false).await
    } else {
        respond(ctx, command, "❌ Se necesitan al menos 2 canciones en cola para mezclar", true).await
    }
}

async fn handle_loop(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let mode = match option_str(command, "mode") {
        Some(raw) => match raw.parse::<LoopMode>() {
            Ok(mode) => bot.queues().set_loop_mode(guild_id, mode).await,
            Err(e) => return respond(ctx, command, &format!("❌ {}", e), true).await,
        },
        None => bot.queues().toggle_loop(guild_id).await,
    };

    respond(ctx, command, &format!("Repetición: {}", mode), false).await
}

async fn handle_volume(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let max_volume = bot.queues().settings().max_volume;

    let Some(level) = option_i64(command, "level") else {
        let current = bot.queues().snapshot(guild_id).await.volume;
        return respond_embed(ctx, command, embeds::volume_embed(current, max_volume), true).await;
    };

    let result = match validate_volume_level(level, max_volume) {
        Ok(volume) => bot.queues().set_volume(guild_id, volume).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(volume) => respond_embed(ctx, command, embeds::volume_embed(volume, max_volume), false).await,
        Err(e) => respond(ctx, command, &format!("❌ {}", e), true).await,
    }
}

async fn handle_clear(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.queues().clear(guild_id).await {
        0 => respond(ctx, command, "📭 La cola ya estaba vacía", true).await,
        removed => respond(ctx, command, &format!("🗑️ {} canciones eliminadas de la cola", removed), false).await,
    }
}

/// `/volume` usa porcentaje entero, la cola usa factor
fn validate_volume_level(level: i64, max_volume: f32) -> Result<f32, UserInputError> {
    let max = (max_volume * 100.0).round() as i64;
    if !(0..=max).contains(&level) {
        return Err(UserInputError::VolumeOutOfRange { value: level, max });
    }
    Ok(level as f32 / 100.0)
}

// Funciones auxiliares

fn option_str<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn option_i64(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

async fn respond(ctx: &Context, command: &CommandInteraction, content: &str, ephemeral: bool) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

async fn respond_embed(
    ctx: &Context,
    command: &CommandInteraction,
    embed: CreateEmbed,
    ephemeral: bool,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embed)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_level_is_percent() {
        assert_eq!(validate_volume_level(100, 2.0), Ok(1.0));
        assert_eq!(validate_volume_level(200, 2.0), Ok(2.0));
        assert_eq!(validate_volume_level(0, 2.0), Ok(0.0));
    }

    #[test]
    fn test_volume_level_out_of_range() {
        assert_eq!(
            validate_volume_level(150, 1.0),
            Err(UserInputError::VolumeOutOfRange { value: 150, max: 100 })
        );
        assert_eq!(
            validate_volume_level(-5, 2.0),
            Err(UserInputError::VolumeOutOfRange { value: -5, max: 200 })
        );
    }
}
