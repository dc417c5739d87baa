use anyhow::Result;
use serenity::{
    all::{ButtonStyle, ComponentInteraction, Context},
    builder::{CreateActionRow, CreateButton, CreateInteractionResponse, CreateInteractionResponseMessage},
};
use tracing::{debug, info};

use crate::{
    audio::{manager::VOLUME_STEP, track::LoopMode},
    bot::JukeboxBot,
    ui::embeds,
};

/// IDs personalizados para los botones
pub mod button_ids {
    pub const PLAY_PAUSE: &str = "music_play_pause";
    pub const SKIP: &str = "music_skip";
    pub const STOP: &str = "music_stop";
    pub const LOOP: &str = "music_loop";
    pub const SHUFFLE: &str = "music_shuffle";
    pub const QUEUE: &str = "music_queue";
    pub const VOLUME_DOWN: &str = "music_volume_down";
    pub const VOLUME_UP: &str = "music_volume_up";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    PlayPause,
    Skip,
    Stop,
    Loop,
    Shuffle,
    Queue,
    VolumeDown,
    VolumeUp,
}

impl ButtonAction {
    pub fn from_custom_id(custom_id: &str) -> Option<Self> {
        let action = match custom_id {
            button_ids::PLAY_PAUSE => ButtonAction::PlayPause,
            button_ids::SKIP => ButtonAction::Skip,
            button_ids::STOP => ButtonAction::Stop,
            button_ids::LOOP => ButtonAction::Loop,
            button_ids::SHUFFLE => ButtonAction::Shuffle,
            button_ids::QUEUE => ButtonAction::Queue,
            button_ids::VOLUME_DOWN => ButtonAction::VolumeDown,
            button_ids::VOLUME_UP => ButtonAction::VolumeUp,
            _ => return None,
        };
        Some(action)
    }
}

fn loop_emoji(mode: LoopMode) -> char {
    match mode {
        LoopMode::Off => '➡',
        LoopMode::Song => '🔂',
        LoopMode::Queue => '🔁',
    }
}

/// Controles de la tarjeta de reproducción: dos filas, máximo 5 botones cada una
pub fn player_controls(is_playing: bool, loop_mode: LoopMode) -> Vec<CreateActionRow> {
    let play_pause_btn = CreateButton::new(button_ids::PLAY_PAUSE)
        .emoji(if is_playing { '⏸' } else { '▶' })
        .style(if is_playing { ButtonStyle::Secondary } else { ButtonStyle::Success });

    let skip_btn = CreateButton::new(button_ids::SKIP)
        .emoji('⏭')
        .style(ButtonStyle::Primary);

    let stop_btn = CreateButton::new(button_ids::STOP)
        .emoji('⏹')
        .style(ButtonStyle::Danger);

    let loop_btn = CreateButton::new(button_ids::LOOP)
        .emoji(loop_emoji(loop_mode))
        .style(if loop_mode == LoopMode::Off {
            ButtonStyle::Secondary
        } else {
            ButtonStyle::Success
        });

    let shuffle_btn = CreateButton::new(button_ids::SHUFFLE)
        .emoji('🔀')
        .style(ButtonStyle::Secondary);

    let row1 = CreateActionRow::Buttons(vec![
        play_pause_btn,
        skip_btn,
        stop_btn,
        loop_btn,
        shuffle_btn,
    ]);

    let vol_down_btn = CreateButton::new(button_ids::VOLUME_DOWN)
        .emoji('🔉')
        .style(ButtonStyle::Secondary);

    let vol_up_btn = CreateButton::new(button_ids::VOLUME_UP)
        .emoji('🔊')
        .style(ButtonStyle::Secondary);

    let queue_btn = CreateButton::new(button_ids::QUEUE)
        .label("Cola")
        .emoji('📋')
        .style(ButtonStyle::Secondary);

    let row2 = CreateActionRow::Buttons(vec![vol_down_btn, vol_up_btn, queue_btn]);

    vec![row1, row2]
}

/// Manejador de interacciones con los botones de la tarjeta.
///
/// Los cambios de estado ya editan la tarjeta desde la cola, así que la
/// mayoría de botones solo confirman la interacción.
pub async fn handle_music_component(
    ctx: &Context,
    interaction: &ComponentInteraction,
    bot: &JukeboxBot,
) -> Result<()> {
    let guild_id = interaction
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Componente usado fuera de un servidor"))?;
    let queues = bot.queues();

    let Some(action) = ButtonAction::from_custom_id(&interaction.data.custom_id) else {
        debug!("Componente no manejado: {}", interaction.data.custom_id);
        return reply_ephemeral(ctx, interaction, "⚠️ Botón no reconocido").await;
    };

    info!(
        "🔘 Botón {:?} presionado por {} en guild {}",
        action, interaction.user.name, guild_id
    );

    match action {
        ButtonAction::PlayPause => match queues.toggle_pause(guild_id).await {
            Some(_) => acknowledge(ctx, interaction).await,
            None => reply_ephemeral(ctx, interaction, "❌ No hay nada reproduciéndose").await,
        },
        ButtonAction::Skip => {
            if queues.skip(guild_id).await {
                acknowledge(ctx, interaction).await
            } else {
                reply_ephemeral(ctx, interaction, "❌ No hay nada que saltar").await
            }
        }
        ButtonAction::Stop => {
            queues.stop(guild_id).await;
            reply_ephemeral(ctx, interaction, "⏹️ Reproducción detenida").await
        }
        ButtonAction::Loop => {
            queues.toggle_loop(guild_id).await;
            acknowledge(ctx, interaction).await
        }
        ButtonAction::Shuffle => {
            let message = if queues.shuffle(guild_id).await {
                "🔀 Cola mezclada"
            } else {
                "❌ Se necesitan al menos 2 canciones en cola para mezclar"
            };
            reply_ephemeral(ctx, interaction, message).await
        }
        ButtonAction::Queue => {
            let snapshot = queues.snapshot(guild_id).await;
            interaction
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new()
                            .embed(embeds::queue_embed(&snapshot, 1))
                            .ephemeral(true),
                    ),
                )
                .await?;
            Ok(())
        }
        ButtonAction::VolumeDown | ButtonAction::VolumeUp => {
            let delta = if action == ButtonAction::VolumeUp {
                VOLUME_STEP
            } else {
                -VOLUME_STEP
            };
            match queues.adjust_volume(guild_id, delta).await {
                Ok(_) => acknowledge(ctx, interaction).await,
                Err(e) => reply_ephemeral(ctx, interaction, &format!("❌ {}", e)).await,
            }
        }
    }
}

async fn acknowledge(ctx: &Context, interaction: &ComponentInteraction) -> Result<()> {
    interaction
        .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
        .await?;
    Ok(())
}

async fn reply_ephemeral(ctx: &Context, interaction: &ComponentInteraction, content: &str) -> Result<()> {
    interaction
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await?;
    Ok(())
}
