use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::audio::{
    backend::NowPlayingCard,
    queue::{QueuePage, QueueSnapshot},
    track::{LoopMode, Track},
};

pub const ITEMS_PER_PAGE: usize = 10;

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Guild Jukebox";

/// Tarjeta de "Reproduciendo Ahora", se edita en el mismo mensaje
pub fn now_playing_embed(card: &NowPlayingCard) -> CreateEmbed {
    let track = &card.track;
    let (title, color) = if card.is_playing {
        ("🎵 Reproduciendo Ahora", colors::SUCCESS_GREEN)
    } else {
        ("⏸️ En Pausa", colors::WARNING_ORANGE)
    };

    let mut embed = CreateEmbed::default()
        .title(title)
        .description(format!("**{}**", track.title))
        .color(color)
        .field("🎤 Artista", track.uploader.as_deref().unwrap_or("Desconocido"), true)
        .field("⏱️ Duración", duration_label(track), true)
        .field("👤 Solicitado por", &track.requested_by, true)
        .field("🔁 Repetición", card.loop_mode.to_string(), true)
        .field("🔊 Volumen", format!("{}%", percent(card.volume)), true)
        .field("📋 En cola", card.queue_len.to_string(), true);

    if let Some(thumbnail) = &track.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }

    embed
        .url(&track.url)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed para mostrar que se agregó una canción
pub fn track_added_embed(track: &Track, position: usize) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("✅ Canción Agregada")
        .description(format!("**{}** se ha agregado a la cola de reproducción", track.title))
        .color(colors::SUCCESS_GREEN)
        .field("🎤 Artista", track.uploader.as_deref().unwrap_or("Desconocido"), true)
        .field("⏱️ Duración", duration_label(track), true)
        .field("📍 Posición", format!("#{}", position), true);

    if let Some(thumbnail) = &track.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }

    embed
        .url(&track.url)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new("🎵 Se reproducirá cuando llegue su turno"))
}

/// Resumen de una playlist recién cargada
pub fn playlist_added_embed(title: Option<&str>, tracks: &[Track], started: bool) -> CreateEmbed {
    let count = tracks.len();
    let description = if count == 1 {
        "Se agregó **1 canción** de la playlist a la cola".to_string()
    } else {
        format!("Se agregaron **{} canciones** de la playlist a la cola", count)
    };

    let total: u64 = tracks.iter().map(|t| t.duration_secs).sum();
    let mut embed = CreateEmbed::default()
        .title(format!("📋 {}", title.unwrap_or("Playlist Agregada")))
        .description(description)
        .color(colors::MUSIC_PURPLE)
        .field("📊 Canciones", count.to_string(), true)
        .field("⏱️ Duración total", format_duration(Duration::from_secs(total)), true);

    if let Some(first) = tracks.first() {
        let label = if started { "▶️ Sonando" } else { "⏭️ Primera" };
        embed = embed.field(label, format!("**{}**", first.title), false);
    }

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new("🎵 Usa /queue para ver todas las canciones"))
}

/// Crea un embed para mostrar la cola de reproducción
pub fn queue_embed(snapshot: &QueueSnapshot, page: usize) -> CreateEmbed {
    let embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    if snapshot.current.is_none() && snapshot.pending.is_empty() {
        return embed
            .description("😴 **La cola está vacía**\n\n💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    let mut embed = embed;

    if let Some(current) = &snapshot.current {
        let status = if snapshot.is_playing { "▶️" } else { "⏸️" };
        embed = embed.field(
            format!("{} Reproduciendo", status),
            format!("**{}**{}", current.title, by_line(current)),
            false,
        );
    }

    let queue_page = snapshot.page(page, ITEMS_PER_PAGE);
    if !queue_page.items.is_empty() {
        embed = embed.field("Próximas canciones", queue_lines(&queue_page), false);
    }

    let mut info = format!("**En cola:** {} canciones", snapshot.pending.len());
    let total = snapshot.total_duration();
    if total > Duration::ZERO {
        info.push_str(&format!(" • **Duración:** {}", format_duration(total)));
    }
    if snapshot.loop_mode != LoopMode::Off {
        info.push_str(&format!(" • {}", snapshot.loop_mode));
    }
    info.push_str(&format!(" • 🔊 {}%", percent(snapshot.volume)));
    embed = embed.field("Información", info, false);

    let footer = if queue_page.total_pages > 1 {
        format!(
            "Página {} de {} • Guild Jukebox",
            queue_page.current_page, queue_page.total_pages
        )
    } else {
        STANDARD_FOOTER.to_string()
    };

    embed
        .footer(CreateEmbedFooter::new(footer))
        .timestamp(Timestamp::now())
}

/// Crea un embed de ayuda general
pub fn help_embed() -> CreateEmbed {
    CreateEmbed::default()
        .title("🎵 Guild Jukebox - Comandos")
        .color(colors::MUSIC_PURPLE)
        .field(
            "🎵 Reproducción",
            "• `/play <canción>` - Reproduce o agrega a la cola\n\
            • `/playlist <url>` - Agrega una playlist de YouTube\n\
            • `/pause` - Pausa la reproducción\n\
            • `/resume` - Reanuda la reproducción\n\
            • `/skip` - Salta la canción actual\n\
            • `/stop` - Detiene todo y sale del canal",
            false,
        )
        .field(
            "📜 Cola",
            "• `/queue [página]` - Muestra la cola\n\
            • `/shuffle` - Mezcla las canciones pendientes\n\
            • `/loop [modo]` - off, song o queue\n\
            • `/clear` - Vacía la cola pendiente",
            false,
        )
        .field(
            "🎛️ Audio",
            "• `/volume [nivel]` - Ajusta el volumen (0-200)\n\
            • `/nowplaying` - Muestra la canción actual\n\
            • `/leave` - Desconecta del canal",
            false,
        )
        .footer(CreateEmbedFooter::new(
            "💤 Salgo solo tras unos minutos sin música",
        ))
        .timestamp(Timestamp::now())
}

/// Crea un embed de error
pub fn error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de información
pub fn info_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("ℹ️ {}", title))
        .description(description)
        .color(colors::INFO_BLUE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de volumen con indicador visual
pub fn volume_embed(volume: f32, max_volume: f32) -> CreateEmbed {
    let emoji = match percent(volume) {
        0 => "🔇",
        1..=50 => "🔉",
        _ => "🔊",
    };

    CreateEmbed::default()
        .title(format!("{} Volumen: {}%", emoji, percent(volume)))
        .description(volume_bar(volume, max_volume))
        .color(colors::INFO_BLUE)
        .footer(CreateEmbedFooter::new("💡 Usa los botones 🔉/🔊 o /volume <nivel>"))
        .timestamp(Timestamp::now())
}

fn queue_lines(page: &QueuePage) -> String {
    page.items
        .iter()
        .enumerate()
        .map(|(i, track)| {
            let duration = track
                .duration()
                .map(|d| format!(" `[{}]`", format_duration(d)))
                .unwrap_or_default();
            format!(
                "**{}**. {}{}{}\n",
                page.first_position + i,
                track.title,
                by_line(track),
                duration
            )
        })
        .collect()
}

fn by_line(track: &Track) -> String {
    track
        .uploader
        .as_ref()
        .map(|uploader| format!(" - {}", uploader))
        .unwrap_or_default()
}

fn duration_label(track: &Track) -> String {
    track
        .duration()
        .map(format_duration)
        .unwrap_or_else(|| "🔴 En vivo".to_string())
}

fn percent(volume: f32) -> u32 {
    (volume * 100.0).round().max(0.0) as u32
}

/// Crea una barra visual de volumen
fn volume_bar(volume: f32, max_volume: f32) -> String {
    let segments = 20;
    let filled = if max_volume > 0.0 {
        ((volume / max_volume) * segments as f32).round() as usize
    } else {
        0
    }
    .min(segments);

    format!("`[{}{}]`", "█".repeat(filled), "▒".repeat(segments - filled))
}

/// Formatea una duración en formato legible
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
