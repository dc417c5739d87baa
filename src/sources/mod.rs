//! Turns a `/play` query into a [`Track`], and a `/playlist` URL into many.

use anyhow::{Context, Result};
use serde::Deserialize;
use serenity::model::id::UserId;
use songbird::input::{AuxMetadata, Compose, YoutubeDl};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::audio::track::Track;

const YOUTUBE_HOSTS: [&str; 5] = [
    "www.youtube.com",
    "youtube.com",
    "youtu.be",
    "m.youtube.com",
    "music.youtube.com",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Url(Url),
    Search(String),
}

impl Query {
    /// Anything that parses as an http(s) URL is played directly, everything
    /// else is a YouTube search.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {
                Some(Query::Url(url))
            }
            _ => Some(Query::Search(input.to_string())),
        }
    }

    pub fn is_youtube(&self) -> bool {
        match self {
            Query::Url(url) => url.host_str().is_some_and(|host| YOUTUBE_HOSTS.contains(&host)),
            Query::Search(_) => true,
        }
    }

    /// URL de YouTube que apunta a una lista: `/playlist?list=` o un video con `list=`.
    pub fn is_playlist(&self) -> bool {
        match self {
            Query::Url(url) => {
                self.is_youtube()
                    && (url.path() == "/playlist"
                        || url.query_pairs().any(|(key, value)| key == "list" && !value.is_empty()))
            }
            Query::Search(_) => false,
        }
    }
}

/// Entradas de una playlist ya convertidas en canciones.
#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    pub title: Option<String>,
    pub tracks: Vec<Track>,
}

/// Una línea de `yt-dlp --flat-playlist --dump-json`.
#[derive(Debug, Deserialize)]
struct PlaylistEntry {
    id: String,
    title: Option<String>,
    url: Option<String>,
    duration: Option<f64>,
    channel: Option<String>,
    uploader: Option<String>,
    playlist_title: Option<String>,
}

impl PlaylistEntry {
    /// `None` para videos privados o eliminados, que no se pueden reproducir.
    fn into_track(self, requested_by: &str) -> Option<Track> {
        let title = self.title?;
        if matches!(title.as_str(), "[Private video]" | "[Deleted video]") {
            debug!("Entrada no disponible omitida: {}", self.id);
            return None;
        }

        let url = self
            .url
            .filter(|url| url.starts_with("http"))
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", self.id));

        let mut track = Track::new(title, url, requested_by);
        if let Some(duration) = self.duration.filter(|d| d.is_finite() && *d > 0.0) {
            track = track.with_duration(Duration::from_secs_f64(duration));
        }
        if let Some(uploader) = self.channel.or(self.uploader) {
            track = track.with_uploader(uploader);
        }
        Some(track)
    }
}

/// Convierte la salida de yt-dlp, una entrada JSON por línea. Las líneas que
/// no se entienden se ignoran.
fn parse_playlist(stdout: &str, requested_by: UserId) -> Playlist {
    let requested_by = format!("<@{}>", requested_by);
    let mut title = None;
    let mut tracks = Vec::new();

    for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
        match serde_json::from_str::<PlaylistEntry>(line) {
            Ok(mut entry) => {
                if title.is_none() {
                    title = entry.playlist_title.take();
                }
                tracks.extend(entry.into_track(&requested_by));
            }
            Err(e) => debug!("Línea de playlist ignorada: {}", e),
        }
    }

    Playlist { title, tracks }
}

/// Resolves queries with yt-dlp metadata.
#[derive(Clone)]
pub struct SourceResolver {
    http: reqwest::Client,
    timeout: Duration,
}

impl SourceResolver {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub async fn resolve(&self, input: &str, requested_by: UserId) -> Result<Track> {
        let query = Query::parse(input).context("La búsqueda está vacía")?;
        debug!("🔍 Resolviendo {:?}", query);
        if !query.is_youtube() {
            debug!("Fuente externa a YouTube, yt-dlp intentará extraerla");
        }

        let mut source = match &query {
            Query::Url(url) => YoutubeDl::new(self.http.clone(), url.to_string()),
            Query::Search(text) => YoutubeDl::new_search(self.http.clone(), text.clone()),
        };

        let metadata = tokio::time::timeout(self.timeout, source.aux_metadata())
            .await
            .with_context(|| format!("Tiempo agotado buscando `{}`", input))?
            .map_err(|e| {
                warn!("❌ yt-dlp falló para {}: {}", input, e);
                anyhow::anyhow!("No se encontró nada para `{}`", input)
            })?;

        let track = track_from_metadata(&query, metadata, requested_by)?;
        info!("🎵 Resuelto: {} ({})", track.title, track.url);
        Ok(track)
    }

    /// Lee hasta `limit` entradas de una playlist de YouTube.
    pub async fn resolve_playlist(&self, input: &str, requested_by: UserId, limit: usize) -> Result<Playlist> {
        let query = Query::parse(input).context("La URL está vacía")?;
        if !query.is_playlist() {
            anyhow::bail!("`{}` no es una playlist de YouTube", input);
        }

        info!("📋 Obteniendo playlist: {}", input);
        let limit = limit.to_string();
        let mut command = async_process::Command::new("yt-dlp");
        command
            .args([
                "--flat-playlist",
                "--dump-json",
                "--playlist-end",
                limit.as_str(),
                "--no-warnings",
                input.trim(),
            ])
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .with_context(|| format!("Tiempo agotado leyendo la playlist `{}`", input))?
            .context("Error al ejecutar yt-dlp")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            warn!("❌ yt-dlp falló para la playlist {}: {}", input, error.trim());
            anyhow::bail!("No se pudo leer la playlist `{}`", input);
        }

        let playlist = parse_playlist(&String::from_utf8_lossy(&output.stdout), requested_by);
        if playlist.tracks.is_empty() {
            anyhow::bail!("La playlist `{}` no tiene canciones disponibles", input);
        }

        info!(
            "📋 Playlist {} con {} canciones",
            playlist.title.as_deref().unwrap_or(input),
            playlist.tracks.len()
        );
        Ok(playlist)
    }
}

fn track_from_metadata(query: &Query, metadata: AuxMetadata, requested_by: UserId) -> Result<Track> {
    let url = match (metadata.source_url, query) {
        (Some(url), _) => url,
        (None, Query::Url(url)) => url.to_string(),
        (None, Query::Search(text)) => anyhow::bail!("yt-dlp no devolvió URL para `{}`", text),
    };

    let title = metadata
        .title
        .or(metadata.track)
        .unwrap_or_else(|| "Título desconocido".to_string());

    let mut track = Track::new(title, url, format!("<@{}>", requested_by));
    if let Some(duration) = metadata.duration {
        track = track.with_duration(duration);
    }
    if let Some(uploader) = metadata.artist.or(metadata.channel) {
        track = track.with_uploader(uploader);
    }
    if let Some(thumbnail) = metadata.thumbnail {
        track = track.with_thumbnail(thumbnail);
    }
    Ok(track)
}

/// yt-dlp y ffmpeg deben estar en el PATH.
pub async fn verify_dependencies() -> Result<()> {
    for (binary, flag) in [("yt-dlp", "--version"), ("ffmpeg", "-version")] {
        let output = async_process::Command::new(binary)
            .arg(flag)
            .output()
            .await
            .with_context(|| format!("{} no está instalado o no está en PATH", binary))?;

        if !output.status.success() {
            anyhow::bail!("{} no puede ejecutarse correctamente", binary);
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!(
            "✅ {} versión: {}",
            binary,
            version.lines().next().unwrap_or_default().trim()
        );
    }
    Ok(())
}
