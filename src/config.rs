use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::queue::{QueueSettings, DEFAULT_VOLUME, INACTIVITY_TIMEOUT, MAX_VOLUME, SONG_LOOP_RETRIES};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Audio
    pub default_volume: f32,
    pub max_volume: f32,
    pub song_loop_retries: u8,
    pub playlist_limit: usize,

    // Tiempos (segundos)
    pub inactivity_timeout_secs: u64,
    pub acquisition_timeout_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, `load` uses the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            // Discord
            discord_token: lookup("DISCORD_TOKEN").context("DISCORD_TOKEN no está definido")?,
            application_id: lookup("APPLICATION_ID")
                .context("APPLICATION_ID no está definido")?
                .parse()
                .context("APPLICATION_ID debe ser numérico")?,
            guild_id: lookup("GUILD_ID").and_then(|s| s.parse().ok()),

            // Audio
            default_volume: parse_or(&lookup, "DEFAULT_VOLUME", defaults.default_volume)?,
            max_volume: parse_or(&lookup, "MAX_VOLUME", defaults.max_volume)?,
            song_loop_retries: parse_or(&lookup, "SONG_LOOP_RETRIES", defaults.song_loop_retries)?,
            playlist_limit: parse_or(&lookup, "PLAYLIST_LIMIT", defaults.playlist_limit)?,

            // Tiempos
            inactivity_timeout_secs: parse_or(
                &lookup,
                "INACTIVITY_TIMEOUT_SECS",
                defaults.inactivity_timeout_secs,
            )?,
            acquisition_timeout_secs: parse_or(
                &lookup,
                "ACQUISITION_TIMEOUT_SECS",
                defaults.acquisition_timeout_secs,
            )?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// - Max volume must be in `(0.0, 2.0]`
    /// - Default volume must be between 0.0 and the max volume
    /// - Timeouts must be greater than 0
    /// - Playlist limit must be greater than 0
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN está vacío");
        }

        if !(self.max_volume > 0.0 && self.max_volume <= MAX_VOLUME) {
            anyhow::bail!(
                "Max volume must be between 0.0 and {}, got: {}",
                MAX_VOLUME,
                self.max_volume
            );
        }

        if !(0.0..=self.max_volume).contains(&self.default_volume) {
            anyhow::bail!(
                "Default volume must be between 0.0 and {}, got: {}",
                self.max_volume,
                self.default_volume
            );
        }

        if self.inactivity_timeout_secs == 0 {
            anyhow::bail!("Inactivity timeout must be greater than 0");
        }

        if self.acquisition_timeout_secs == 0 {
            anyhow::bail!("Acquisition timeout must be greater than 0");
        }

        if self.playlist_limit == 0 {
            anyhow::bail!("Playlist limit must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging, without
    /// the token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Audio: {}% vol (max {}%), {} reintentos en repetición, playlists hasta {}\n  \
            Tiempos: {}s inactividad, {}s carga",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            (self.default_volume * 100.0).round() as u32,
            (self.max_volume * 100.0).round() as u32,
            self.song_loop_retries,
            self.playlist_limit,
            self.inactivity_timeout_secs,
            self.acquisition_timeout_secs,
        )
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            default_volume: self.default_volume,
            max_volume: self.max_volume,
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            song_loop_retries: self.song_loop_retries,
        }
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.acquisition_timeout_secs)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("{} tiene un valor inválido: {}", key, value)),
        _ => Ok(default),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (sin valores por defecto, deben configurarse)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            default_volume: DEFAULT_VOLUME,
            max_volume: MAX_VOLUME,
            song_loop_retries: SONG_LOOP_RETRIES,
            playlist_limit: 50,

            inactivity_timeout_secs: INACTIVITY_TIMEOUT.as_secs(),
            acquisition_timeout_secs: 25,
        }
    }
}
