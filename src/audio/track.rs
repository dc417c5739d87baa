use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

use crate::error::UserInputError;

/// Algo reproducible. La cola no interpreta `url`, solo la fábrica de
/// reproductores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    pub url: String,
    /// 0 = desconocida (streams en vivo)
    pub duration_secs: u64,
    pub requested_by: String,
    pub uploader: Option<String>,
    pub thumbnail: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(title: impl Into<String>, url: impl Into<String>, requested_by: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            duration_secs: 0,
            requested_by: requested_by.into(),
            uploader: None,
            thumbnail: None,
            added_at: Utc::now(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_secs = duration.as_secs();
        self
    }

    pub fn with_uploader(mut self, uploader: String) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: String) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    /// `None` cuando la duración es desconocida.
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopMode {
    #[default]
    Off,
    Song,
    Queue,
}

impl LoopMode {
    /// Off → Song → Queue → Off
    pub fn next(self) -> Self {
        match self {
            LoopMode::Off => LoopMode::Song,
            LoopMode::Song => LoopMode::Queue,
            LoopMode::Queue => LoopMode::Off,
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            LoopMode::Off => "➡️",
            LoopMode::Song => "🔂",
            LoopMode::Queue => "🔁",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LoopMode::Off => "Desactivado",
            LoopMode::Song => "Canción",
            LoopMode::Queue => "Cola",
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.emoji(), self.label())
    }
}

impl FromStr for LoopMode {
    type Err = UserInputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Ok(LoopMode::Off),
            "song" | "s" | "track" | "1" => Ok(LoopMode::Song),
            "queue" | "q" | "2" => Ok(LoopMode::Queue),
            other => Err(UserInputError::UnknownLoopMode(other.to_string())),
        }
    }
}
