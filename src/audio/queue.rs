//! Per-guild queue data model and its playback state machine.
//!
//! [`QueueState`] holds no live resources and performs no I/O. Every operation
//! mutates the state and returns the [`Effect`]s the manager has to carry out
//! (acquire a player, post a message, arm a timer...), so the whole machine
//! can be exercised without a player.

use rand::Rng;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info, warn};

use super::{
    backend::{NowPlayingCard, PlayerEvent},
    track::{LoopMode, Track},
};
use crate::error::UserInputError;

pub const DEFAULT_VOLUME: f32 = 0.8;
pub const MAX_VOLUME: f32 = 2.0;
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(180);
pub const SONG_LOOP_RETRIES: u8 = 2;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub default_volume: f32,
    pub max_volume: f32,
    pub inactivity_timeout: Duration,
    /// Fallos consecutivos tolerados en modo repetir canción antes de
    /// desactivar la repetición.
    pub song_loop_retries: u8,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_volume: DEFAULT_VOLUME,
            max_volume: MAX_VOLUME,
            inactivity_timeout: INACTIVITY_TIMEOUT,
            song_loop_retries: SONG_LOOP_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty,
    Loading,
    Playing,
    Paused,
}

/// Efectos que pide una transición, en el orden en que deben ejecutarse.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Acquire { url: String, generation: u64 },
    Notify(String),
    PostNowPlaying,
    RefreshNowPlaying,
    ArmInactivity,
    CancelInactivity,
    /// Detener y soltar el reproductor vivo; desde ahora es obsoleto.
    ReleasePlayer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Started,
    /// Posición 1-based dentro de la cola pendiente
    Queued(usize),
}

#[derive(Debug)]
pub struct QueueState {
    pending: VecDeque<Track>,
    current: Option<Track>,
    phase: Phase,
    volume: f32,
    max_volume: f32,
    loop_mode: LoopMode,
    generation: u64,
    song_loop_failures: u8,
    song_loop_retries: u8,
}

impl QueueState {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            phase: Phase::Empty,
            volume: settings.default_volume.clamp(0.0, settings.max_volume),
            max_volume: settings.max_volume,
            loop_mode: LoopMode::Off,
            generation: 0,
            song_loop_failures: 0,
            song_loop_retries: settings.song_loop_retries,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn is_playing(&self) -> bool {
        self.phase == Phase::Playing
    }

    /// Nada cargado y nada pendiente: el único estado en que el temporizador
    /// de inactividad puede estar armado.
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    /// Agrega al final de la cola sin tocar la reproducción.
    pub fn enqueue(&mut self, track: Track) -> (usize, Vec<Effect>) {
        info!("➕ Agregado a la cola: {}", track.title);
        self.pending.push_back(track);
        (self.pending.len(), vec![Effect::CancelInactivity])
    }

    /// Reproduce directamente si la guild está inactiva, si no encola.
    pub fn start_or_enqueue(&mut self, track: Track) -> (PlayOutcome, Vec<Effect>) {
        if self.phase != Phase::Empty || self.current.is_some() {
            let (position, effects) = self.enqueue(track);
            return (PlayOutcome::Queued(position), effects);
        }

        // Si había canciones encoladas sin reproducir, arranca la primera
        let (started, effects) = match self.pending.pop_front() {
            Some(head) => {
                self.pending.push_back(track);
                (head, vec![Effect::CancelInactivity])
            }
            None => (track, vec![Effect::CancelInactivity]),
        };

        let mut effects = effects;
        effects.push(self.begin_loading(started));
        (PlayOutcome::Started, effects)
    }

    /// Como [`Self::start_or_enqueue`] para una lista: la primera canción sigue
    /// esas reglas y el resto va al final, en orden. Con la lista vacía no
    /// hace nada.
    pub fn start_or_enqueue_many(&mut self, tracks: Vec<Track>) -> (PlayOutcome, Vec<Effect>) {
        let mut tracks = tracks.into_iter();
        let Some(first) = tracks.next() else {
            return (PlayOutcome::Queued(self.pending.len()), Vec::new());
        };

        let (outcome, effects) = self.start_or_enqueue(first);
        let before = self.pending.len();
        self.pending.extend(tracks);
        if self.pending.len() > before {
            info!("➕ {} canciones más agregadas a la cola", self.pending.len() - before);
        }
        (outcome, effects)
    }

    fn begin_loading(&mut self, track: Track) -> Effect {
        self.generation += 1;
        self.phase = Phase::Loading;
        let url = track.url.clone();
        debug!("⏳ Cargando {} (generación {})", track.title, self.generation);
        self.current = Some(track);
        Effect::Acquire {
            url,
            generation: self.generation,
        }
    }

    /// El reproductor de `generation` quedó suscrito y sonando.
    pub fn installed(&mut self, generation: u64) -> Vec<Effect> {
        if generation != self.generation || self.phase != Phase::Loading {
            debug!("Instalación obsoleta ignorada (generación {})", generation);
            return Vec::new();
        }

        self.phase = Phase::Playing;
        if let Some(track) = &self.current {
            info!("🎵 Reproduciendo: {}", track.title);
        }
        vec![Effect::CancelInactivity, Effect::PostNowPlaying]
    }

    pub fn acquisition_failed(&mut self, generation: u64, error: &str) -> Vec<Effect> {
        if generation != self.generation || self.phase != Phase::Loading {
            return Vec::new();
        }

        let title = self
            .current
            .as_ref()
            .map(|t| t.title.clone())
            .unwrap_or_default();
        warn!("❌ No se pudo cargar {}: {}", title, error);

        let mut effects = vec![Effect::Notify(format!(
            "❌ Error al reproducir **{}**: {}",
            title, error
        ))];
        effects.extend(self.register_song_loop_failure());
        effects.extend(self.complete(true));
        effects
    }

    pub fn player_event(&mut self, generation: u64, event: PlayerEvent) -> Vec<Effect> {
        if generation != self.generation {
            debug!("Evento {:?} de un reproductor reemplazado ignorado", event);
            return Vec::new();
        }

        match (event, self.phase) {
            // Eco de pause()/resume(): la fase ya la fijó el comando, y un eco
            // tardío no debe deshacer un resume posterior
            (PlayerEvent::Playing | PlayerEvent::Paused, phase) => {
                debug!("Reproductor confirma estado en fase {:?}", phase);
                Vec::new()
            }
            (PlayerEvent::Idle, Phase::Playing | Phase::Paused) => {
                self.song_loop_failures = 0;
                self.complete(false)
            }
            (PlayerEvent::Error(message), Phase::Playing | Phase::Paused) => {
                warn!("❌ Error de reproducción: {}", message);
                let mut effects = vec![Effect::Notify(format!(
                    "❌ Error de reproducción: {}",
                    message
                ))];
                let before = self.loop_mode;
                effects.extend(self.register_song_loop_failure());
                // Si la repetición se acaba de desactivar, la canción se descarta
                let gave_up = before == LoopMode::Song && self.loop_mode == LoopMode::Off;
                effects.extend(self.complete(gave_up));
                effects
            }
            _ => Vec::new(),
        }
    }

    fn register_song_loop_failure(&mut self) -> Vec<Effect> {
        if self.loop_mode != LoopMode::Song {
            return Vec::new();
        }

        self.song_loop_failures += 1;
        if self.song_loop_failures <= self.song_loop_retries {
            return Vec::new();
        }

        warn!(
            "🔂 {} fallos consecutivos en modo repetir canción, desactivando repetición",
            self.song_loop_failures
        );
        self.loop_mode = LoopMode::Off;
        self.song_loop_failures = 0;
        vec![Effect::Notify(
            "🔂 La canción falló varias veces seguidas, repetición desactivada".to_string(),
        )]
    }

    /// Transición de fin de canción. Las canciones `failed` nunca vuelven a la
    /// cola por el loop de cola, así que una racha de fallos siempre la achica.
    fn complete(&mut self, failed: bool) -> Vec<Effect> {
        let mut effects = vec![Effect::ReleasePlayer];
        let finished = self.current.take();

        if let Some(track) = finished {
            match self.loop_mode {
                LoopMode::Song => {
                    info!("🔂 Repitiendo: {}", track.title);
                    effects.push(self.begin_loading(track));
                    return effects;
                }
                LoopMode::Queue if !failed => {
                    debug!("🔁 {} vuelve al final de la cola", track.title);
                    self.pending.push_back(track);
                }
                _ => {}
            }
        }

        match self.pending.pop_front() {
            Some(next) => {
                info!("➡️ Siguiente en cola: {}", next.title);
                effects.push(self.begin_loading(next));
            }
            None => {
                info!("📭 Cola terminada");
                self.phase = Phase::Empty;
                effects.push(Effect::Notify("✅ ¡Cola terminada!".to_string()));
                effects.push(Effect::ArmInactivity);
            }
        }
        effects
    }

    /// `true` si hay un reproductor sonando que se pueda detener.
    pub fn can_skip(&self) -> bool {
        self.current.is_some() && self.phase == Phase::Playing
    }

    pub fn pause(&mut self) -> bool {
        if self.phase != Phase::Playing {
            return false;
        }
        self.phase = Phase::Paused;
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.phase != Phase::Paused {
            return false;
        }
        self.phase = Phase::Playing;
        true
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<f32, UserInputError> {
        if !volume.is_finite() {
            return Err(UserInputError::InvalidVolume);
        }
        self.volume = volume.clamp(0.0, self.max_volume);
        info!("🔊 Volumen ajustado a {}%", (self.volume * 100.0).round() as u32);
        Ok(self.volume)
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) -> LoopMode {
        self.loop_mode = mode;
        self.song_loop_failures = 0;
        info!("Modo de repetición: {}", mode);
        mode
    }

    pub fn toggle_loop(&mut self) -> LoopMode {
        self.set_loop_mode(self.loop_mode.next())
    }

    /// Fisher-Yates sobre `pending`. `current` no se toca.
    pub fn shuffle_with<R: Rng>(&mut self, rng: &mut R) -> bool {
        if self.pending.len() <= 1 {
            return false;
        }
        for i in (1..self.pending.len()).rev() {
            let j = rng.gen_range(0..=i);
            self.pending.swap(i, j);
        }
        info!("🔀 Cola mezclada ({} canciones)", self.pending.len());
        true
    }

    pub fn clear(&mut self) -> (usize, Vec<Effect>) {
        let removed = self.pending.len();
        self.pending.clear();
        info!("🗑️ Cola limpiada: {} canciones", removed);

        let effects = if self.is_idle() {
            vec![Effect::ArmInactivity]
        } else {
            vec![Effect::RefreshNowPlaying]
        };
        (removed, effects)
    }

    /// Descarta todo. Cualquier evento de reproductor en vuelo queda obsoleto.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.current = None;
        self.phase = Phase::Empty;
        self.generation += 1;
        self.song_loop_failures = 0;
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.clone(),
            pending: self.pending.iter().cloned().collect(),
            is_playing: self.is_playing(),
            volume: self.volume,
            loop_mode: self.loop_mode,
        }
    }

    pub fn now_playing_card(&self) -> Option<NowPlayingCard> {
        self.current.as_ref().map(|track| NowPlayingCard {
            track: track.clone(),
            is_playing: self.is_playing(),
            loop_mode: self.loop_mode,
            volume: self.volume,
            queue_len: self.pending.len(),
        })
    }
}

/// Vista de solo lectura para los comandos de estado y de cola.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub current: Option<Track>,
    pub pending: Vec<Track>,
    pub is_playing: bool,
    pub volume: f32,
    pub loop_mode: LoopMode,
}

impl QueueSnapshot {
    /// Snapshot de una guild sin cola registrada.
    pub fn idle(volume: f32) -> Self {
        Self {
            current: None,
            pending: Vec::new(),
            is_playing: false,
            volume,
            loop_mode: LoopMode::Off,
        }
    }

    pub fn total_duration(&self) -> Duration {
        let secs: u64 = self
            .current
            .iter()
            .chain(self.pending.iter())
            .map(|t| t.duration_secs)
            .sum();
        Duration::from_secs(secs)
    }

    /// Obtiene una página específica de la cola (1-based)
    pub fn page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let items_per_page = items_per_page.max(1);
        let total_items = self.pending.len();
        let total_pages = if total_items == 0 {
            1
        } else {
            total_items.div_ceil(items_per_page)
        };
        let current_page = page.clamp(1, total_pages);
        let start = (current_page - 1) * items_per_page;
        let end = (start + items_per_page).min(total_items);

        QueuePage {
            items: self.pending[start..end].to_vec(),
            first_position: start + 1,
            current_page,
            total_pages,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<Track>,
    pub first_position: usize,
    pub current_page: usize,
    pub total_pages: usize,
}
