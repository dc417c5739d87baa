//! Contracts between the queue core and the outside world.
//!
//! The core never touches Discord or songbird directly: it asks a
//! [`PlayerFactory`] for a player, routes it through a [`VoiceConnection`] and
//! reports to a [`NotificationSink`]. `songbird_backend` and `bot::sink` are
//! the production implementations.

use async_trait::async_trait;
use serenity::model::id::GuildId;
use tokio::sync::mpsc;
use tracing::debug;

use super::track::{LoopMode, Track};
use crate::error::{AcquisitionError, PlaybackError, SinkError, TransportError};

/// Eventos de ciclo de vida que reporta un reproductor.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Playing,
    Paused,
    Idle,
    Error(String),
}

/// Evento de reproductor con la guild y la generación de carga a la que pertenece.
#[derive(Debug, Clone)]
pub struct PlayerSignal {
    pub guild_id: GuildId,
    pub generation: u64,
    pub event: PlayerEvent,
}

/// Se entrega a cada reproductor instalado. Clonarlo es barato; emitir nunca
/// bloquea ni falla (un canal cerrado solo significa que la cola ya no existe).
#[derive(Debug, Clone)]
pub struct PlayerEvents {
    guild_id: GuildId,
    generation: u64,
    tx: mpsc::UnboundedSender<PlayerSignal>,
}

impl PlayerEvents {
    pub(crate) fn new(guild_id: GuildId, generation: u64, tx: mpsc::UnboundedSender<PlayerSignal>) -> Self {
        Self { guild_id, generation, tx }
    }

    pub fn emit(&self, event: PlayerEvent) {
        let signal = PlayerSignal {
            guild_id: self.guild_id,
            generation: self.generation,
            event,
        };
        if self.tx.send(signal).is_err() {
            debug!("Evento de reproductor descartado, el gestor ya no existe");
        }
    }
}

#[async_trait]
pub trait PlayerHandle: Send + Sync + 'static {
    type Resource: ResourceHandle;

    /// Registra a dónde van los eventos. Se llama una vez, antes de `play`.
    fn listen(&self, events: PlayerEvents);

    async fn play(&self, resource: &Self::Resource) -> Result<(), PlaybackError>;

    fn pause(&self) -> bool;

    fn unpause(&self) -> bool;

    /// Debe terminar reportando [`PlayerEvent::Idle`] si el reproductor sonaba.
    fn stop(&self);
}

pub trait ResourceHandle: Send + Sync + 'static {
    fn set_volume(&self, volume: f32);
}

pub struct PlayerBundle<P: PlayerHandle> {
    pub player: P,
    pub resource: P::Resource,
}

#[async_trait]
pub trait PlayerFactory: Send + Sync + 'static {
    type Player: PlayerHandle;

    async fn create_player(&self, url: &str) -> Result<PlayerBundle<Self::Player>, AcquisitionError>;
}

#[async_trait]
pub trait VoiceConnection: Send + Sync + 'static {
    type Player: PlayerHandle;

    /// Conecta el audio del reproductor al transporte, reemplazando lo que
    /// hubiera antes.
    async fn subscribe(&self, player: &Self::Player) -> Result<(), TransportError>;

    async fn destroy(&self);

    fn is_destroyed(&self) -> bool;
}

/// Referencia opaca a un mensaje que publicó el sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef(pub u64);

/// Todo lo que muestra la tarjeta de "Reproduciendo Ahora".
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlayingCard {
    pub track: Track,
    pub is_playing: bool,
    pub loop_mode: LoopMode,
    pub volume: f32,
    pub queue_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Notice(String),
    NowPlaying(NowPlayingCard),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn post(&self, content: Outgoing) -> Result<MessageRef, SinkError>;

    async fn edit(&self, message: MessageRef, content: Outgoing) -> Result<(), SinkError>;

    async fn delete(&self, message: MessageRef) -> Result<(), SinkError>;
}
