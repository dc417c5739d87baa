//! songbird implementations of the playback contracts.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::{Input, YoutubeDl},
    tracks::{Track as SongbirdTrack, TrackHandle},
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use super::backend::{
    PlayerBundle, PlayerEvent, PlayerEvents, PlayerFactory, PlayerHandle, ResourceHandle,
    VoiceConnection,
};
use crate::error::{AcquisitionError, PlaybackError, TransportError};

type SharedHandle = Arc<SyncMutex<Option<TrackHandle>>>;

/// Crea reproductores sobre yt-dlp. Los metadatos se piden antes, así un enlace
/// muerto falla aquí y no después de instalar el reproductor.
pub struct SongbirdFactory {
    http: reqwest::Client,
    timeout: Duration,
}

impl SongbirdFactory {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl PlayerFactory for SongbirdFactory {
    type Player = SongbirdPlayer;

    async fn create_player(&self, url: &str) -> Result<PlayerBundle<SongbirdPlayer>, AcquisitionError> {
        if url::Url::parse(url).is_err() {
            return Err(AcquisitionError::InvalidUrl(url.to_string()));
        }

        let mut input: Input = YoutubeDl::new(self.http.clone(), url.to_string()).into();

        match tokio::time::timeout(self.timeout, input.aux_metadata()).await {
            Ok(Ok(metadata)) => {
                debug!(
                    "🎼 Audio listo: {}",
                    metadata.title.as_deref().unwrap_or(url)
                );
            }
            Ok(Err(e)) => {
                warn!("❌ yt-dlp no pudo obtener {}: {}", url, e);
                return Err(AcquisitionError::Network(e.to_string()));
            }
            Err(_) => {
                warn!("⏰ Timeout obteniendo {}", url);
                return Err(AcquisitionError::Timeout(self.timeout.as_secs()));
            }
        }

        let handle: SharedHandle = Arc::new(SyncMutex::new(None));
        Ok(PlayerBundle {
            player: SongbirdPlayer {
                call: SyncMutex::new(None),
                handle: handle.clone(),
                events: SyncMutex::new(None),
            },
            resource: SongbirdResource {
                input: SyncMutex::new(Some(input)),
                volume: SyncMutex::new(1.0),
                handle,
            },
        })
    }
}

/// El audio, que arranca al reproducirse, y el volumen con el que empezará.
pub struct SongbirdResource {
    input: SyncMutex<Option<Input>>,
    volume: SyncMutex<f32>,
    handle: SharedHandle,
}

impl ResourceHandle for SongbirdResource {
    fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume;
        if let Some(handle) = self.handle.lock().as_ref() {
            if let Err(e) = handle.set_volume(volume) {
                debug!("No se pudo ajustar el volumen del track: {}", e);
            }
        }
    }
}

pub struct SongbirdPlayer {
    call: SyncMutex<Option<Arc<Mutex<Call>>>>,
    handle: SharedHandle,
    events: SyncMutex<Option<PlayerEvents>>,
}

impl SongbirdPlayer {
    fn bind(&self, call: Arc<Mutex<Call>>) {
        *self.call.lock() = Some(call);
    }
}

#[async_trait]
impl PlayerHandle for SongbirdPlayer {
    type Resource = SongbirdResource;

    fn listen(&self, events: PlayerEvents) {
        *self.events.lock() = Some(events);
    }

    async fn play(&self, resource: &SongbirdResource) -> Result<(), PlaybackError> {
        let Some(call) = self.call.lock().clone() else {
            return Err(PlaybackError("el reproductor no tiene conexión de voz".to_string()));
        };
        let Some(input) = resource.input.lock().take() else {
            return Err(PlaybackError("el audio ya fue consumido".to_string()));
        };

        let track = SongbirdTrack::from(input).volume(*resource.volume.lock());
        let handle = call.lock().await.play_only(track);

        let events = self.events.lock().clone();
        if let Some(events) = events {
            for forward in Forward::ALL {
                handle
                    .add_event(Event::Track(forward.track_event()), ForwardEvent { forward, events: events.clone() })
                    .map_err(|e| PlaybackError(format!("no se pudo registrar eventos: {}", e)))?;
            }
        }

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn pause(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.pause().is_ok())
    }

    fn unpause(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.play().is_ok())
    }

    fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            // songbird emite End al detener, eso es nuestro Idle
            if let Err(e) = handle.stop() {
                debug!("Track ya detenido: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Forward {
    Play,
    Pause,
    End,
    Error,
}

impl Forward {
    const ALL: [Forward; 4] = [Forward::Play, Forward::Pause, Forward::End, Forward::Error];

    fn track_event(self) -> TrackEvent {
        match self {
            Forward::Play => TrackEvent::Play,
            Forward::Pause => TrackEvent::Pause,
            Forward::End => TrackEvent::End,
            Forward::Error => TrackEvent::Error,
        }
    }

    fn player_event(self, detail: Option<String>) -> PlayerEvent {
        match self {
            Forward::Play => PlayerEvent::Playing,
            Forward::Pause => PlayerEvent::Paused,
            Forward::End => PlayerEvent::Idle,
            Forward::Error => {
                PlayerEvent::Error(detail.unwrap_or_else(|| "error desconocido".to_string()))
            }
        }
    }
}

struct ForwardEvent {
    forward: Forward,
    events: PlayerEvents,
}

#[async_trait]
impl VoiceEventHandler for ForwardEvent {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let detail = match ctx {
            EventContext::Track(tracks) => tracks
                .first()
                .map(|(state, _)| format!("{:?}", state.playing)),
            _ => None,
        };
        self.events.emit(self.forward.player_event(detail));
        None
    }
}

/// Plazo en el que se espera el aviso de Discord de una salida propia.
const SELF_DISCONNECT_WINDOW: Duration = Duration::from_secs(10);

/// Salidas de voz que pidió el propio bot.
///
/// Discord avisa de ellas igual que de una desconexión manual, y el aviso
/// puede llegar después de que un `/play` rápido abrió una sesión nueva.
#[derive(Debug, Default)]
pub struct SelfDisconnects {
    expected: DashMap<GuildId, Instant>,
}

impl SelfDisconnects {
    pub fn expect(&self, guild_id: GuildId) {
        self.expected.insert(guild_id, Instant::now());
    }

    pub fn forget(&self, guild_id: GuildId) {
        self.expected.remove(&guild_id);
    }

    /// `true` si la desconexión de `guild_id` la pidió el bot hace poco.
    /// Consume la marca.
    pub fn take_expected(&self, guild_id: GuildId) -> bool {
        self.expected
            .remove(&guild_id)
            .is_some_and(|(_, at)| at.elapsed() <= SELF_DISCONNECT_WINDOW)
    }
}

/// El `Call` de songbird de una guild.
pub struct SongbirdConnection {
    manager: Arc<Songbird>,
    disconnects: Arc<SelfDisconnects>,
    guild_id: GuildId,
    call: Arc<Mutex<Call>>,
    destroyed: AtomicBool,
}

impl SongbirdConnection {
    /// Entra (o se mueve) a `channel_id`.
    pub async fn join(
        manager: Arc<Songbird>,
        disconnects: Arc<SelfDisconnects>,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Self, TransportError> {
        let call = manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| TransportError::Failed(e.to_string()))?;

        info!("🔊 Conectado al canal de voz {} en guild {}", channel_id, guild_id);
        Ok(Self {
            manager,
            disconnects,
            guild_id,
            call,
            destroyed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    type Player = SongbirdPlayer;

    async fn subscribe(&self, player: &SongbirdPlayer) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        player.bind(self.call.clone());
        Ok(())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnects.expect(self.guild_id);
        match self.manager.remove(self.guild_id).await {
            Ok(()) => info!("👋 Desconectado del canal de voz en guild {}", self.guild_id),
            Err(e) => {
                self.disconnects.forget(self.guild_id);
                debug!("Conexión de voz ya cerrada en guild {}: {}", self.guild_id, e);
            }
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
