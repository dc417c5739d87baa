//! Owns every guild's queue and drives the playback state machine.
//!
//! Each guild lives behind its own `tokio::sync::Mutex` and has its own
//! player event channel, drained by a task that belongs to that guild alone.
//! Commands and player events for one guild are applied one at a time; the
//! lock stays held while that guild's notices and cards are sent, so a slow
//! Discord call only delays the guild it belongs to. The lock is released
//! while a player is being acquired (the `Loading` phase), and the result is
//! only installed if the queue still expects that exact load generation.

use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::{
    backend::{
        MessageRef, NotificationSink, Outgoing, PlayerBundle, PlayerEvents, PlayerFactory,
        PlayerHandle, PlayerSignal, ResourceHandle, VoiceConnection,
    },
    inactivity::TimerSlot,
    queue::{Effect, Phase, PlayOutcome, QueueSettings, QueueSnapshot, QueueState},
    track::{LoopMode, Track},
};
use crate::error::{TransportError, UserInputError};

/// Paso de volumen de los botones 🔉/🔊
pub const VOLUME_STEP: f32 = 0.1;

type Shared<P, C> = Arc<Mutex<GuildQueue<P, C>>>;

/// Estado vivo de una guild: el [`QueueState`] puro más los recursos que
/// posee en exclusiva.
pub struct GuildQueue<P: PlayerHandle, C: VoiceConnection> {
    guild_id: GuildId,
    state: QueueState,
    events: mpsc::UnboundedSender<PlayerSignal>,
    connection: Option<Arc<C>>,
    live: Option<PlayerBundle<P>>,
    sink: Option<Arc<dyn NotificationSink>>,
    now_playing: Option<MessageRef>,
    inactivity: TimerSlot,
    evicted: bool,
}

impl<P: PlayerHandle, C: VoiceConnection> GuildQueue<P, C> {
    fn new(
        guild_id: GuildId,
        settings: &QueueSettings,
        events: mpsc::UnboundedSender<PlayerSignal>,
    ) -> Self {
        debug!("Nueva cola para guild {}", guild_id);
        Self {
            guild_id,
            state: QueueState::new(settings),
            events,
            connection: None,
            live: None,
            sink: None,
            now_playing: None,
            inactivity: TimerSlot::new(),
            evicted: false,
        }
    }

    /// Una conexión viva nunca se reemplaza, solo una ausente o destruida.
    fn adopt_connection(&mut self, connection: Arc<C>) {
        match &self.connection {
            Some(existing) if !existing.is_destroyed() => {}
            _ => self.connection = Some(connection),
        }
    }

    fn release_player(&mut self) {
        if let Some(bundle) = self.live.take() {
            bundle.player.stop();
        }
    }

    async fn notify(&self, text: String) {
        let Some(sink) = &self.sink else { return };
        if let Err(e) = sink.post(Outgoing::Notice(text)).await {
            debug!("No se pudo enviar aviso en guild {}: {}", self.guild_id, e);
        }
    }

    async fn post_now_playing(&mut self) {
        let Some(sink) = self.sink.clone() else { return };

        if let Some(previous) = self.now_playing.take() {
            if let Err(e) = sink.delete(previous).await {
                debug!("Mensaje anterior de reproducción no eliminado: {}", e);
            }
        }

        let Some(card) = self.state.now_playing_card() else { return };
        match sink.post(Outgoing::NowPlaying(card)).await {
            Ok(message) => self.now_playing = Some(message),
            Err(e) => warn!("No se pudo publicar el mensaje de reproducción: {}", e),
        }
    }

    async fn refresh_now_playing(&mut self) {
        let (Some(message), Some(sink), Some(card)) = (
            self.now_playing,
            self.sink.clone(),
            self.state.now_playing_card(),
        ) else {
            return;
        };

        if let Err(e) = sink.edit(message, Outgoing::NowPlaying(card)).await {
            // Probablemente lo borró un usuario, se vuelve a publicar con la próxima canción
            debug!("No se pudo editar el mensaje de reproducción: {}", e);
            self.now_playing = None;
        }
    }

    /// Cada paso se comprueba por separado: es seguro sobre una cola a medio
    /// destruir.
    async fn teardown(&mut self) {
        self.evicted = true;
        self.state.reset();
        self.inactivity.cancel();
        self.release_player();

        if let Some(connection) = self.connection.take() {
            if !connection.is_destroyed() {
                connection.destroy().await;
            }
        }

        if let (Some(message), Some(sink)) = (self.now_playing.take(), self.sink.clone()) {
            tokio::spawn(async move {
                if let Err(e) = sink.delete(message).await {
                    debug!("Mensaje de reproducción no eliminado: {}", e);
                }
            });
        }

        info!("⏹️ Cola destruida para guild {}", self.guild_id);
    }
}

struct Inner<F, C>
where
    F: PlayerFactory,
    C: VoiceConnection<Player = F::Player>,
{
    queues: DashMap<GuildId, Shared<F::Player, C>>,
    factory: Arc<F>,
    settings: QueueSettings,
}

/// Registro de colas por guild. Clonarlo es barato y todos los clones
/// comparten el mismo registro.
pub struct QueueManager<F, C>
where
    F: PlayerFactory,
    C: VoiceConnection<Player = F::Player>,
{
    inner: Arc<Inner<F, C>>,
}

impl<F, C> Clone for QueueManager<F, C>
where
    F: PlayerFactory,
    C: VoiceConnection<Player = F::Player>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F, C> QueueManager<F, C>
where
    F: PlayerFactory,
    C: VoiceConnection<Player = F::Player>,
{
    pub fn new(factory: Arc<F>, settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: DashMap::new(),
                factory,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Agrega a `pending` sin tocar la reproducción. Devuelve la posición
    /// (base 1).
    pub async fn enqueue(&self, guild_id: GuildId, track: Track) -> usize {
        let (_, mut queue) = self.lock(guild_id).await;
        let (position, effects) = queue.state.enqueue(track);
        self.apply_effects(&mut queue, effects).await;
        position
    }

    /// Arranca `track` si la guild está inactiva, si no lo encola. Termina
    /// cuando algo suena o todos los candidatos fallaron.
    pub async fn start_or_enqueue(
        &self,
        guild_id: GuildId,
        track: Track,
        connection: Arc<C>,
        sink: Arc<dyn NotificationSink>,
    ) -> PlayOutcome {
        self.start_or_enqueue_many(guild_id, vec![track], connection, sink)
            .await
    }

    /// Carga de playlist: la primera canción se comporta como
    /// [`Self::start_or_enqueue`] y el resto se agrega detrás, en orden.
    pub async fn start_or_enqueue_many(
        &self,
        guild_id: GuildId,
        tracks: Vec<Track>,
        connection: Arc<C>,
        sink: Arc<dyn NotificationSink>,
    ) -> PlayOutcome {
        let (shared, mut queue) = self.lock(guild_id).await;
        queue.sink = Some(sink);
        queue.adopt_connection(connection);

        let (outcome, effects) = queue.state.start_or_enqueue_many(tracks);
        self.drive(shared, queue, effects).await;
        outcome
    }

    /// Detiene el reproductor; la transición de fin de canción (con las
    /// reglas de loop) llega con el evento `Idle` del reproductor.
    pub async fn skip(&self, guild_id: GuildId) -> bool {
        let Some((_, queue)) = self.existing_locked(guild_id).await else {
            return false;
        };
        if !queue.state.can_skip() {
            return false;
        }

        match &queue.live {
            Some(bundle) => {
                if let Some(track) = queue.state.current() {
                    info!("⏭️ Saltando: {}", track.title);
                }
                bundle.player.stop();
                true
            }
            None => false,
        }
    }

    /// Destrucción completa e idempotente. Segura en guilds que nunca sonaron.
    pub async fn stop(&self, guild_id: GuildId) {
        let Some((_, shared)) = self.inner.queues.remove(&guild_id) else {
            debug!("Nada que detener en guild {}", guild_id);
            return;
        };

        let mut queue = shared.lock().await;
        if !queue.evicted {
            queue.teardown().await;
        }
    }

    pub async fn pause(&self, guild_id: GuildId) -> bool {
        let Some((_, mut queue)) = self.existing_locked(guild_id).await else {
            return false;
        };
        if queue.live.is_none() || !queue.state.pause() {
            return false;
        }

        if let Some(bundle) = &queue.live {
            bundle.player.pause();
        }
        info!("⏸️ Reproducción pausada en guild {}", guild_id);
        queue.refresh_now_playing().await;
        true
    }

    pub async fn resume(&self, guild_id: GuildId) -> bool {
        let Some((_, mut queue)) = self.existing_locked(guild_id).await else {
            return false;
        };
        if queue.live.is_none() || !queue.state.resume() {
            return false;
        }

        if let Some(bundle) = &queue.live {
            bundle.player.unpause();
        }
        info!("▶️ Reproducción reanudada en guild {}", guild_id);
        queue.refresh_now_playing().await;
        true
    }

    /// Botón ⏯️: `Some(true)` si quedó sonando, `None` si no había nada.
    pub async fn toggle_pause(&self, guild_id: GuildId) -> Option<bool> {
        let phase = self.existing_locked(guild_id).await?.1.state.phase();
        match phase {
            Phase::Playing => self.pause(guild_id).await.then_some(false),
            Phase::Paused => self.resume(guild_id).await.then_some(true),
            _ => None,
        }
    }

    /// Limita a `[0, max_volume]` y lo aplica al recurso vivo, si lo hay.
    pub async fn set_volume(&self, guild_id: GuildId, volume: f32) -> Result<f32, UserInputError> {
        let (_, mut queue) = self.lock(guild_id).await;
        self.apply_volume(&mut queue, volume).await
    }

    pub async fn adjust_volume(&self, guild_id: GuildId, delta: f32) -> Result<f32, UserInputError> {
        let (_, mut queue) = self.lock(guild_id).await;
        let target = queue.state.volume() + delta;
        self.apply_volume(&mut queue, target).await
    }

    async fn apply_volume(
        &self,
        queue: &mut GuildQueue<F::Player, C>,
        volume: f32,
    ) -> Result<f32, UserInputError> {
        let result = queue.state.set_volume(volume);
        if let Ok(volume) = result {
            if let Some(bundle) = &queue.live {
                bundle.resource.set_volume(volume);
            }
            queue.refresh_now_playing().await;
        }
        self.arm_if_idle(queue);
        result
    }

    pub async fn toggle_loop(&self, guild_id: GuildId) -> LoopMode {
        let (_, mut queue) = self.lock(guild_id).await;
        let mode = queue.state.toggle_loop();
        queue.refresh_now_playing().await;
        self.arm_if_idle(&mut queue);
        mode
    }

    pub async fn set_loop_mode(&self, guild_id: GuildId, mode: LoopMode) -> LoopMode {
        let (_, mut queue) = self.lock(guild_id).await;
        let mode = queue.state.set_loop_mode(mode);
        queue.refresh_now_playing().await;
        self.arm_if_idle(&mut queue);
        mode
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> bool {
        let Some((_, mut queue)) = self.existing_locked(guild_id).await else {
            return false;
        };
        queue.state.shuffle_with(&mut rand::thread_rng())
    }

    /// Vacía `pending`, la canción actual sigue.
    pub async fn clear(&self, guild_id: GuildId) -> usize {
        let Some((_, mut queue)) = self.existing_locked(guild_id).await else {
            return 0;
        };
        let (removed, effects) = queue.state.clear();
        self.apply_effects(&mut queue, effects).await;
        removed
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> QueueSnapshot {
        match self.existing_locked(guild_id).await {
            Some((_, queue)) => queue.state.snapshot(),
            None => QueueSnapshot::idle(self.inner.settings.default_volume),
        }
    }

    pub fn active_guilds(&self) -> usize {
        self.inner.queues.len()
    }

    fn queue_for(&self, guild_id: GuildId) -> Shared<F::Player, C> {
        self.inner
            .queues
            .entry(guild_id)
            .or_insert_with(|| self.spawn_queue(guild_id))
            .clone()
    }

    /// Crea la cola junto con la tarea que aplica los eventos de sus
    /// reproductores.
    fn spawn_queue(&self, guild_id: GuildId) -> Shared<F::Player, C> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(GuildQueue::new(guild_id, &self.inner.settings, tx)));
        tokio::spawn(guild_events(
            Arc::downgrade(&self.inner),
            Arc::downgrade(&shared),
            rx,
        ));
        shared
    }

    fn existing(&self, guild_id: GuildId) -> Option<Shared<F::Player, C>> {
        self.inner.queues.get(&guild_id).map(|entry| entry.value().clone())
    }

    /// Bloquea la cola de la guild, creándola si hace falta. Las colas
    /// desalojadas ya no están en el mapa, así que el reintento cae en una nueva.
    async fn lock(
        &self,
        guild_id: GuildId,
    ) -> (Shared<F::Player, C>, OwnedMutexGuard<GuildQueue<F::Player, C>>) {
        loop {
            let shared = self.queue_for(guild_id);
            let queue = shared.clone().lock_owned().await;
            if !queue.evicted {
                return (shared, queue);
            }
        }
    }

    async fn existing_locked(
        &self,
        guild_id: GuildId,
    ) -> Option<(Shared<F::Player, C>, OwnedMutexGuard<GuildQueue<F::Player, C>>)> {
        let shared = self.existing(guild_id)?;
        let queue = shared.clone().lock_owned().await;
        (!queue.evicted).then_some((shared, queue))
    }

    /// Aplica efectos y adquiere reproductores hasta que la guild se asienta.
    /// Los fallos vuelven a la máquina de estados: cada vuelta instala un
    /// reproductor o reduce el trabajo pendiente.
    async fn drive(
        &self,
        shared: Shared<F::Player, C>,
        mut queue: OwnedMutexGuard<GuildQueue<F::Player, C>>,
        mut effects: Vec<Effect>,
    ) {
        loop {
            let Some((url, generation)) = self.apply_effects(&mut queue, effects).await else {
                return;
            };

            drop(queue);
            let result = self.inner.factory.create_player(&url).await;
            queue = shared.clone().lock_owned().await;

            if queue.evicted || queue.state.generation() != generation {
                debug!("Reproductor para {} descartado, la cola cambió mientras cargaba", url);
                if let Ok(bundle) = result {
                    bundle.player.stop();
                }
                return;
            }

            effects = match result {
                Ok(bundle) => self.install(&shared, &mut queue, bundle, generation).await,
                Err(e) => queue.state.acquisition_failed(generation, &e.to_string()),
            };
        }
    }

    /// Devuelve la adquisición pendiente, si alguna transición la pidió.
    async fn apply_effects(
        &self,
        queue: &mut GuildQueue<F::Player, C>,
        effects: Vec<Effect>,
    ) -> Option<(String, u64)> {
        let mut acquire = None;

        for effect in effects {
            if queue.evicted {
                return None;
            }
            match effect {
                Effect::Acquire { url, generation } => acquire = Some((url, generation)),
                Effect::Notify(text) => queue.notify(text).await,
                Effect::PostNowPlaying => queue.post_now_playing().await,
                Effect::RefreshNowPlaying => queue.refresh_now_playing().await,
                Effect::ArmInactivity => self.arm_inactivity(queue),
                Effect::CancelInactivity => {
                    queue.inactivity.cancel();
                }
                Effect::ReleasePlayer => queue.release_player(),
            }
        }

        acquire
    }

    async fn install(
        &self,
        shared: &Shared<F::Player, C>,
        queue: &mut GuildQueue<F::Player, C>,
        bundle: PlayerBundle<F::Player>,
        generation: u64,
    ) -> Vec<Effect> {
        let connection = match queue.connection.clone() {
            Some(connection) if !connection.is_destroyed() => connection,
            Some(_) => {
                bundle.player.stop();
                self.transport_failure(shared, queue, TransportError::Destroyed).await;
                return Vec::new();
            }
            None => {
                bundle.player.stop();
                self.transport_failure(shared, queue, TransportError::Missing).await;
                return Vec::new();
            }
        };

        // El reproductor anterior queda obsoleto antes de suscribir el nuevo
        queue.release_player();
        bundle.player.listen(PlayerEvents::new(
            queue.guild_id,
            generation,
            queue.events.clone(),
        ));
        bundle.resource.set_volume(queue.state.volume());

        if let Err(e) = connection.subscribe(&bundle.player).await {
            bundle.player.stop();
            self.transport_failure(shared, queue, e).await;
            return Vec::new();
        }

        if let Err(e) = bundle.player.play(&bundle.resource).await {
            bundle.player.stop();
            return queue.state.acquisition_failed(generation, &e.to_string());
        }

        queue.live = Some(bundle);
        queue.state.installed(generation)
    }

    async fn transport_failure(
        &self,
        shared: &Shared<F::Player, C>,
        queue: &mut GuildQueue<F::Player, C>,
        error: TransportError,
    ) {
        error!("🔌 Fallo de transporte en guild {}: {}", queue.guild_id, error);
        queue
            .notify(format!("🔌 Se perdió la conexión de voz: {}", error))
            .await;
        self.evict(shared, queue).await;
    }

    async fn evict(&self, shared: &Shared<F::Player, C>, queue: &mut GuildQueue<F::Player, C>) {
        self.inner
            .queues
            .remove_if(&queue.guild_id, |_, entry| Arc::ptr_eq(entry, shared));
        queue.teardown().await;
    }

    fn arm_inactivity(&self, queue: &mut GuildQueue<F::Player, C>) {
        let epoch = queue.inactivity.next_epoch();
        let guild_id = queue.guild_id;
        let timeout = self.inner.settings.inactivity_timeout;
        let inner = Arc::downgrade(&self.inner);

        debug!("⏲️ Temporizador de inactividad armado para guild {} ({:?})", guild_id, timeout);
        queue.inactivity.arm(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                QueueManager { inner }.inactivity_elapsed(guild_id, epoch).await;
            }
        }));
    }

    /// Una cola inactiva sin temporizador lo arma; así ningún registro creado
    /// por un ajuste queda vivo para siempre.
    fn arm_if_idle(&self, queue: &mut GuildQueue<F::Player, C>) {
        if queue.state.is_idle() && !queue.inactivity.is_armed() {
            self.arm_inactivity(queue);
        }
    }

    /// Vuelve a comprobar la inactividad al vencer; el estado de cuando se
    /// armó puede haber cambiado.
    async fn inactivity_elapsed(&self, guild_id: GuildId, epoch: u64) {
        let Some((shared, mut queue)) = self.existing_locked(guild_id).await else {
            return;
        };
        if !queue.inactivity.claim(epoch) {
            return;
        }
        if !queue.state.is_idle() {
            debug!("Temporizador de inactividad vencido pero la guild {} está activa", guild_id);
            return;
        }

        let minutes = self.inner.settings.inactivity_timeout.as_secs() / 60;
        info!("💤 Saliendo de guild {} por inactividad", guild_id);
        queue
            .notify(format!(
                "💤 **Saliendo por inactividad** ({} minutos sin música)",
                minutes
            ))
            .await;
        self.evict(&shared, &mut queue).await;
    }

    /// Aplica un evento del reproductor. Los eventos de reproductores
    /// reemplazados los descarta la comprobación de generación.
    async fn dispatch(&self, shared: Shared<F::Player, C>, signal: PlayerSignal) {
        let mut queue = shared.clone().lock_owned().await;
        if queue.evicted {
            debug!("Evento para guild {} sin cola activa", signal.guild_id);
            return;
        }

        let effects = queue.state.player_event(signal.generation, signal.event);
        if !effects.is_empty() {
            self.drive(shared, queue, effects).await;
        }
    }

    #[cfg(test)]
    async fn inactivity_armed(&self, guild_id: GuildId) -> bool {
        match self.existing_locked(guild_id).await {
            Some((_, queue)) => queue.inactivity.is_armed(),
            None => false,
        }
    }
}

/// Eventos de una sola guild, en orden. Termina cuando la cola o el gestor
/// desaparecen.
async fn guild_events<F, C>(
    inner: Weak<Inner<F, C>>,
    queue: Weak<Mutex<GuildQueue<F::Player, C>>>,
    mut rx: mpsc::UnboundedReceiver<PlayerSignal>,
) where
    F: PlayerFactory,
    C: VoiceConnection<Player = F::Player>,
{
    while let Some(signal) = rx.recv().await {
        let (Some(inner), Some(shared)) = (inner.upgrade(), queue.upgrade()) else {
            break;
        };
        QueueManager { inner }.dispatch(shared, signal).await;
    }
    debug!("Tarea de eventos finalizada");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::backend::{MockNotificationSink, NowPlayingCard, PlayerEvent},
        error::{AcquisitionError, PlaybackError, SinkError},
    };
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    /// Estado compartido entre los dobles de prueba.
    #[derive(Default)]
    struct Stage {
        next_id: AtomicUsize,
        sounding: SyncMutex<HashSet<usize>>,
        peak: AtomicUsize,
        players: SyncMutex<Vec<FakePlayer>>,
        failing: SyncMutex<HashSet<String>>,
        play_failing: SyncMutex<HashSet<String>>,
        subscribed: SyncMutex<Vec<usize>>,
        subscribe_fails: AtomicBool,
        slow: AtomicBool,
        release: Notify,
    }

    #[derive(Clone)]
    struct FakePlayer {
        id: usize,
        url: String,
        stage: Arc<Stage>,
        events: Arc<SyncMutex<Option<PlayerEvents>>>,
        volume: Arc<SyncMutex<Option<f32>>>,
    }

    impl FakePlayer {
        fn emit(&self, event: PlayerEvent) {
            let events = self.events.lock().clone();
            if let Some(events) = events {
                events.emit(event);
            }
        }

        /// Fin natural de la canción.
        fn finish(&self) {
            if self.stage.sounding.lock().remove(&self.id) {
                self.emit(PlayerEvent::Idle);
            }
        }

        fn volume(&self) -> Option<f32> {
            *self.volume.lock()
        }
    }

    struct FakeResource {
        volume: Arc<SyncMutex<Option<f32>>>,
    }

    impl ResourceHandle for FakeResource {
        fn set_volume(&self, volume: f32) {
            *self.volume.lock() = Some(volume);
        }
    }

    #[async_trait]
    impl PlayerHandle for FakePlayer {
        type Resource = FakeResource;

        fn listen(&self, events: PlayerEvents) {
            *self.events.lock() = Some(events);
        }

        async fn play(&self, _resource: &FakeResource) -> Result<(), PlaybackError> {
            if self.stage.play_failing.lock().contains(&self.url) {
                return Err(PlaybackError("decoder died".into()));
            }
            {
                let mut sounding = self.stage.sounding.lock();
                sounding.insert(self.id);
                self.stage.peak.fetch_max(sounding.len(), Ordering::SeqCst);
            }
            self.emit(PlayerEvent::Playing);
            Ok(())
        }

        fn pause(&self) -> bool {
            self.emit(PlayerEvent::Paused);
            true
        }

        fn unpause(&self) -> bool {
            self.emit(PlayerEvent::Playing);
            true
        }

        fn stop(&self) {
            self.finish();
        }
    }

    struct FakeFactory {
        stage: Arc<Stage>,
    }

    #[async_trait]
    impl PlayerFactory for FakeFactory {
        type Player = FakePlayer;

        async fn create_player(&self, url: &str) -> Result<PlayerBundle<FakePlayer>, AcquisitionError> {
            if self.stage.slow.load(Ordering::SeqCst) {
                self.stage.release.notified().await;
            }
            if self.stage.failing.lock().contains(url) {
                return Err(AcquisitionError::Decode("ffmpeg exited with status 1".into()));
            }

            let volume = Arc::new(SyncMutex::new(None));
            let player = FakePlayer {
                id: self.stage.next_id.fetch_add(1, Ordering::SeqCst),
                url: url.to_string(),
                stage: self.stage.clone(),
                events: Arc::new(SyncMutex::new(None)),
                volume: volume.clone(),
            };
            self.stage.players.lock().push(player.clone());
            Ok(PlayerBundle {
                player,
                resource: FakeResource { volume },
            })
        }
    }

    struct FakeConnection {
        stage: Arc<Stage>,
        destroyed: AtomicBool,
        destroy_calls: AtomicUsize,
    }

    #[async_trait]
    impl VoiceConnection for FakeConnection {
        type Player = FakePlayer;

        async fn subscribe(&self, player: &FakePlayer) -> Result<(), TransportError> {
            if self.is_destroyed() {
                return Err(TransportError::Destroyed);
            }
            if self.stage.subscribe_fails.load(Ordering::SeqCst) {
                return Err(TransportError::Failed("udp socket closed".into()));
            }
            self.stage.subscribed.lock().push(player.id);
            Ok(())
        }

        async fn destroy(&self) {
            self.destroyed.store(true, Ordering::SeqCst);
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn is_destroyed(&self) -> bool {
            self.destroyed.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum SinkCall {
        Post(MessageRef, Outgoing),
        Edit(MessageRef, Outgoing),
        Delete(MessageRef),
    }

    #[derive(Default)]
    struct RecordingSink {
        next: AtomicU64,
        calls: SyncMutex<Vec<SinkCall>>,
    }

    impl RecordingSink {
        fn notices(&self) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .filter_map(|call| match call {
                    SinkCall::Post(_, Outgoing::Notice(text)) => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn cards(&self) -> Vec<NowPlayingCard> {
            self.calls
                .lock()
                .iter()
                .filter_map(|call| match call {
                    SinkCall::Post(_, Outgoing::NowPlaying(card)) => Some(card.clone()),
                    _ => None,
                })
                .collect()
        }

        fn edits(&self) -> Vec<NowPlayingCard> {
            self.calls
                .lock()
                .iter()
                .filter_map(|call| match call {
                    SinkCall::Edit(_, Outgoing::NowPlaying(card)) => Some(card.clone()),
                    _ => None,
                })
                .collect()
        }

        fn deletes(&self) -> Vec<MessageRef> {
            self.calls
                .lock()
                .iter()
                .filter_map(|call| match call {
                    SinkCall::Delete(message) => Some(*message),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn post(&self, content: Outgoing) -> Result<MessageRef, SinkError> {
            let message = MessageRef(self.next.fetch_add(1, Ordering::SeqCst));
            self.calls.lock().push(SinkCall::Post(message, content));
            Ok(message)
        }

        async fn edit(&self, message: MessageRef, content: Outgoing) -> Result<(), SinkError> {
            self.calls.lock().push(SinkCall::Edit(message, content));
            Ok(())
        }

        async fn delete(&self, message: MessageRef) -> Result<(), SinkError> {
            self.calls.lock().push(SinkCall::Delete(message));
            Ok(())
        }
    }

    /// Sink cuyas ediciones nunca terminan, como una llamada HTTP colgada.
    #[derive(Default)]
    struct StuckSink {
        inner: RecordingSink,
    }

    #[async_trait]
    impl NotificationSink for StuckSink {
        async fn post(&self, content: Outgoing) -> Result<MessageRef, SinkError> {
            self.inner.post(content).await
        }

        async fn edit(&self, _message: MessageRef, _content: Outgoing) -> Result<(), SinkError> {
            std::future::pending().await
        }

        async fn delete(&self, message: MessageRef) -> Result<(), SinkError> {
            self.inner.delete(message).await
        }
    }

    struct Harness {
        manager: QueueManager<FakeFactory, FakeConnection>,
        stage: Arc<Stage>,
        connection: Arc<FakeConnection>,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new() -> Self {
            let stage = Arc::new(Stage::default());
            let factory = Arc::new(FakeFactory {
                stage: stage.clone(),
            });
            Self {
                manager: QueueManager::new(factory, QueueSettings::default()),
                connection: Arc::new(FakeConnection {
                    stage: stage.clone(),
                    destroyed: AtomicBool::new(false),
                    destroy_calls: AtomicUsize::new(0),
                }),
                sink: Arc::new(RecordingSink::default()),
                stage,
            }
        }

        async fn play(&self, title: &str) -> PlayOutcome {
            self.manager
                .start_or_enqueue(guild(), track(title), self.connection.clone(), self.sink.clone())
                .await
        }

        fn current_player(&self) -> FakePlayer {
            self.stage
                .players
                .lock()
                .last()
                .cloned()
                .expect("ningún reproductor creado")
        }

        async fn titles(&self) -> (Option<String>, Vec<String>) {
            let snapshot = self.manager.snapshot(guild()).await;
            (
                snapshot.current.map(|t| t.title),
                snapshot.pending.into_iter().map(|t| t.title).collect(),
            )
        }

        fn fail(&self, title: &str) {
            self.stage.failing.lock().insert(url(title));
        }
    }

    fn guild() -> GuildId {
        GuildId::new(42)
    }

    fn url(title: &str) -> String {
        format!("https://www.youtube.com/watch?v={}", title)
    }

    fn track(title: &str) -> Track {
        Track::new(title, url(title), "<@7>")
    }

    fn owned(titles: &[&str]) -> Vec<String> {
        titles.iter().map(|t| t.to_string()).collect()
    }

    /// Deja que las tareas de eventos y las lanzadas terminen.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_session_scenario() {
        let h = Harness::new();

        assert_eq!(h.play("A").await, PlayOutcome::Started);
        assert_eq!(h.play("B").await, PlayOutcome::Queued(1));
        assert_eq!(h.play("C").await, PlayOutcome::Queued(2));
        settle().await;
        assert_eq!(h.titles().await, (Some("A".into()), owned(&["B", "C"])));
        assert!(h.manager.snapshot(guild()).await.is_playing);

        h.current_player().finish();
        settle().await;
        assert_eq!(h.titles().await, (Some("B".into()), owned(&["C"])));

        assert!(h.manager.skip(guild()).await);
        settle().await;
        assert_eq!(h.titles().await, (Some("C".into()), owned(&[])));

        h.current_player().finish();
        settle().await;
        let snapshot = h.manager.snapshot(guild()).await;
        assert_eq!(snapshot.current, None);
        assert!(!snapshot.is_playing);
        assert!(h.manager.inactivity_armed(guild()).await);
        assert!(h.sink.notices().iter().any(|n| n.contains("Cola terminada")));
        assert!(h.stage.peak.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playlist_starts_head_and_queues_rest() {
        let h = Harness::new();
        let tracks = vec![track("P1"), track("P2"), track("P3")];

        let outcome = h
            .manager
            .start_or_enqueue_many(guild(), tracks, h.connection.clone(), h.sink.clone())
            .await;

        assert_eq!(outcome, PlayOutcome::Started);
        assert_eq!(h.titles().await, (Some("P1".into()), owned(&["P2", "P3"])));
        assert_eq!(h.current_player().url, url("P1"));

        let second = vec![track("Q1"), track("Q2")];
        let outcome = h
            .manager
            .start_or_enqueue_many(guild(), second, h.connection.clone(), h.sink.clone())
            .await;

        assert_eq!(outcome, PlayOutcome::Queued(3));
        assert_eq!(
            h.titles().await,
            (Some("P1".into()), owned(&["P2", "P3", "Q1", "Q2"]))
        );
        assert_eq!(h.stage.players.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_reports_position() {
        let h = Harness::new();
        h.play("T").await;
        let before = h.manager.snapshot(guild()).await.pending.len();

        let position = h.manager.enqueue(guild(), track("X")).await;

        assert_eq!(position, before + 1);
        assert_eq!(h.titles().await.1.last().map(String::as_str), Some("X"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_two_players_sounding() {
        let h = Harness::new();
        h.fail("broken");
        h.play("A").await;
        for name in ["B", "broken", "C", "D"] {
            h.play(name).await;
        }
        h.manager.set_loop_mode(guild(), LoopMode::Queue).await;

        for _ in 0..6 {
            assert!(h.manager.skip(guild()).await);
            settle().await;
        }
        h.manager.set_loop_mode(guild(), LoopMode::Song).await;
        h.manager.skip(guild()).await;
        settle().await;
        h.manager.stop(guild()).await;
        settle().await;

        assert_eq!(h.stage.peak.load(Ordering::SeqCst), 1);
        assert!(h.stage.sounding.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_song_replays_with_fresh_player() {
        let h = Harness::new();
        h.play("T").await;
        h.play("A").await;
        assert_eq!(h.manager.toggle_loop(guild()).await, LoopMode::Song);
        let first = h.current_player();

        first.finish();
        settle().await;

        let second = h.current_player();
        assert_ne!(first.id, second.id);
        assert_eq!(second.url, url("T"));
        assert_eq!(h.titles().await, (Some("T".into()), owned(&["A"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_does_not_bypass_song_loop() {
        let h = Harness::new();
        h.play("T").await;
        h.play("A").await;
        h.manager.set_loop_mode(guild(), LoopMode::Song).await;

        assert!(h.manager.skip(guild()).await);
        settle().await;

        assert_eq!(h.titles().await.0, Some("T".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_queue_rotates_finished_track() {
        let h = Harness::new();
        h.play("T").await;
        h.play("A").await;
        h.play("B").await;
        h.manager.set_loop_mode(guild(), LoopMode::Queue).await;

        h.current_player().finish();
        settle().await;

        assert_eq!(h.titles().await, (Some("A".into()), owned(&["B", "T"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_tears_down_idle_guild() {
        let h = Harness::new();
        h.play("T").await;
        h.current_player().finish();
        settle().await;
        assert_eq!(h.manager.active_guilds(), 1);

        tokio::time::sleep(Duration::from_secs(181)).await;

        assert_eq!(h.manager.active_guilds(), 0);
        assert!(h.connection.is_destroyed());
        assert!(h.sink.notices().iter().any(|n| n.contains("inactividad")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_track_cancels_inactivity() {
        let h = Harness::new();
        h.play("T").await;
        h.current_player().finish();
        settle().await;

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(h.play("U").await, PlayOutcome::Started);
        assert!(!h.manager.inactivity_armed(guild()).await);
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert!(!h.connection.is_destroyed());
        assert_eq!(h.titles().await.0, Some("U".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_on_idle_guild_arms_inactivity() {
        let h = Harness::new();
        h.manager.enqueue(guild(), track("A")).await;
        h.manager.enqueue(guild(), track("B")).await;

        assert_eq!(h.manager.clear(guild()).await, 2);
        assert!(h.manager.inactivity_armed(guild()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let h = Harness::new();
        h.manager.stop(guild()).await;

        h.play("T").await;
        h.play("A").await;
        settle().await;
        h.manager.stop(guild()).await;
        h.manager.stop(guild()).await;
        settle().await;

        assert_eq!(h.manager.active_guilds(), 0);
        assert_eq!(h.titles().await, (None, owned(&[])));
        assert_eq!(h.connection.destroy_calls.load(Ordering::SeqCst), 1);
        assert!(h.stage.sounding.lock().is_empty());
        // El mensaje de reproducción se elimina
        assert_eq!(h.sink.deletes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_when_idle_is_noop() {
        let h = Harness::new();
        assert!(!h.manager.skip(guild()).await);

        h.manager.enqueue(guild(), track("A")).await;
        assert!(!h.manager.skip(guild()).await);
        assert_eq!(h.titles().await, (None, owned(&["A"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_is_clamped_and_applied_live() {
        let h = Harness::new();
        h.play("T").await;
        assert_eq!(h.current_player().volume(), Some(0.8));

        assert_eq!(h.manager.set_volume(guild(), 5.0).await, Ok(2.0));
        assert_eq!(h.current_player().volume(), Some(2.0));
        assert_eq!(h.manager.adjust_volume(guild(), -VOLUME_STEP).await, Ok(1.9));
        assert_eq!(h.manager.snapshot(guild()).await.volume, 1.9);
        assert!(!h.sink.edits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_tracks_are_skipped() {
        let h = Harness::new();
        h.fail("bad1");
        h.fail("bad2");
        h.manager.enqueue(guild(), track("bad1")).await;
        h.manager.enqueue(guild(), track("bad2")).await;
        h.manager.enqueue(guild(), track("good")).await;

        assert_eq!(h.play("tail").await, PlayOutcome::Started);

        assert_eq!(h.titles().await, (Some("good".into()), owned(&["tail"])));
        let notices = h.sink.notices();
        assert!(notices.iter().any(|n| n.contains("bad1")));
        assert!(notices.iter().any(|n| n.contains("bad2")));
        assert_eq!(h.current_player().url, url("good"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_track_failing_empties_queue() {
        let h = Harness::new();
        h.fail("bad1");
        h.fail("bad2");
        h.manager.set_loop_mode(guild(), LoopMode::Queue).await;
        h.manager.enqueue(guild(), track("bad1")).await;

        h.play("bad2").await;

        assert_eq!(h.titles().await, (None, owned(&[])));
        assert!(h.manager.inactivity_armed(guild()).await);
        assert!(h.stage.players.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggling_event_from_replaced_player_is_ignored() {
        let h = Harness::new();
        h.play("A").await;
        h.play("B").await;
        h.play("C").await;
        let replaced = h.current_player();
        replaced.finish();
        settle().await;
        assert_eq!(h.titles().await.0, Some("B".into()));

        // Un Idle tardío del reproductor de A no debe avanzar la cola
        replaced.emit(PlayerEvent::Idle);
        replaced.emit(PlayerEvent::Error("late".into()));
        settle().await;

        assert_eq!(h.titles().await, (Some("B".into()), owned(&["C"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_loading_discards_player() {
        let h = Harness::new();
        h.stage.slow.store(true, Ordering::SeqCst);

        let manager = h.manager.clone();
        let connection = h.connection.clone();
        let sink: Arc<dyn NotificationSink> = h.sink.clone();
        let loading = tokio::spawn(async move {
            manager
                .start_or_enqueue(guild(), track("A"), connection, sink)
                .await
        });
        settle().await;

        let snapshot = h.manager.snapshot(guild()).await;
        assert_eq!(snapshot.current.map(|t| t.title), Some("A".into()));
        assert!(!snapshot.is_playing);
        assert_eq!(h.play("B").await, PlayOutcome::Queued(1));

        h.manager.stop(guild()).await;
        h.stage.release.notify_one();
        assert_eq!(loading.await.ok(), Some(PlayOutcome::Started));
        settle().await;

        assert!(h.stage.subscribed.lock().is_empty());
        assert_eq!(h.stage.peak.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.active_guilds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroyed_connection_forces_stop() {
        let h = Harness::new();
        h.connection.destroyed.store(true, Ordering::SeqCst);

        h.play("A").await;

        assert_eq!(h.manager.active_guilds(), 0);
        assert!(h.sink.notices().iter().any(|n| n.contains("conexión de voz")));
        assert!(h.stage.sounding.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_tears_down_session() {
        let h = Harness::new();
        h.play("A").await;
        h.play("B").await;
        assert!(!h.connection.is_destroyed());

        // La conexión sigue viva pero el transporte rechaza el siguiente reproductor
        h.stage.subscribe_fails.store(true, Ordering::SeqCst);
        h.current_player().finish();
        settle().await;

        assert_eq!(h.manager.active_guilds(), 0);
        assert_eq!(h.connection.destroy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.titles().await, (None, owned(&[])));
        assert!(h.sink.notices().iter().any(|n| n.contains("conexión de voz")));
        assert!(h.stage.sounding.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_failure_moves_to_next_track() {
        let h = Harness::new();
        h.stage.play_failing.lock().insert(url("broken"));
        h.manager.enqueue(guild(), track("broken")).await;

        assert_eq!(h.play("B").await, PlayOutcome::Started);

        assert_eq!(h.titles().await, (Some("B".into()), owned(&[])));
        let notices = h.sink.notices();
        assert!(notices.iter().any(|n| n.contains("broken") && n.contains("decoder died")));
        assert_eq!(h.current_player().url, url("B"));
        assert_eq!(h.stage.sounding.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_guild_does_not_hold_back_others() {
        let h = Harness::new();
        let stuck = GuildId::new(7);
        let stuck_sink = Arc::new(StuckSink::default());
        let stuck_connection = Arc::new(FakeConnection {
            stage: h.stage.clone(),
            destroyed: AtomicBool::new(false),
            destroy_calls: AtomicUsize::new(0),
        });
        h.manager
            .start_or_enqueue(stuck, track("A1"), stuck_connection, stuck_sink)
            .await;
        h.play("B1").await;
        h.play("B2").await;
        let b1 = h.current_player();
        assert_eq!(b1.url, url("B1"));

        // La edición del mensaje de la guild atascada no termina nunca
        let manager = h.manager.clone();
        let pausing = tokio::spawn(async move { manager.pause(stuck).await });
        settle().await;

        b1.finish();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(h.titles().await, (Some("B2".into()), owned(&[])));
        assert!(!pausing.is_finished());
        pausing.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_on_fresh_guild_do_not_leak_it() {
        let h = Harness::new();

        assert_eq!(h.manager.set_volume(guild(), 0.5).await, Ok(0.5));
        h.manager.toggle_loop(guild()).await;
        assert_eq!(h.manager.active_guilds(), 1);
        assert!(h.manager.inactivity_armed(guild()).await);

        tokio::time::sleep(Duration::from_secs(181)).await;

        assert_eq!(h.manager.active_guilds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_now_playing_posted_per_track_and_edited_in_place() {
        let h = Harness::new();
        h.play("A").await;
        h.play("B").await;
        assert_eq!(h.sink.cards().len(), 1);

        assert!(h.manager.pause(guild()).await);
        assert!(!h.manager.pause(guild()).await);
        assert_eq!(h.manager.toggle_pause(guild()).await, Some(true));
        h.manager.toggle_loop(guild()).await;

        let edits = h.sink.edits();
        assert_eq!(edits.len(), 3);
        assert!(!edits[0].is_playing);
        assert!(edits[1].is_playing);
        assert_eq!(edits[2].loop_mode, LoopMode::Song);
        assert_eq!(h.sink.cards().len(), 1);

        h.manager.set_loop_mode(guild(), LoopMode::Off).await;
        h.manager.skip(guild()).await;
        settle().await;

        let cards = h.sink.cards();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[1].track.title, "B");
        // El mensaje anterior se borra antes de publicar el nuevo
        assert_eq!(h.sink.deletes(), vec![MessageRef(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shuffle_keeps_current_and_tracks() {
        let h = Harness::new();
        h.play("T").await;
        assert!(!h.manager.shuffle(guild()).await);
        for name in ["A", "B", "C", "D"] {
            h.play(name).await;
        }

        assert!(h.manager.shuffle(guild()).await);

        let (current, mut pending) = h.titles().await;
        pending.sort();
        assert_eq!(current, Some("T".into()));
        assert_eq!(pending, owned(&["A", "B", "C", "D"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ui_edit_failures_are_swallowed() {
        let stage = Arc::new(Stage::default());
        let manager = QueueManager::new(
            Arc::new(FakeFactory {
                stage: stage.clone(),
            }),
            QueueSettings::default(),
        );
        let connection = Arc::new(FakeConnection {
            stage,
            destroyed: AtomicBool::new(false),
            destroy_calls: AtomicUsize::new(0),
        });

        let mut sink = MockNotificationSink::new();
        sink.expect_post().returning(|_| Ok(MessageRef(9)));
        sink.expect_edit()
            .times(1)
            .returning(|_, _| Err(SinkError("Unknown Message".into())));
        sink.expect_delete().returning(|_| Ok(()));

        manager
            .start_or_enqueue(guild(), track("A"), connection, Arc::new(sink))
            .await;

        assert!(manager.pause(guild()).await);
        // El mensaje desapareció: no se vuelve a editar
        assert!(manager.resume(guild()).await);
        assert!(manager.snapshot(guild()).await.is_playing);
    }
}
