//! # Bot Module
//!
//! Discord side of the jukebox: slash command registration, interaction
//! dispatch and voice state tracking. Playback itself lives in
//! [`crate::audio`]; this module only translates Discord events into
//! [`Jukebox`] operations.

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;
pub mod sink;

use crate::{
    audio::{Jukebox, SelfDisconnects, SongbirdConnection},
    config::Config,
    sources::SourceResolver,
};

/// Event handler shared by every shard.
///
/// Holds the per-guild queue registry and the query resolver; both are
/// cheap to share behind `&self` since all their state is internally
/// synchronized.
pub struct JukeboxBot {
    config: Arc<Config>,
    queues: Jukebox,
    resolver: SourceResolver,
    disconnects: Arc<SelfDisconnects>,
}

impl JukeboxBot {
    pub fn new(config: Arc<Config>, queues: Jukebox, resolver: SourceResolver) -> Self {
        Self {
            config,
            queues,
            resolver,
            disconnects: Arc::new(SelfDisconnects::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queues(&self) -> &Jukebox {
        &self.queues
    }

    pub fn resolver(&self) -> &SourceResolver {
        &self.resolver
    }

    /// Registra los comandos slash, globales o por guild según configuración.
    ///
    /// Guild commands propagate in about a second, global ones can take up
    /// to an hour.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");
        info!("🔧 Application ID: {}", self.config.application_id);

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id)
                    .await
                    .map_err(|e| {
                        error!("❌ Error registrando comandos de guild: {:?}", e);
                        anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica el permiso 'applications.commands'.")
                    })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica el permiso 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }

    /// Joins (or moves to) the caller's voice channel.
    ///
    /// If the guild already has a live session the queue keeps its own
    /// connection and this one is simply dropped.
    pub async fn join_voice_channel(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<SongbirdConnection>> {
        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird no inicializado"))?;

        let connection =
            SongbirdConnection::join(manager, self.disconnects.clone(), guild_id, channel_id)
                .await
                .map_err(|e| {
                    error!("Error al conectar al canal de voz: {:?}", e);
                    anyhow::anyhow!("No pude conectarme al canal de voz")
                })?;

        Ok(Arc::new(connection))
    }

    /// Sale del canal aunque no haya cola activa.
    pub async fn leave_voice_channel(&self, ctx: &Context, guild_id: GuildId) -> Result<()> {
        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird no inicializado"))?;

        if manager.get(guild_id).is_some() {
            self.disconnects.expect(guild_id);
            if let Err(e) = manager.remove(guild_id).await {
                self.disconnects.forget(guild_id);
                return Err(e.into());
            }
            info!("👋 Desconectado del canal de voz en guild {}", guild_id);
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Command(command_interaction) => {
                if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                    error!("Error manejando comando: {:?}", e);
                }
            }
            Interaction::Component(component_interaction) => {
                if let Err(e) = handlers::handle_component(&ctx, component_interaction, self).await
                {
                    error!("Error manejando componente: {:?}", e);
                }
            }
            _ => {}
        }
    }

    /// Si alguien desconecta al bot a mano, la sesión de esa guild termina.
    /// Las salidas que pidió el propio bot ya cerraron su sesión.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        if let Some(guild_id) = new.guild_id {
            if self.disconnects.take_expected(guild_id) {
                debug!("Salida propia confirmada en guild {}", guild_id);
                return;
            }
            info!("🔌 Bot desconectado en guild {}", guild_id);
            self.queues.stop(guild_id).await;
            info!("📊 Guilds con cola activa: {}", self.queues.active_guilds());
        }
    }
}
