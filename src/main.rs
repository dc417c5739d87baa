use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::SerenityInit;
use std::sync::Arc;
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod error;
mod sources;
mod ui;

use crate::audio::{QueueManager, SongbirdFactory};
use crate::bot::JukeboxBot;
use crate::config::Config;
use crate::sources::SourceResolver;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Guild Jukebox v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("⚙️ {}", config.summary());

    if std::env::args().any(|arg| arg == "--health-check") {
        sources::verify_dependencies().await?;
        println!("OK");
        return Ok(());
    }

    // Un solo cliente HTTP para yt-dlp, compartido por resolución y reproducción
    let http = reqwest::Client::new();
    let factory = SongbirdFactory::new(http.clone(), config.acquisition_timeout());
    let queues = QueueManager::new(Arc::new(factory), config.queue_settings());
    let resolver = SourceResolver::new(http, config.acquisition_timeout());

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let token = config.discord_token.clone();
    let handler = JukeboxBot::new(Arc::new(config), queues, resolver);

    let mut client = Client::builder(&token, intents)
        .event_handler(handler)
        .register_songbird()
        .await?;

    // Manejar shutdown graceful
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Error al registrar Ctrl+C");
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        std::process::exit(0);
    });

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}
