use anyhow::Result;
use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

use open_music_link::{
    config::Config, gateway::VoiceGateway, storage::JsonStore, Event, Manager,
};

type Payload = serde_json::Value;

/// Gateway sin conexión a Discord: solo registra las peticiones de voz.
///
/// Una integración real reenvía estas peticiones como opcode 4 por el shard
/// del guild.
struct DetachedGateway;

#[async_trait]
impl VoiceGateway for DetachedGateway {
    async fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        info!(
            "🎙️ Voice state {} -> {:?} (mute={}, deaf={})",
            guild_id, channel_id, self_mute, self_deaf
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_link=debug".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Link v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    if config.application_id == 0 {
        anyhow::bail!("APPLICATION_ID debe ser distinto de 0");
    }
    info!("{}", config.summary());

    // Inicializar almacenamiento JSON
    let store = Arc::new(JsonStore::new(config.data_dir.clone()).await?);
    info!("{}", store.stats().await?);

    let manager: Manager<Payload> = Manager::new(
        config.nodes.clone(),
        config.options.clone(),
        store,
        Arc::new(DetachedGateway),
    );
    let events = manager.subscribe();
    let user_id = UserId::new(config.application_id);

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&manager, events, user_id).await;
    }

    manager.init(user_id).await?;
    let logger = tokio::spawn(log_events(events));

    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");
    manager.shutdown();
    logger.abort();

    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<Event<Payload>>) {
    loop {
        match events.recv().await {
            Ok(Event::NodeReady {
                node,
                restored_players,
            }) => info!("✅ {} listo, {} players restaurados", node, restored_players),
            Ok(Event::NodeError { node, message }) => error!("❌ {}: {}", node, message),
            Ok(Event::TrackStart { guild_id, track }) => {
                info!("🎶 {} en {}", track.title(), guild_id)
            }
            Ok(event) => info!("📨 {:?}", event),
            Err(RecvError::Lagged(skipped)) => warn!("⚠️ {} eventos perdidos", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

/// OK si algún nodo queda listo en 10 segundos
async fn health_check(
    manager: &Manager<Payload>,
    mut events: broadcast::Receiver<Event<Payload>>,
    user_id: UserId,
) -> Result<()> {
    manager.init(user_id).await?;

    let ready = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(Event::NodeReady { .. } | Event::NodeResumed { .. }) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    manager.shutdown();

    if ready {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Ningún nodo Lavalink disponible");
    }
}
