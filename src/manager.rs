use rand::seq::SliceRandom;
use serenity::model::id::{GuildId, UserId};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    audio::{
        player::{Player, PlayerOptions},
        track::{Track, UserData},
    },
    config::{ManagerOptions, NodeConfig},
    error::Error,
    events::Event,
    gateway::{GatewayEvent, VoiceGateway},
    node::{protocol::LoadResult, Context, Node},
    retry::{retry, RetryPolicy},
    storage::StateStore,
    Result,
};

/// Capacidad del canal de eventos; los suscriptores lentos pierden los más viejos
const EVENT_CAPACITY: usize = 1024;

/// Resultado de una búsqueda, con cada track marcado con los datos del llamador
#[derive(Debug, Clone, PartialEq)]
pub enum SearchResult<U> {
    Track(Track<U>),
    Playlist {
        name: String,
        selected: Option<usize>,
        tracks: Vec<Track<U>>,
    },
    Search(Vec<Track<U>>),
    Empty,
}

impl<U> SearchResult<U> {
    pub fn tracks(&self) -> &[Track<U>] {
        match self {
            Self::Track(track) => std::slice::from_ref(track),
            Self::Playlist { tracks, .. } | Self::Search(tracks) => tracks,
            Self::Empty => &[],
        }
    }

    pub fn into_tracks(self) -> Vec<Track<U>> {
        match self {
            Self::Track(track) => vec![track],
            Self::Playlist { tracks, .. } | Self::Search(tracks) => tracks,
            Self::Empty => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks().is_empty()
    }
}

/// Punto de entrada: dueño de los nodos configurados.
///
/// Enruta los eventos de voz del gateway a los players y reparte los eventos
/// de ciclo de vida por un único canal broadcast.
pub struct Manager<U: UserData> {
    node_configs: Vec<NodeConfig>,
    options: ManagerOptions,
    store: Arc<dyn StateStore>,
    gateway: Arc<dyn VoiceGateway>,
    events: broadcast::Sender<Event<U>>,
    user_id: OnceLock<UserId>,
    nodes: OnceLock<Vec<Arc<Node<U>>>>,
}

impl<U: UserData> Manager<U> {
    pub fn new(
        nodes: Vec<NodeConfig>,
        options: ManagerOptions,
        store: Arc<dyn StateStore>,
        gateway: Arc<dyn VoiceGateway>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            node_configs: nodes,
            options,
            store,
            gateway,
            events,
            user_id: OnceLock::new(),
            nodes: OnceLock::new(),
        }
    }

    /// Construye el contexto de ejecución y conecta todos los nodos en orden.
    ///
    /// Un nodo que falla no impide conectar los demás; su reconexión queda
    /// programada.
    pub async fn init(&self, user_id: UserId) -> Result<()> {
        if self.nodes.get().is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let ctx = Arc::new(Context {
            user_id,
            store: Arc::clone(&self.store),
            gateway: Arc::clone(&self.gateway),
            events: self.events.clone(),
            options: self.options.clone(),
        });

        let nodes: Vec<_> = self
            .node_configs
            .iter()
            .filter_map(|config| match Node::new(config.clone(), Arc::clone(&ctx)) {
                Ok(node) => Some(node),
                Err(e) => {
                    error!("❌ Nodo {} descartado: {}", config.name, e);
                    None
                }
            })
            .collect();

        self.nodes
            .set(nodes.clone())
            .map_err(|_| Error::AlreadyInitialized)?;
        let _ = self.user_id.set(user_id);

        info!("🎼 Inicializando {} nodos Lavalink", nodes.len());
        for node in &nodes {
            if let Err(e) = node.connect().await {
                warn!("⚠️ Nodo {} no disponible todavía: {}", node.name(), e);
            }
        }

        Ok(())
    }

    /// Recibe todos los eventos emitidos a partir de ahora
    pub fn subscribe(&self) -> broadcast::Receiver<Event<U>> {
        self.events.subscribe()
    }

    pub fn nodes(&self) -> &[Arc<Node<U>>] {
        self.nodes.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn players(&self) -> Vec<Arc<Player<U>>> {
        self.nodes().iter().flat_map(|node| node.players()).collect()
    }

    /// Un nodo listo elegido al azar
    pub fn available_node(&self) -> Result<Arc<Node<U>>> {
        let ready: Vec<_> = self.nodes().iter().filter(|node| node.is_ready()).collect();
        ready
            .choose(&mut rand::thread_rng())
            .map(|node| Arc::clone(node))
            .ok_or(Error::NoNodesAvailable)
    }

    /// Resuelve una búsqueda o URL en un nodo listo.
    ///
    /// Las URLs absolutas se resuelven tal cual; el resto se prefija con la
    /// fuente (`ytsearch` por defecto).
    pub async fn search(
        &self,
        query: &str,
        user_data: U,
        source: Option<&str>,
    ) -> Result<SearchResult<U>> {
        let node = self.available_node()?;

        let is_url = Url::parse(query).is_ok_and(|url| matches!(url.scheme(), "http" | "https"));
        let identifier = if is_url {
            query.to_string()
        } else {
            format!(
                "{}:{}",
                source.unwrap_or(&self.options.default_search_source),
                query
            )
        };
        debug!("🔍 Buscando {} en {}", identifier, node.name());

        let stamp = |data| Track::new(data, user_data.clone());
        let result = match node.load_tracks(&identifier).await? {
            LoadResult::Track(data) => SearchResult::Track(stamp(data)),
            LoadResult::Playlist(playlist) => SearchResult::Playlist {
                selected: usize::try_from(playlist.info.selected_track).ok(),
                name: playlist.info.name,
                tracks: playlist.tracks.into_iter().map(stamp).collect(),
            },
            LoadResult::Search(tracks) => SearchResult::Search(tracks.into_iter().map(stamp).collect()),
            LoadResult::Empty => {
                info!("No se encontraron resultados para: {}", query);
                SearchResult::Empty
            }
            LoadResult::Error(exception) => return Err(Error::LoadFailed(exception)),
        };
        Ok(result)
    }

    /// `search` con reintentos: hasta 5 intentos separados por 1s
    pub async fn search_with_retry(
        &self,
        query: &str,
        user_data: U,
        source: Option<&str>,
    ) -> Result<SearchResult<U>> {
        retry(&RetryPolicy::search(), |_| {
            self.search(query, user_data.clone(), source)
        })
        .await
    }

    /// Devuelve el player del guild en cualquier nodo, o lo crea en uno listo
    pub async fn create_player(&self, options: PlayerOptions) -> Result<Arc<Player<U>>> {
        if let Some(existing) = self.find_player_by_guild_id(options.guild_id) {
            return Ok(existing);
        }
        self.available_node()?.create_player(options).await
    }

    pub fn find_player_by_guild_id(&self, guild_id: GuildId) -> Option<Arc<Player<U>>> {
        self.nodes().iter().find_map(|node| node.player(guild_id))
    }

    /// Procesa un evento del gateway de Discord relevante para los players
    pub async fn handle_raw_data(&self, event: GatewayEvent) {
        let Some(player) = self.find_player_by_guild_id(event.guild_id()) else {
            return;
        };

        match event {
            GatewayEvent::ChannelDelete { channel_id, .. } => {
                if player.voice_channel_id() == Some(channel_id) {
                    info!("🗑️ Canal {} eliminado, destruyendo player", channel_id);
                    if let Err(e) = player.destroy().await {
                        warn!("No se pudo destruir el player {}: {}", player.guild_id(), e);
                    }
                }
            }
            GatewayEvent::VoiceServerUpdate {
                token, endpoint, ..
            } => player.handle_voice_server(token, endpoint).await,
            GatewayEvent::VoiceStateUpdate {
                user_id,
                channel_id,
                session_id,
                ..
            } => {
                // Solo interesa el estado de voz del propio bot
                if self.user_id.get() != Some(&user_id) {
                    return;
                }
                player.handle_voice_state(channel_id, session_id).await;
            }
        }
    }

    /// Cierra todos los nodos; los snapshots quedan para la próxima sesión
    pub fn shutdown(&self) {
        for node in self.nodes() {
            node.disconnect();
        }
        info!("👋 Manager detenido");
    }

    #[cfg(test)]
    pub(crate) fn from_nodes(ctx: &Context<U>, nodes: Vec<Arc<Node<U>>>) -> Self {
        let manager = Self {
            node_configs: Vec::new(),
            options: ctx.options.clone(),
            store: Arc::clone(&ctx.store),
            gateway: Arc::clone(&ctx.gateway),
            events: ctx.events.clone(),
            user_id: OnceLock::new(),
            nodes: OnceLock::new(),
        };
        let _ = manager.user_id.set(ctx.user_id);
        let _ = manager.nodes.set(nodes);
        manager
    }
}
