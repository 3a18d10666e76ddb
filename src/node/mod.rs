//! Conexión con un nodo Lavalink: stream de eventos por WebSocket, API REST y
//! reanudación de sesión.
//!
//! Cada nodo procesa sus mensajes de forma secuencial en una sola tarea y es
//! dueño de los players que tiene asignados.

pub mod protocol;
pub mod rest;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serenity::model::id::{GuildId, UserId};
use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{net::TcpStream, sync::broadcast};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::{
    protocol::{IncomingMessage, LoadResult, Ready, Stats, UpdatePlayer, UpdateSession},
    rest::{RestApi, RestClient},
};
use crate::{
    audio::{
        player::{Player, PlayerOptions, PlayerSnapshot},
        track::UserData,
    },
    config::{ManagerOptions, NodeConfig},
    error::Error,
    events::Event,
    gateway::VoiceGateway,
    retry::{retry, RetryPolicy},
    storage::{guild_from_key, player_key, player_prefix, session_key, StateStore},
    Result,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Contexto de ejecución compartido por todos los nodos y players.
///
/// Se construye una sola vez en `Manager::init`.
pub(crate) struct Context<U> {
    pub user_id: UserId,
    pub store: Arc<dyn StateStore>,
    pub gateway: Arc<dyn VoiceGateway>,
    pub events: broadcast::Sender<Event<U>>,
    pub options: ManagerOptions,
}

impl<U> Context<U> {
    pub fn emit(&self, event: Event<U>) {
        // Sin suscriptores el evento simplemente se descarta
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Ready,
    Resumed,
}

pub struct Node<U: UserData> {
    config: NodeConfig,
    ctx: Arc<Context<U>>,
    rest: Arc<dyn RestApi>,
    session_id: RwLock<Option<String>>,
    state: RwLock<NodeState>,
    stats: RwLock<Option<Stats>>,
    /// Se perdieron conexiones de voz desde el último ready procesado
    has_disconnected: AtomicBool,
    players: DashMap<GuildId, Arc<Player<U>>>,
    connection: Mutex<Option<CancellationToken>>,
}

impl<U: UserData> Node<U> {
    pub(crate) fn new(config: NodeConfig, ctx: Arc<Context<U>>) -> Result<Arc<Self>> {
        let rest = RestClient::new(&config, &ctx.options.client_name)?;
        Ok(Self::with_rest(config, ctx, Arc::new(rest)))
    }

    pub(crate) fn with_rest(
        config: NodeConfig,
        ctx: Arc<Context<U>>,
        rest: Arc<dyn RestApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ctx,
            rest,
            session_id: RwLock::new(None),
            state: RwLock::new(NodeState::Disconnected),
            stats: RwLock::new(None),
            // Un proceso nuevo siempre debe resincronizar sus players
            has_disconnected: AtomicBool::new(true),
            players: DashMap::new(),
            connection: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Identidad del nodo (`host:port`)
    pub fn address(&self) -> String {
        self.config.address()
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), NodeState::Ready | NodeState::Resumed)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Últimas estadísticas publicadas por el nodo
    pub fn stats(&self) -> Option<Stats> {
        self.stats.read().clone()
    }

    pub fn player(&self, guild_id: GuildId) -> Option<Arc<Player<U>>> {
        self.players.get(&guild_id).map(|p| Arc::clone(p.value()))
    }

    pub fn players(&self) -> Vec<Arc<Player<U>>> {
        self.players.iter().map(|p| Arc::clone(p.value())).collect()
    }

    // ------------------------------------------------------------------
    // Conexión
    // ------------------------------------------------------------------

    /// Abre el stream del nodo, reemplazando cualquier intento anterior.
    ///
    /// Si el primer intento falla se programa la reconexión igualmente y se
    /// devuelve el error.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self.connection.lock().replace(token.clone()) {
            previous.cancel();
        }

        match self.open(1).await {
            Ok(stream) => {
                tokio::spawn(Arc::clone(self).supervise(token, Some(stream)));
                Ok(())
            }
            Err(e) => {
                error!("❌ No se pudo conectar al nodo {}: {}", self.config.name, e);
                self.ctx.emit(Event::NodeError {
                    node: self.config.name.clone(),
                    message: e.to_string(),
                });
                tokio::spawn(Arc::clone(self).supervise(token, None));
                Err(e)
            }
        }
    }

    /// Cierra la conexión y cancela cualquier reconexión pendiente
    pub fn disconnect(&self) {
        if let Some(token) = self.connection.lock().take() {
            token.cancel();
        }
        *self.session_id.write() = None;
        *self.state.write() = NodeState::Disconnected;
        info!("🔌 Nodo {} desconectado", self.config.name);
    }

    async fn open(&self, attempt: u32) -> Result<WsStream> {
        *self.state.write() = NodeState::Connecting;
        info!(
            "🔗 Conectando al nodo {} ({}), intento {}",
            self.config.name,
            self.address(),
            attempt
        );

        let mut request = self.config.websocket_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", HeaderValue::from_str(&self.config.password)?);
        headers.insert("User-Id", HeaderValue::from_str(&self.ctx.user_id.to_string())?);
        headers.insert(
            "Client-Name",
            HeaderValue::from_str(&self.ctx.options.client_name)?,
        );
        if let Some(session_id) = self.ctx.store.get(&session_key(&self.address())).await? {
            debug!("🔁 Intentando reanudar sesión {}", session_id);
            headers.insert("Session-Id", HeaderValue::from_str(&session_id)?);
        }

        match connect_async(request).await {
            Ok((stream, _)) => Ok(stream),
            Err(e) => {
                *self.state.write() = NodeState::Disconnected;
                Err(e.into())
            }
        }
    }

    /// Lee el stream hasta que se cierre y reconecta con intervalo fijo
    async fn supervise(self: Arc<Self>, token: CancellationToken, mut stream: Option<WsStream>) {
        loop {
            let ws = match stream.take() {
                Some(ws) => ws,
                None => {
                    let interval = self.ctx.options.reconnect_interval;
                    let policy = RetryPolicy::forever(interval);
                    let reopened = tokio::select! {
                        _ = token.cancelled() => return,
                        result = async {
                            tokio::time::sleep(interval).await;
                            retry(&policy, |attempt| self.open(attempt)).await
                        } => result,
                    };
                    match reopened {
                        Ok(ws) => ws,
                        Err(e) => {
                            error!("❌ Reconexión abandonada para {}: {}", self.config.name, e);
                            return;
                        }
                    }
                }
            };

            info!("✅ Conectado al nodo {}", self.config.name);
            self.ctx.emit(Event::NodeConnected {
                node: self.config.name.clone(),
            });

            self.read_stream(ws, &token).await;
            if token.is_cancelled() {
                return;
            }
            self.handle_close().await;
        }
    }

    async fn read_stream(self: &Arc<Self>, mut ws: WsStream, token: &CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => None,
                message = ws.next() => Some(message),
            };
            let Some(message) = message else {
                let _ = ws.close(None).await;
                return;
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    if self.handle_message(text.as_str()).await.is_break() {
                        let _ = ws.close(None).await;
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!("🔌 Nodo {} cerró la conexión: {:?}", self.config.name, frame);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("❌ Error en el stream de {}: {}", self.config.name, e);
                    self.ctx.emit(Event::NodeError {
                        node: self.config.name.clone(),
                        message: e.to_string(),
                    });
                    return;
                }
                None => return,
            }
        }
    }

    /// Stream cerrado: se invalida la sesión y se sueltan las conexiones de voz
    pub(crate) async fn handle_close(&self) {
        *self.session_id.write() = None;
        *self.state.write() = NodeState::Disconnected;

        let players = self.players();
        for player in &players {
            player.mark_voice_disconnected();
        }
        if !players.is_empty() {
            self.has_disconnected.store(true, Ordering::SeqCst);
        }

        warn!(
            "⚠️ Nodo {} desconectado ({} players afectados), reintento en {}",
            self.config.name,
            players.len(),
            humantime::format_duration(self.ctx.options.reconnect_interval)
        );
        self.ctx.emit(Event::NodeDisconnected {
            node: self.config.name.clone(),
        });

        for player in players {
            if let Err(e) = player.force_disconnect().await {
                warn!("No se pudo desconectar la voz de {}: {}", player.guild_id(), e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Mensajes del stream
    // ------------------------------------------------------------------

    /// `Break` cierra el stream para que el ciclo de reconexión recupere el nodo
    pub(crate) async fn handle_message(self: &Arc<Self>, text: &str) -> ControlFlow<()> {
        let message: IncomingMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️ Mensaje no reconocido de {}: {}", self.config.name, e);
                return ControlFlow::Continue(());
            }
        };

        match message {
            IncomingMessage::Ready(ready) => {
                if let Err(e) = self.handle_ready(ready).await {
                    error!("❌ Error procesando ready de {}: {}", self.config.name, e);
                    self.ctx.emit(Event::NodeError {
                        node: self.config.name.clone(),
                        message: e.to_string(),
                    });
                    // La próxima sesión debe resincronizar desde los snapshots
                    self.has_disconnected.store(true, Ordering::SeqCst);
                    return ControlFlow::Break(());
                }
            }
            IncomingMessage::Stats(stats) => {
                debug!(
                    "📊 {}: {} players ({} reproduciendo)",
                    self.config.name, stats.players, stats.playing_players
                );
                *self.stats.write() = Some(stats);
            }
            IncomingMessage::PlayerUpdate(update) => {
                if let Some(player) = self.player(update.guild_id) {
                    player.update_state(update.state);
                    if let Err(e) = player.persist().await {
                        warn!("No se pudo guardar el estado de {}: {}", update.guild_id, e);
                    }
                }
            }
            IncomingMessage::Event(event) => match self.player(event.guild_id()) {
                Some(player) => player.handle_event(event).await,
                None => debug!("Evento para guild sin player: {}", event.guild_id()),
            },
        }
        ControlFlow::Continue(())
    }

    async fn handle_ready(self: &Arc<Self>, ready: Ready) -> Result<()> {
        let address = self.address();
        *self.session_id.write() = Some(ready.session_id.clone());
        if let Err(e) = self
            .ctx
            .store
            .set(&session_key(&address), ready.session_id.clone())
            .await
        {
            warn!("No se pudo guardar la sesión de {}: {}", address, e);
        }

        if ready.resumed && !self.has_disconnected.load(Ordering::SeqCst) {
            *self.state.write() = NodeState::Resumed;
            info!("🔁 Sesión {} reanudada en {}", ready.session_id, self.config.name);
            self.ctx.emit(Event::NodeResumed {
                node: self.config.name.clone(),
            });
            return Ok(());
        }

        self.rest
            .update_session(
                &ready.session_id,
                &UpdateSession {
                    resuming: true,
                    timeout: self.ctx.options.resume_timeout.as_secs(),
                },
            )
            .await?;

        let restored = self.sync_players().await?;
        self.has_disconnected.store(false, Ordering::SeqCst);
        *self.state.write() = NodeState::Ready;

        info!(
            "✅ Nodo {} listo (sesión {}, {} players restaurados)",
            self.config.name, ready.session_id, restored
        );
        self.ctx.emit(Event::NodeReady {
            node: self.config.name.clone(),
            restored_players: restored,
        });
        Ok(())
    }

    /// Reconstruye todos los players guardados para este nodo
    async fn sync_players(self: &Arc<Self>) -> Result<usize> {
        let keys = self.ctx.store.keys(&player_prefix(&self.address())).await?;
        let mut restored = 0;

        for key in keys {
            let Some(guild_id) = guild_from_key(&key) else {
                continue;
            };
            match self.restore_player(guild_id).await {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => warn!("⚠️ No se pudo restaurar el player {}: {}", guild_id, e),
            }
        }

        Ok(restored)
    }

    /// Reconstruye un player desde su snapshot y retoma la reproducción.
    ///
    /// Devuelve `false` si no había snapshot utilizable.
    pub async fn restore_player(self: &Arc<Self>, guild_id: GuildId) -> Result<bool> {
        let key = player_key(&self.address(), guild_id);
        let Some(raw) = self.ctx.store.get(&key).await? else {
            return Ok(false);
        };

        let snapshot: PlayerSnapshot<U> = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("🗑️ Snapshot inválido para {}, descartado: {}", guild_id, e);
                self.ctx.store.delete(&key).await?;
                return Ok(false);
            }
        };
        let was_playing = snapshot.playing;
        let paused = snapshot.paused;
        let position = snapshot.position;

        let player = Arc::new(Player::from_snapshot(
            Arc::downgrade(self),
            Arc::clone(&self.ctx),
            self.address(),
            snapshot,
        ));
        if let Some(previous) = self.players.insert(guild_id, Arc::clone(&player)) {
            previous.mark_destroyed();
        }

        // Volumen, filtros y credenciales de voz
        player.flush_voice().await;
        player.init().await;

        if was_playing {
            if let Err(e) = player.connect().await {
                warn!("No se pudo volver al canal de voz en {}: {}", guild_id, e);
            }
            if let Some(track) = player.current() {
                let patch = UpdatePlayer {
                    track: Some(track.to_update()),
                    position: Some(position),
                    paused: Some(paused),
                    ..Default::default()
                };
                self.update_player(guild_id, patch, false).await?;
            }
        }

        info!("♻️ Player {} restaurado en {}", guild_id, self.config.name);
        self.ctx.emit(Event::PlayerRestored { guild_id });
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Players
    // ------------------------------------------------------------------

    /// Devuelve el player existente del guild o crea uno nuevo
    pub async fn create_player(self: &Arc<Self>, options: PlayerOptions) -> Result<Arc<Player<U>>> {
        let guild_id = options.guild_id;
        if let Some(existing) = self.player(guild_id) {
            return Ok(existing);
        }

        let player = Arc::new(Player::new(
            Arc::downgrade(self),
            Arc::clone(&self.ctx),
            self.address(),
            options,
        ));
        let player = Arc::clone(self.players.entry(guild_id).or_insert(player).value());

        info!("🎵 Player creado para {} en {}", guild_id, self.config.name);
        self.ctx.emit(Event::PlayerCreated { guild_id });
        player.persist().await?;
        Ok(player)
    }

    /// Elimina el player localmente y en el nodo, borra su snapshot y sale del canal
    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<()> {
        let Some((_, player)) = self.players.remove(&guild_id) else {
            return Ok(());
        };
        player.mark_destroyed();

        if let Some(session_id) = self.session_id() {
            if let Err(e) = self.rest.destroy_player(&session_id, guild_id).await {
                warn!("No se pudo eliminar el player remoto {}: {}", guild_id, e);
            }
        }

        self.ctx
            .store
            .delete(&player_key(&self.address(), guild_id))
            .await?;

        if let Err(e) = self
            .ctx
            .gateway
            .update_voice_state(guild_id, None, false, false)
            .await
        {
            warn!("No se pudo salir del canal de voz en {}: {}", guild_id, e);
        }

        info!("🗑️ Player {} destruido", guild_id);
        self.ctx.emit(Event::PlayerDestroyed { guild_id });
        Ok(())
    }

    /// Envía un parche al player remoto.
    ///
    /// Un parche con track para un player sin voz conectada se difiere y se
    /// reintenta una sola vez.
    pub async fn update_player(
        self: &Arc<Self>,
        guild_id: GuildId,
        patch: UpdatePlayer,
        no_replace: bool,
    ) -> Result<()> {
        if self.session_id.read().is_none() {
            return Err(Error::NodeNotReady(self.address()));
        }

        if patch.has_track() && !self.voice_connected(guild_id) {
            debug!("⏳ Voz no lista en {}, track diferido", guild_id);
            self.defer_update(guild_id, patch, no_replace);
            return Ok(());
        }

        self.send_update(guild_id, &patch, no_replace).await
    }

    fn voice_connected(&self, guild_id: GuildId) -> bool {
        self.player(guild_id)
            .is_some_and(|player| player.is_voice_connected())
    }

    fn defer_update(self: &Arc<Self>, guild_id: GuildId, patch: UpdatePlayer, no_replace: bool) {
        let node = Arc::downgrade(self);
        let policy = RetryPolicy::once_after(self.ctx.options.deferred_update_delay);

        tokio::spawn(async move {
            let result = retry(&policy, |_| {
                let node = node.clone();
                let patch = patch.clone();
                async move {
                    let node = node.upgrade().ok_or(Error::NodeGone)?;
                    if !node.voice_connected(guild_id) {
                        return Err(Error::VoiceNotConnected(guild_id));
                    }
                    node.send_update(guild_id, &patch, no_replace).await
                }
            })
            .await;

            if let Err(e) = result {
                warn!("⚠️ Track diferido descartado para {}: {}", guild_id, e);
            }
        });
    }

    async fn send_update(&self, guild_id: GuildId, patch: &UpdatePlayer, no_replace: bool) -> Result<()> {
        let session_id = self
            .session_id()
            .ok_or_else(|| Error::NodeNotReady(self.address()))?;
        self.rest
            .update_player(&session_id, guild_id, patch, no_replace)
            .await
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        self.rest.load_tracks(identifier).await
    }

    #[cfg(test)]
    pub(crate) fn mark_ready(&self, session_id: &str) {
        *self.session_id.write() = Some(session_id.to_string());
        *self.state.write() = NodeState::Ready;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::{
        audio::track::fixtures::track,
        gateway::MockVoiceGateway,
        node::{protocol::PlayerUpdateState, rest::MockRestApi},
        storage::MemoryStore,
    };
    use serenity::model::id::ChannelId;
    use std::time::Duration;

    const READY: &str = r#"{"op":"ready","resumed":false,"sessionId":"s1"}"#;
    const RESUMED: &str = r#"{"op":"ready","resumed":true,"sessionId":"s1"}"#;

    /// Guarda snapshots como lo haría un proceso anterior
    async fn seed_snapshots(store: &Arc<MemoryStore>, guilds: &[u64]) {
        let ctx = context(Arc::clone(store), MockVoiceGateway::new(), options());
        let (node, _) = node(MockRestApi::new(), ctx);
        for guild in guilds {
            node.create_player(PlayerOptions::new(GuildId::new(*guild)))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cold_ready_restores_snapshots_before_ready() {
        let store = Arc::new(MemoryStore::new());
        seed_snapshots(&store, &[10, 20]).await;

        let mut rest = MockRestApi::new();
        rest.expect_update_session()
            .withf(|session, update| session == "s1" && update.resuming && update.timeout == 60)
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = context(Arc::clone(&store), MockVoiceGateway::new(), options());
        let (node, mut events) = node(rest, ctx);

        assert!(node.handle_message(READY).await.is_continue());

        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(node.players().len(), 2);
        assert!(node.player(GuildId::new(10)).is_some());
        assert_eq!(
            store.get(&session_key("localhost:2333")).await.unwrap().as_deref(),
            Some("s1")
        );

        let events = drain(&mut events);
        let ready: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::NodeReady { .. }))
            .collect();
        assert_eq!(ready.len(), 1);
        assert!(matches!(
            events.last(),
            Some(Event::NodeReady { restored_players: 2, .. })
        ));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::PlayerRestored { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_resumed_session_skips_resync() {
        let store = Arc::new(MemoryStore::new());
        let mut rest = MockRestApi::new();
        rest.expect_update_session().times(1).returning(|_, _| Ok(()));
        let ctx = context(store, MockVoiceGateway::new(), options());
        let (node, mut events) = node(rest, ctx);

        // Un proceso nuevo resincroniza aunque el nodo diga que reanudó
        assert!(node.handle_message(RESUMED).await.is_continue());
        assert_eq!(node.state(), NodeState::Ready);

        assert!(node.handle_message(RESUMED).await.is_continue());
        assert_eq!(node.state(), NodeState::Resumed);
        assert!(matches!(
            drain(&mut events).last(),
            Some(Event::NodeResumed { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_with_players_forces_full_resync() {
        let store = Arc::new(MemoryStore::new());
        let mut rest = MockRestApi::new();
        rest.expect_update_session().times(2).returning(|_, _| Ok(()));
        let mut gateway = MockVoiceGateway::new();
        gateway
            .expect_update_voice_state()
            .withf(|guild, channel, _, _| *guild == GuildId::new(5) && channel.is_none())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let ctx = context(store, gateway, options());
        let (node, mut events) = node(rest, ctx);

        assert!(node.handle_message(READY).await.is_continue());
        let player = node
            .create_player(PlayerOptions::new(GuildId::new(5)))
            .await
            .unwrap();
        player.update_state(PlayerUpdateState {
            time: 0,
            position: 0,
            connected: true,
            ping: 20,
        });

        node.handle_close().await;
        assert_eq!(node.session_id(), None);
        assert_eq!(node.state(), NodeState::Disconnected);
        assert!(!player.is_voice_connected());
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::NodeDisconnected { .. })));

        assert!(node.handle_message(RESUMED).await.is_continue());
        assert_eq!(node.state(), NodeState::Ready);
        assert!(matches!(
            drain(&mut events).last(),
            Some(Event::NodeReady { restored_players: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_update_player_requires_session() {
        let ctx = context(Arc::new(MemoryStore::new()), MockVoiceGateway::new(), options());
        let (node, _) = node(MockRestApi::new(), ctx);

        let result = node
            .update_player(GuildId::new(1), UpdatePlayer::stop(), false)
            .await;
        assert!(matches!(result, Err(Error::NodeNotReady(addr)) if addr == "localhost:2333"));
    }

    #[tokio::test]
    async fn test_deferred_track_sent_once_voice_connects() {
        let mut rest = MockRestApi::new();
        rest.expect_update_player()
            .withf(|_, _, update, _| update.has_track())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let ctx = context(Arc::new(MemoryStore::new()), MockVoiceGateway::new(), options());
        let (node, _) = node(rest, ctx);
        node.mark_ready("s1");

        let guild = GuildId::new(3);
        let player = node.create_player(PlayerOptions::new(guild)).await.unwrap();
        let patch = UpdatePlayer {
            track: Some(track("A").to_update()),
            ..Default::default()
        };
        node.update_player(guild, patch, false).await.unwrap();

        player.update_state(PlayerUpdateState {
            time: 0,
            position: 0,
            connected: true,
            ping: 10,
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_deferred_track_dropped_without_voice() {
        let mut rest = MockRestApi::new();
        rest.expect_update_player().times(0);
        let ctx = context(Arc::new(MemoryStore::new()), MockVoiceGateway::new(), options());
        let (node, _) = node(rest, ctx);
        node.mark_ready("s1");

        let guild = GuildId::new(3);
        node.create_player(PlayerOptions::new(guild)).await.unwrap();
        let patch = UpdatePlayer {
            track: Some(track("A").to_update()),
            ..Default::default()
        };
        node.update_player(guild, patch, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_destroy_player_removes_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let mut rest = MockRestApi::new();
        rest.expect_destroy_player()
            .withf(|session, guild| session == "s1" && *guild == GuildId::new(9))
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = context(Arc::clone(&store), quiet_gateway(), options());
        let (node, mut events) = node(rest, ctx);
        node.mark_ready("s1");

        let guild = GuildId::new(9);
        node.create_player(PlayerOptions::new(guild)).await.unwrap();
        assert!(store.get(&player_key("localhost:2333", guild)).await.unwrap().is_some());

        node.destroy_player(guild).await.unwrap();
        assert!(node.player(guild).is_none());
        assert!(store.get(&player_key("localhost:2333", guild)).await.unwrap().is_none());
        assert!(matches!(
            drain(&mut events).last(),
            Some(Event::PlayerDestroyed { guild_id }) if *guild_id == guild
        ));

        // Destruir dos veces no hace nada
        node.destroy_player(guild).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_ready_closes_stream_and_resyncs_next_session() {
        let store = Arc::new(MemoryStore::new());
        let mut rest = MockRestApi::new();
        let mut attempts = 0;
        rest.expect_update_session().times(2).returning(move |_, _| {
            attempts += 1;
            if attempts == 1 {
                Err(Error::Rest {
                    status: 503,
                    message: "Service Unavailable (/v4/sessions/s1)".into(),
                })
            } else {
                Ok(())
            }
        });
        let ctx = context(store, MockVoiceGateway::new(), options());
        let (node, mut events) = node(rest, ctx);

        assert!(node.handle_message(READY).await.is_break());
        assert_ne!(node.state(), NodeState::Ready);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::NodeError { .. })));

        node.handle_close().await;
        assert_eq!(node.session_id(), None);
        assert_eq!(node.state(), NodeState::Disconnected);

        // Aunque el nodo diga que reanudó, la sesión nunca quedó configurada
        assert!(node.handle_message(RESUMED).await.is_continue());
        assert_eq!(node.state(), NodeState::Ready);
        assert!(node.is_ready());
    }

    #[tokio::test]
    async fn test_restore_playing_snapshot_resumes_track_at_position() {
        let store = Arc::new(MemoryStore::new());
        let guild = GuildId::new(42);

        let seed_ctx = context(Arc::clone(&store), quiet_gateway(), options());
        let (seed, _) = node(MockRestApi::new(), seed_ctx);
        let seeded = seed
            .create_player(PlayerOptions::new(guild).voice_channel(ChannelId::new(7)))
            .await
            .unwrap();
        let mut snapshot = seeded.snapshot();
        snapshot.playing = true;
        snapshot.position = 42_000;
        snapshot.voice_endpoint = Some("voice.example.com".into());
        snapshot.voice_token = Some("token".into());
        snapshot.voice_session_id = Some("voice-session".into());
        snapshot.queue.current = Some(track("A"));
        store
            .set(
                &player_key("localhost:2333", guild),
                serde_json::to_string(&snapshot).unwrap(),
            )
            .await
            .unwrap();

        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&sent);
        let mut rest = MockRestApi::new();
        rest.expect_update_player()
            .withf(move |session, target, _, _| session == "s1" && *target == guild)
            .times(2)
            .returning(move |_, _, update, _| {
                recorded.lock().push(serde_json::to_value(update).unwrap());
                Ok(())
            });
        let mut gateway = MockVoiceGateway::new();
        gateway
            .expect_update_voice_state()
            .withf(move |target, channel, _, _| {
                *target == guild && *channel == Some(ChannelId::new(7))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let ctx = context(Arc::clone(&store), gateway, options());
        let (node, mut events) = node(rest, ctx);
        node.mark_ready("s1");

        assert!(node.restore_player(guild).await.unwrap());

        let sent = sent.lock().clone();
        assert_eq!(
            sent[0]["voice"],
            serde_json::json!({
                "token": "token",
                "endpoint": "voice.example.com",
                "sessionId": "voice-session"
            })
        );
        assert_eq!(sent[0]["filters"]["volume"], serde_json::json!(1.0));
        assert_eq!(
            sent[1],
            serde_json::json!({
                "track": { "encoded": "A" },
                "position": 42_000,
                "paused": false
            })
        );

        let player = node.player(guild).unwrap();
        assert!(player.is_playing());
        assert_eq!(player.current().map(|t| t.encoded), Some("A".to_string()));
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::PlayerRestored { guild_id } if *guild_id == guild)));
    }
}
