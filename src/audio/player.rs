use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    filters::{Band, EqPreset, Filters, Karaoke, LowPass, Rotation, Timescale, Tremolo, Vibrato},
    queue::{QueueState, TrackQueue},
    track::{RepeatMode, Track, UserData},
};
use crate::{
    error::Error,
    events::Event,
    node::{
        protocol::{self, PlayerUpdateState, TrackData, TrackEndReason, UpdatePlayer, VoiceCredentials},
        Context, Node,
    },
    storage::player_key,
    Result,
};

/// Parámetros de creación de un player
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerOptions {
    pub guild_id: GuildId,
    pub voice_channel_id: Option<ChannelId>,
    pub text_channel_id: Option<ChannelId>,
    pub self_deaf: bool,
    pub self_mute: bool,
    /// Volumen inicial; por defecto el configurado en el manager
    pub volume: Option<f32>,
    pub auto_leave: Option<bool>,
    pub auto_leave_timeout: Option<Duration>,
}

impl PlayerOptions {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            voice_channel_id: None,
            text_channel_id: None,
            self_deaf: true,
            self_mute: false,
            volume: None,
            auto_leave: None,
            auto_leave_timeout: None,
        }
    }

    pub fn voice_channel(mut self, channel_id: ChannelId) -> Self {
        self.voice_channel_id = Some(channel_id);
        self
    }

    pub fn text_channel(mut self, channel_id: ChannelId) -> Self {
        self.text_channel_id = Some(channel_id);
        self
    }
}

/// Estado persistido de un player, suficiente para reconstruirlo tras un
/// reinicio o una caída del nodo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "U: Deserialize<'de>"))]
pub struct PlayerSnapshot<U> {
    pub guild_id: GuildId,
    pub voice_channel_id: Option<ChannelId>,
    pub text_channel_id: Option<ChannelId>,
    pub voice_endpoint: Option<String>,
    pub voice_token: Option<String>,
    pub voice_session_id: Option<String>,
    pub repeat: RepeatMode,
    pub playing: bool,
    pub paused: bool,
    pub volume: f32,
    /// Milisegundos
    pub position: u64,
    pub auto_leave: bool,
    pub auto_leave_timeout_ms: u64,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub queue: QueueState<U>,
    pub filters: Filters,
    pub updated_at: DateTime<Utc>,
}

/// Credenciales de voz; cada parte llega por separado y en cualquier orden
#[derive(Debug, Clone, Default)]
struct VoiceSlot {
    token: Option<String>,
    endpoint: Option<String>,
    session_id: Option<String>,
    /// El triple actual ya se entregó al nodo
    sent: bool,
}

impl VoiceSlot {
    fn set_server(&mut self, token: String, endpoint: Option<String>) {
        if self.token.as_deref() != Some(token.as_str()) || self.endpoint != endpoint {
            self.sent = false;
        }
        self.token = Some(token);
        self.endpoint = endpoint;
    }

    fn set_session(&mut self, session_id: String) {
        if self.session_id.as_deref() != Some(session_id.as_str()) {
            self.sent = false;
        }
        self.session_id = Some(session_id);
    }

    fn credentials(&self) -> Option<VoiceCredentials> {
        Some(VoiceCredentials {
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            session_id: self.session_id.clone()?,
        })
    }

    /// Devuelve el triple solo si está completo y aún no se envió
    fn take_ready(&mut self) -> Option<VoiceCredentials> {
        if self.sent {
            return None;
        }
        let credentials = self.credentials()?;
        self.sent = true;
        Some(credentials)
    }
}

#[derive(Debug)]
struct PlayerState {
    voice_channel_id: Option<ChannelId>,
    text_channel_id: Option<ChannelId>,
    self_deaf: bool,
    self_mute: bool,
    voice: VoiceSlot,
    voice_connected: bool,
    /// Voz soltada por caída del nodo; no cuenta como salida del canal
    suspended: bool,
    destroyed: bool,
    position: u64,
    time: i64,
    ping: i64,
    repeat: RepeatMode,
    playing: bool,
    paused: bool,
    filters: Filters,
    auto_leave: bool,
    auto_leave_timeout: Duration,
}

enum Advance<U> {
    Nothing,
    Play(Track<U>),
    QueueEnd,
}

enum VoiceChange {
    Unchanged,
    Moved(Option<ChannelId>, ChannelId),
    Left(Option<ChannelId>),
}

/// Sesión de reproducción de un guild, asignada a un único nodo.
///
/// El estado vive detrás de locks síncronos que nunca se mantienen a través
/// de un `.await`; cuando se toman ambos, el orden es estado y luego cola.
pub struct Player<U: UserData> {
    guild_id: GuildId,
    node: Weak<Node<U>>,
    node_address: String,
    ctx: Arc<Context<U>>,
    state: Mutex<PlayerState>,
    queue: Mutex<TrackQueue<U>>,
    auto_leave_task: Mutex<Option<JoinHandle<()>>>,
}

impl<U: UserData> Player<U> {
    pub(crate) fn new(
        node: Weak<Node<U>>,
        ctx: Arc<Context<U>>,
        node_address: String,
        options: PlayerOptions,
    ) -> Self {
        let state = PlayerState {
            voice_channel_id: options.voice_channel_id,
            text_channel_id: options.text_channel_id,
            self_deaf: options.self_deaf,
            self_mute: options.self_mute,
            voice: VoiceSlot::default(),
            voice_connected: false,
            suspended: false,
            destroyed: false,
            position: 0,
            time: 0,
            ping: -1,
            repeat: RepeatMode::Off,
            playing: false,
            paused: false,
            filters: Filters::with_volume(options.volume.unwrap_or(ctx.options.default_volume)),
            auto_leave: options.auto_leave.unwrap_or(ctx.options.auto_leave),
            auto_leave_timeout: options
                .auto_leave_timeout
                .unwrap_or(ctx.options.auto_leave_timeout),
        };

        Self {
            guild_id: options.guild_id,
            node,
            node_address,
            ctx,
            state: Mutex::new(state),
            queue: Mutex::new(TrackQueue::new()),
            auto_leave_task: Mutex::new(None),
        }
    }

    pub(crate) fn from_snapshot(
        node: Weak<Node<U>>,
        ctx: Arc<Context<U>>,
        node_address: String,
        snapshot: PlayerSnapshot<U>,
    ) -> Self {
        let mut filters = snapshot.filters;
        filters.volume = snapshot.volume;

        let state = PlayerState {
            voice_channel_id: snapshot.voice_channel_id,
            text_channel_id: snapshot.text_channel_id,
            self_deaf: snapshot.self_deaf,
            self_mute: snapshot.self_mute,
            voice: VoiceSlot {
                token: snapshot.voice_token,
                endpoint: snapshot.voice_endpoint,
                session_id: snapshot.voice_session_id,
                sent: false,
            },
            voice_connected: false,
            suspended: false,
            destroyed: false,
            position: snapshot.position,
            time: 0,
            ping: -1,
            repeat: snapshot.repeat,
            playing: snapshot.playing,
            paused: snapshot.paused,
            filters,
            auto_leave: snapshot.auto_leave,
            auto_leave_timeout: Duration::from_millis(snapshot.auto_leave_timeout_ms),
        };

        Self {
            guild_id: snapshot.guild_id,
            node,
            node_address,
            ctx,
            state: Mutex::new(state),
            queue: Mutex::new(snapshot.queue.into()),
            auto_leave_task: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Consultas
    // ------------------------------------------------------------------

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn voice_channel_id(&self) -> Option<ChannelId> {
        self.state.lock().voice_channel_id
    }

    pub fn text_channel_id(&self) -> Option<ChannelId> {
        self.state.lock().text_channel_id
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_voice_connected(&self) -> bool {
        self.state.lock().voice_connected
    }

    /// Última posición reportada por el nodo
    pub fn position(&self) -> Duration {
        Duration::from_millis(self.state.lock().position)
    }

    /// Latencia de voz en ms; -1 sin conexión
    pub fn ping(&self) -> i64 {
        self.state.lock().ping
    }

    /// Momento del último `playerUpdate` recibido
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        match self.state.lock().time {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    pub fn repeat(&self) -> RepeatMode {
        self.state.lock().repeat
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().filters.volume
    }

    pub fn filters(&self) -> Filters {
        self.state.lock().filters.clone()
    }

    pub fn current(&self) -> Option<Track<U>> {
        self.queue.lock().current.clone()
    }

    pub fn previous(&self) -> Option<Track<U>> {
        self.queue.lock().previous.clone()
    }

    /// Acceso directo a la cola. No mantener el guard a través de un `.await`.
    pub fn queue(&self) -> MutexGuard<'_, TrackQueue<U>> {
        self.queue.lock()
    }

    pub fn enqueue(&self, track: Track<U>) {
        self.queue.lock().enqueue(track);
    }

    pub fn enqueue_many(&self, tracks: impl IntoIterator<Item = Track<U>>) -> usize {
        self.queue.lock().enqueue_many(tracks)
    }

    // ------------------------------------------------------------------
    // Voz
    // ------------------------------------------------------------------

    /// Se une al canal de voz configurado
    pub async fn connect(&self) -> Result<()> {
        let (channel_id, self_mute, self_deaf) = {
            let state = self.state.lock();
            (state.voice_channel_id, state.self_mute, state.self_deaf)
        };
        let channel_id = channel_id.ok_or(Error::VoiceNotConnected(self.guild_id))?;

        self.ctx
            .gateway
            .update_voice_state(self.guild_id, Some(channel_id), self_mute, self_deaf)
            .await
            .map_err(Error::Gateway)?;
        self.state.lock().suspended = false;

        info!("🔊 Uniéndose al canal {} en {}", channel_id, self.guild_id);
        Ok(())
    }

    /// Cambia de canal de voz
    pub async fn move_to(&self, channel_id: ChannelId) -> Result<()> {
        self.state.lock().voice_channel_id = Some(channel_id);
        self.connect().await?;
        self.persist().await
    }

    /// Sale del canal de voz sin destruir el player
    pub async fn disconnect(&self) -> Result<()> {
        let (self_mute, self_deaf) = {
            let mut state = self.state.lock();
            state.voice_channel_id = None;
            state.voice_connected = false;
            state.voice = VoiceSlot::default();
            (state.self_mute, state.self_deaf)
        };

        self.ctx
            .gateway
            .update_voice_state(self.guild_id, None, self_mute, self_deaf)
            .await
            .map_err(Error::Gateway)?;

        info!("👋 Desconectado de voz en {}", self.guild_id);
        self.persist().await
    }

    /// Suelta la voz porque el nodo se cayó; el canal se conserva para restaurar
    pub(crate) async fn force_disconnect(&self) -> Result<()> {
        let (self_mute, self_deaf) = {
            let mut state = self.state.lock();
            state.suspended = true;
            state.voice_connected = false;
            (state.self_mute, state.self_deaf)
        };

        self.ctx
            .gateway
            .update_voice_state(self.guild_id, None, self_mute, self_deaf)
            .await
            .map_err(Error::Gateway)
    }

    pub(crate) fn mark_voice_disconnected(&self) {
        let mut state = self.state.lock();
        state.voice_connected = false;
        state.voice.sent = false;
    }

    pub(crate) async fn handle_voice_server(&self, token: String, endpoint: Option<String>) {
        self.state.lock().voice.set_server(token, endpoint);
        self.flush_voice().await;
        self.persist_or_warn().await;
    }

    pub(crate) async fn handle_voice_state(&self, channel_id: Option<ChannelId>, session_id: String) {
        let change = {
            let mut state = self.state.lock();
            match channel_id {
                None => {
                    state.voice_connected = false;
                    state.voice.session_id = None;
                    state.voice.sent = false;
                    // Salida propia o caída del nodo: no hay nada más que hacer
                    if state.suspended || state.voice_channel_id.is_none() {
                        return;
                    }
                    VoiceChange::Left(state.voice_channel_id)
                }
                Some(channel_id) => {
                    state.voice.set_session(session_id);
                    match state.voice_channel_id.replace(channel_id) {
                        Some(old) if old == channel_id => VoiceChange::Unchanged,
                        old => VoiceChange::Moved(old, channel_id),
                    }
                }
            }
        };

        match change {
            VoiceChange::Left(old_channel) => {
                info!("👋 Expulsado del canal de voz en {}", self.guild_id);
                self.ctx.emit(Event::PlayerMoved {
                    guild_id: self.guild_id,
                    old_channel,
                    new_channel: None,
                });
                match self.node() {
                    Ok(node) => {
                        if let Err(e) = node.destroy_player(self.guild_id).await {
                            warn!("No se pudo destruir el player {}: {}", self.guild_id, e);
                        }
                    }
                    Err(e) => warn!("Player {} sin nodo: {}", self.guild_id, e),
                }
            }
            VoiceChange::Moved(old_channel, new_channel) => {
                info!("🔀 Player {} movido a {}", self.guild_id, new_channel);
                self.ctx.emit(Event::PlayerMoved {
                    guild_id: self.guild_id,
                    old_channel,
                    new_channel: Some(new_channel),
                });
                self.flush_voice().await;
                self.persist_or_warn().await;
            }
            VoiceChange::Unchanged => {
                self.flush_voice().await;
                self.persist_or_warn().await;
            }
        }
    }

    /// Entrega al nodo las credenciales de voz (con los filtros) si el triple
    /// está completo y no se había enviado
    pub(crate) async fn flush_voice(&self) {
        let patch = {
            let mut state = self.state.lock();
            let Some(voice) = state.voice.take_ready() else {
                return;
            };
            UpdatePlayer {
                voice: Some(voice),
                filters: Some(state.filters.clone()),
                ..Default::default()
            }
        };

        match self.send(patch).await {
            Ok(()) => {
                self.state.lock().voice_connected = true;
                debug!("🎙️ Credenciales de voz enviadas para {}", self.guild_id);
            }
            Err(e) => {
                self.state.lock().voice.sent = false;
                warn!("⚠️ No se pudieron enviar las credenciales de {}: {}", self.guild_id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Reproducción
    // ------------------------------------------------------------------

    /// Reproduce `track`, o el siguiente de la cola si es `None`
    pub async fn play(&self, track: Option<Track<U>>) -> Result<()> {
        let track = match track {
            Some(track) => track,
            None => self.queue.lock().dequeue().ok_or(Error::NothingToPlay)?,
        };

        self.cancel_auto_leave();
        self.queue.lock().current = Some(track.clone());
        self.state.lock().paused = false;

        info!("▶️ Reproduciendo {} en {}", track.title(), self.guild_id);
        self.send(UpdatePlayer {
            track: Some(track.to_update()),
            paused: Some(false),
            ..Default::default()
        })
        .await
    }

    /// Salta al siguiente track; sin siguiente, detiene la reproducción
    pub async fn skip(&self) -> Result<()> {
        let has_next = {
            let state = self.state.lock();
            let mut queue = self.queue.lock();
            if state.repeat == RepeatMode::Queue {
                if let Some(current) = queue.current.clone() {
                    queue.enqueue(current);
                }
            }
            !queue.is_empty()
        };

        if has_next {
            self.play(None).await
        } else {
            self.stop().await
        }
    }

    /// Vacía la cola y detiene el track actual
    pub async fn stop(&self) -> Result<()> {
        self.queue.lock().clear();
        self.send(UpdatePlayer::stop()).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.set_paused(true).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        self.send(UpdatePlayer {
            paused: Some(paused),
            ..Default::default()
        })
        .await?;
        self.state.lock().paused = paused;
        self.persist().await
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        let position = position.as_millis() as u64;
        self.send(UpdatePlayer {
            position: Some(position),
            ..Default::default()
        })
        .await?;
        self.state.lock().position = position;
        Ok(())
    }

    pub async fn set_repeat(&self, mode: RepeatMode) -> Result<()> {
        self.state.lock().repeat = mode;
        info!("🔁 Repetición {} en {}", mode, self.guild_id);
        self.persist().await
    }

    pub fn shuffle(&self) {
        self.queue.lock().shuffle();
    }

    /// Constructor de parches de filtros
    pub fn filter(&self) -> Filter<'_, U> {
        Filter { player: self }
    }

    async fn apply_filters(&self, filters: Filters) -> Result<()> {
        self.send(UpdatePlayer {
            filters: Some(filters.clone()),
            ..Default::default()
        })
        .await?;
        self.state.lock().filters = filters;
        self.persist().await
    }

    /// Destruye el player en su nodo
    pub async fn destroy(&self) -> Result<()> {
        self.node()?.destroy_player(self.guild_id).await
    }

    // ------------------------------------------------------------------
    // Persistencia
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> PlayerSnapshot<U> {
        let state = self.state.lock();
        let queue = self.queue.lock();
        PlayerSnapshot {
            guild_id: self.guild_id,
            voice_channel_id: state.voice_channel_id,
            text_channel_id: state.text_channel_id,
            voice_endpoint: state.voice.endpoint.clone(),
            voice_token: state.voice.token.clone(),
            voice_session_id: state.voice.session_id.clone(),
            repeat: state.repeat,
            playing: state.playing,
            paused: state.paused,
            volume: state.filters.volume,
            position: state.position,
            auto_leave: state.auto_leave,
            auto_leave_timeout_ms: state.auto_leave_timeout.as_millis() as u64,
            self_mute: state.self_mute,
            self_deaf: state.self_deaf,
            queue: QueueState::from(&*queue),
            filters: state.filters.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Guarda el snapshot actual en el almacén
    pub async fn persist(&self) -> Result<()> {
        if self.state.lock().destroyed {
            return Ok(());
        }
        let value = serde_json::to_string(&self.snapshot())?;
        self.ctx
            .store
            .set(&player_key(&self.node_address, self.guild_id), value)
            .await?;
        Ok(())
    }

    async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            warn!("No se pudo guardar el estado de {}: {}", self.guild_id, e);
        }
    }

    /// Completa la restauración de un player reconstruido desde su snapshot
    pub(crate) async fn init(&self) {
        let idle = {
            let state = self.state.lock();
            !state.playing && state.auto_leave
        };
        if idle {
            self.schedule_auto_leave();
        }
        self.persist_or_warn().await;
    }

    pub(crate) fn mark_destroyed(&self) {
        self.state.lock().destroyed = true;
        self.cancel_auto_leave();
    }

    // ------------------------------------------------------------------
    // Eventos del nodo
    // ------------------------------------------------------------------

    pub(crate) fn update_state(&self, update: PlayerUpdateState) {
        let mut state = self.state.lock();
        state.position = update.position;
        state.time = update.time;
        state.ping = update.ping;
        state.voice_connected = update.connected;
    }

    pub(crate) async fn handle_event(&self, event: protocol::Event) {
        match event {
            protocol::Event::TrackStartEvent(e) => self.on_track_start(e.track).await,
            protocol::Event::TrackEndEvent(e) => self.on_track_end(e.track, e.reason).await,
            protocol::Event::TrackExceptionEvent(e) => {
                let track = self.on_track_failed(e.track).await;
                warn!(
                    "❌ Error reproduciendo {} en {}: {:?}",
                    track.title(),
                    self.guild_id,
                    e.exception.message
                );
                self.ctx.emit(Event::TrackException {
                    guild_id: self.guild_id,
                    track,
                    exception: e.exception,
                });
            }
            protocol::Event::TrackStuckEvent(e) => {
                let track = self.on_track_failed(e.track).await;
                warn!("⚠️ Track atascado en {} ({} ms)", self.guild_id, e.threshold_ms);
                self.ctx.emit(Event::TrackStuck {
                    guild_id: self.guild_id,
                    track,
                    threshold_ms: e.threshold_ms,
                });
            }
            protocol::Event::WebSocketClosedEvent(e) => {
                warn!(
                    "🔌 Voz cerrada en {}: {} {}",
                    self.guild_id, e.code, e.reason
                );
                self.ctx.emit(Event::WebSocketClosed {
                    guild_id: self.guild_id,
                    code: e.code,
                    reason: e.reason,
                    by_remote: e.by_remote,
                });
            }
        }
    }

    /// Track del nodo con los datos del llamador si coincide con uno conocido
    fn resolve(queue: &TrackQueue<U>, data: TrackData) -> Track<U> {
        [queue.current.as_ref(), queue.previous.as_ref()]
            .into_iter()
            .flatten()
            .find(|track| track.encoded == data.encoded)
            .cloned()
            .unwrap_or_else(|| Track::from_data(data))
    }

    async fn on_track_start(&self, data: TrackData) {
        let track = {
            let mut queue = self.queue.lock();
            let track = Self::resolve(&queue, data);
            queue.current = Some(track.clone());
            track
        };
        {
            let mut state = self.state.lock();
            state.playing = true;
            state.paused = false;
        }
        self.cancel_auto_leave();

        info!("🎶 Empezó {} en {}", track.title(), self.guild_id);
        self.ctx.emit(Event::TrackStart {
            guild_id: self.guild_id,
            track,
        });
        self.persist_or_warn().await;
    }

    async fn on_track_end(&self, data: TrackData, reason: TrackEndReason) {
        let (ended, advance) = {
            let mut state = self.state.lock();
            let mut queue = self.queue.lock();
            state.playing = false;

            let ended = Self::resolve(&queue, data);
            let was_current = queue
                .current
                .as_ref()
                .is_some_and(|current| current.encoded == ended.encoded);
            if was_current {
                queue.current = None;
            }
            queue.previous = Some(ended.clone());

            // Un final que no corresponde al track actual ya fue atendido
            let advance = if !was_current || reason == TrackEndReason::Replaced {
                Advance::Nothing
            } else if !reason.may_start_next() {
                Advance::QueueEnd
            } else {
                let next = match state.repeat {
                    RepeatMode::Track => Some(ended.clone()),
                    RepeatMode::Queue => {
                        queue.enqueue(ended.clone());
                        queue.dequeue()
                    }
                    RepeatMode::Off => queue.dequeue(),
                };
                next.map_or(Advance::QueueEnd, Advance::Play)
            };
            (ended, advance)
        };

        debug!("⏹️ Terminó {} en {} ({:?})", ended.title(), self.guild_id, reason);
        self.ctx.emit(Event::TrackEnd {
            guild_id: self.guild_id,
            track: ended,
            reason,
        });

        match advance {
            Advance::Play(next) => {
                if let Err(e) = self.play(Some(next)).await {
                    warn!("⚠️ No se pudo iniciar el siguiente track en {}: {}", self.guild_id, e);
                }
            }
            Advance::QueueEnd => {
                info!("📭 Cola terminada en {}", self.guild_id);
                self.ctx.emit(Event::QueueEnd {
                    guild_id: self.guild_id,
                });
                if self.state.lock().auto_leave {
                    self.schedule_auto_leave();
                }
            }
            Advance::Nothing => {}
        }

        self.persist_or_warn().await;
    }

    async fn on_track_failed(&self, data: TrackData) -> Track<U> {
        let track = {
            let mut state = self.state.lock();
            let mut queue = self.queue.lock();
            state.playing = false;
            let track = Self::resolve(&queue, data);
            queue.current = None;
            track
        };

        if let Err(e) = self.send(UpdatePlayer::stop()).await {
            warn!("No se pudo detener {}: {}", self.guild_id, e);
        }
        self.persist_or_warn().await;
        track
    }

    // ------------------------------------------------------------------
    // Auto-leave
    // ------------------------------------------------------------------

    fn schedule_auto_leave(&self) {
        let timeout = self.state.lock().auto_leave_timeout;
        let node = self.node.clone();
        let guild_id = self.guild_id;

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(node) = node.upgrade() else {
                return;
            };
            let Some(player) = node.player(guild_id) else {
                return;
            };
            if player.is_playing() {
                return;
            }

            // El propio temporizador no debe abortarse al destruir
            player.auto_leave_task.lock().take();

            info!("⏰ Auto-leave en {} tras {}", guild_id, humantime::format_duration(timeout));
            player.ctx.emit(Event::AutoLeave { guild_id });
            if let Err(e) = node.destroy_player(guild_id).await {
                warn!("No se pudo destruir el player {}: {}", guild_id, e);
            }
        });

        if let Some(previous) = self.auto_leave_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn cancel_auto_leave(&self) {
        if let Some(task) = self.auto_leave_task.lock().take() {
            task.abort();
        }
    }

    fn node(&self) -> Result<Arc<Node<U>>> {
        self.node.upgrade().ok_or(Error::NodeGone)
    }

    async fn send(&self, patch: UpdatePlayer) -> Result<()> {
        self.node()?.update_player(self.guild_id, patch, false).await
    }
}

/// Acumula cambios de filtros sobre el estado actual del player.
///
/// Cada operación envía el estado completo (incluido el volumen); `reset`
/// envía solo el volumen.
pub struct Filter<'a, U: UserData> {
    player: &'a Player<U>,
}

impl<U: UserData> Filter<'_, U> {
    fn with(&self, change: impl FnOnce(&mut Filters)) -> Filters {
        let mut filters = self.player.filters();
        change(&mut filters);
        filters
    }

    /// Volumen del nodo, de 0.0 a 5.0
    pub async fn apply_volume(&self, volume: f32) -> Result<()> {
        let filters = self.with(|f| f.volume = volume.clamp(0.0, 5.0));
        self.player.apply_filters(filters).await
    }

    pub async fn apply_timescale(&self, timescale: Option<Timescale>) -> Result<()> {
        let filters = self.with(|f| f.timescale = timescale);
        self.player.apply_filters(filters).await
    }

    pub async fn apply_karaoke(&self, karaoke: Option<Karaoke>) -> Result<()> {
        let filters = self.with(|f| f.karaoke = karaoke);
        self.player.apply_filters(filters).await
    }

    pub async fn apply_equalizer(&self, bands: Vec<Band>) -> Result<()> {
        let filters = self.with(|f| f.equalizer = (!bands.is_empty()).then_some(bands));
        self.player.apply_filters(filters).await
    }

    pub async fn apply_preset(&self, preset: EqPreset) -> Result<()> {
        info!("🎛️ Preset {:?} en {}", preset, self.player.guild_id);
        self.apply_equalizer(preset.bands()).await
    }

    pub async fn apply_tremolo(&self, tremolo: Option<Tremolo>) -> Result<()> {
        let filters = self.with(|f| f.tremolo = tremolo);
        self.player.apply_filters(filters).await
    }

    pub async fn apply_vibrato(&self, vibrato: Option<Vibrato>) -> Result<()> {
        let filters = self.with(|f| f.vibrato = vibrato);
        self.player.apply_filters(filters).await
    }

    pub async fn apply_rotation(&self, rotation: Option<Rotation>) -> Result<()> {
        let filters = self.with(|f| f.rotation = rotation);
        self.player.apply_filters(filters).await
    }

    pub async fn apply_low_pass(&self, low_pass: Option<LowPass>) -> Result<()> {
        let filters = self.with(|f| f.low_pass = low_pass);
        self.player.apply_filters(filters).await
    }

    /// Quita todos los filtros conservando el volumen
    pub async fn reset(&self) -> Result<()> {
        self.player
            .apply_filters(Filters::with_volume(self.player.volume()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::track::fixtures::{track, track_data},
        gateway::MockVoiceGateway,
        node::{
            protocol::{Exception, Severity, TrackEnd, TrackException},
            rest::MockRestApi,
            testing::*,
        },
        storage::MemoryStore,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const GUILD: GuildId = GuildId::new(77);
    const CHANNEL: ChannelId = ChannelId::new(500);

    fn ended(name: &str, reason: TrackEndReason) -> protocol::Event {
        protocol::Event::TrackEndEvent(TrackEnd {
            guild_id: GUILD,
            track: track_data(name),
            reason,
        })
    }

    fn connected() -> PlayerUpdateState {
        PlayerUpdateState {
            time: 1,
            position: 0,
            connected: true,
            ping: 12,
        }
    }

    async fn ready_player(
        rest: MockRestApi,
        gateway: MockVoiceGateway,
        options: crate::config::ManagerOptions,
    ) -> (
        Arc<Node<String>>,
        Arc<Player<String>>,
        tokio::sync::broadcast::Receiver<Event<String>>,
    ) {
        let ctx = context(Arc::new(MemoryStore::new()), gateway, options);
        let (node, events) = node(rest, ctx);
        node.mark_ready("s1");
        let player = node
            .create_player(PlayerOptions::new(GUILD).voice_channel(CHANNEL))
            .await
            .unwrap();
        (node, player, events)
    }

    fn names(player: &Player<String>) -> Vec<String> {
        player.queue().iter().map(|t| t.encoded.clone()).collect()
    }

    #[tokio::test]
    async fn test_voice_update_sent_once_per_completion() {
        let mut rest = MockRestApi::new();
        rest.expect_update_player()
            .withf(|_, _, update, _| {
                update.voice.is_some() && update.filters.is_some() && !update.has_track()
            })
            .times(2)
            .returning(|_, _, _, _| Ok(()));
        let (_node, player, _) = ready_player(rest, MockVoiceGateway::new(), options()).await;

        // Servidor primero, sesión después
        player.handle_voice_server("tok".into(), Some("eu.discord.gg".into())).await;
        assert!(!player.is_voice_connected());
        player.handle_voice_state(Some(CHANNEL), "sess".into()).await;
        assert!(player.is_voice_connected());

        // Repetir el mismo estado no reenvía nada
        player.handle_voice_state(Some(CHANNEL), "sess".into()).await;
        player.handle_voice_server("tok".into(), Some("eu.discord.gg".into())).await;

        // Un token nuevo completa un triple nuevo
        player.handle_voice_server("tok2".into(), Some("eu.discord.gg".into())).await;
    }

    #[tokio::test]
    async fn test_replaced_end_does_not_advance() {
        let mut rest = MockRestApi::new();
        rest.expect_update_player().times(0);
        let (_node, player, mut events) = ready_player(rest, MockVoiceGateway::new(), options()).await;
        {
            let mut queue = player.queue();
            queue.current = Some(track("A"));
            queue.enqueue(track("B"));
        }

        player.handle_event(ended("A", TrackEndReason::Replaced)).await;

        assert!(player.current().is_none());
        let previous = player.previous().unwrap();
        assert_eq!(previous.encoded, "A");
        assert_eq!(previous.user_data.as_deref(), Some("user-A"));
        assert_eq!(names(&player), vec!["B"]);
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::QueueEnd { .. })));
    }

    #[tokio::test]
    async fn test_repeat_queue_rotates_finished_track() {
        let mut rest = MockRestApi::new();
        rest.expect_update_player()
            .withf(|_, _, update, _| {
                update.track.as_ref().and_then(|t| t.encoded.clone()) == Some(Some("B".to_string()))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (_node, player, _) = ready_player(rest, MockVoiceGateway::new(), options()).await;
        {
            let mut queue = player.queue();
            queue.current = Some(track("A"));
            queue.enqueue(track("B"));
        }
        player.set_repeat(RepeatMode::Queue).await.unwrap();
        player.update_state(connected());

        player.handle_event(ended("A", TrackEndReason::Finished)).await;

        assert_eq!(player.current().map(|t| t.encoded), Some("B".to_string()));
        assert_eq!(names(&player), vec!["A"]);
    }

    #[tokio::test]
    async fn test_skip_plays_next_track() {
        let mut rest = MockRestApi::new();
        rest.expect_update_player()
            .withf(|_, _, update, _| update.has_track() && update.paused == Some(false))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (_node, player, _) = ready_player(rest, MockVoiceGateway::new(), options()).await;
        player.update_state(connected());
        {
            let mut queue = player.queue();
            queue.current = Some(track("A"));
            queue.enqueue(track("B"));
            queue.enqueue(track("C"));
        }

        player.skip().await.unwrap();

        assert_eq!(player.current().map(|t| t.encoded), Some("B".to_string()));
        assert_eq!(names(&player), vec!["C"]);
    }

    #[tokio::test]
    async fn test_stop_clears_queue_and_ends() {
        let mut rest = MockRestApi::new();
        rest.expect_update_player()
            .withf(|_, _, update, _| *update == UpdatePlayer::stop())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (_node, player, mut events) = ready_player(rest, MockVoiceGateway::new(), options()).await;
        {
            let mut queue = player.queue();
            queue.current = Some(track("A"));
            queue.enqueue_many([track("B"), track("C")]);
        }

        player.stop().await.unwrap();
        assert!(player.queue().is_empty());

        player.handle_event(ended("A", TrackEndReason::Stopped)).await;
        assert!(player.current().is_none());
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::QueueEnd { guild_id } if *guild_id == GUILD)));
    }

    #[tokio::test]
    async fn test_track_exception_clears_current_without_skip() {
        let mut rest = MockRestApi::new();
        rest.expect_update_player()
            .withf(|_, _, update, _| *update == UpdatePlayer::stop())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (_node, player, mut events) = ready_player(rest, MockVoiceGateway::new(), options()).await;
        player.update_state(connected());
        {
            let mut queue = player.queue();
            queue.current = Some(track("A"));
            queue.enqueue(track("B"));
        }

        player
            .handle_event(protocol::Event::TrackExceptionEvent(TrackException {
                guild_id: GUILD,
                track: track_data("A"),
                exception: Exception {
                    message: Some("boom".into()),
                    severity: Severity::Fault,
                    cause: "x".into(),
                },
            }))
            .await;
        // El final que sigue a la excepción no avanza la cola
        player.handle_event(ended("A", TrackEndReason::LoadFailed)).await;

        assert!(player.current().is_none());
        assert!(!player.is_playing());
        assert_eq!(names(&player), vec!["B"]);
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            Event::TrackException { track, .. } if track.user_data.as_deref() == Some("user-A")
        )));
    }

    #[tokio::test]
    async fn test_voice_move_and_self_disconnect() {
        let mut rest = MockRestApi::new();
        rest.expect_destroy_player().times(1).returning(|_, _| Ok(()));
        let (node, player, mut events) = ready_player(rest, quiet_gateway(), options()).await;

        let other = ChannelId::new(501);
        player.handle_voice_state(Some(other), "sess".into()).await;
        assert_eq!(player.voice_channel_id(), Some(other));

        player.handle_voice_state(None, "sess".into()).await;
        assert!(node.player(GUILD).is_none());

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::PlayerMoved { old_channel: Some(old), new_channel: Some(new), .. }
                if *old == CHANNEL && *new == other
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::PlayerMoved { new_channel: None, .. }
        )));
        assert!(matches!(events.last(), Some(Event::PlayerDestroyed { .. })));
    }

    #[tokio::test]
    async fn test_filters_send_full_state() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&sent);
        let mut rest = MockRestApi::new();
        rest.expect_update_player()
            .returning(move |_, _, update, _| {
                recorded.lock().push(update.clone());
                Ok(())
            });
        let (_node, player, _) = ready_player(rest, MockVoiceGateway::new(), options()).await;

        player.filter().apply_timescale(Some(Timescale::nightcore())).await.unwrap();
        player.filter().apply_volume(0.5).await.unwrap();
        player.filter().apply_preset(EqPreset::Bass).await.unwrap();
        player.filter().reset().await.unwrap();

        let sent = sent.lock();
        assert_eq!(sent.len(), 4);
        let second = sent[1].filters.as_ref().unwrap();
        assert_eq!(second.volume, 0.5);
        assert_eq!(second.timescale, Some(Timescale::nightcore()));
        assert!(sent[2].filters.as_ref().unwrap().equalizer.is_some());
        assert_eq!(
            serde_json::to_value(&sent[3]).unwrap(),
            json!({"filters": {"volume": 0.5}})
        );
        assert_eq!(player.filters(), Filters::with_volume(0.5));
    }

    #[tokio::test]
    async fn test_auto_leave_destroys_idle_player() {
        let mut rest = MockRestApi::new();
        rest.expect_destroy_player().times(1).returning(|_, _| Ok(()));
        let options = crate::config::ManagerOptions {
            auto_leave: true,
            auto_leave_timeout: Duration::from_millis(30),
            ..options()
        };
        let (node, player, mut events) = ready_player(rest, quiet_gateway(), options).await;
        player.queue().current = Some(track("A"));

        player.handle_event(ended("A", TrackEndReason::Finished)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(node.player(GUILD).is_none());
        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(e, Event::QueueEnd { .. })));
        assert!(events.iter().any(|e| matches!(e, Event::AutoLeave { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let ctx = context(Arc::new(MemoryStore::new()), MockVoiceGateway::new(), options());
        let player: Player<String> = Player::new(
            Weak::new(),
            Arc::clone(&ctx),
            "localhost:2333".into(),
            PlayerOptions::new(GUILD).voice_channel(CHANNEL),
        );
        {
            let mut queue = player.queue();
            queue.current = Some(track("A"));
            queue.previous = Some(track("Z"));
            queue.enqueue_many([track("B"), track("C")]);
        }
        player.state.lock().voice.set_server("tok".into(), Some("ep".into()));
        player.state.lock().repeat = RepeatMode::Track;

        let snapshot = player.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: PlayerSnapshot<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);

        let restored = Player::from_snapshot(Weak::new(), ctx, "localhost:2333".into(), decoded);
        let mut again = restored.snapshot();
        again.updated_at = snapshot.updated_at;
        assert_eq!(again, snapshot);
        assert_eq!(names(&restored), vec!["B", "C"]);
        assert_eq!(restored.repeat(), RepeatMode::Track);
    }
}
