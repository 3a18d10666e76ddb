//! Modelo de mensajes del protocolo Lavalink v4 (WebSocket y REST).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serenity::model::id::GuildId;

use crate::audio::filters::Filters;

// ---------------------------------------------------------------------------
// Tracks
// ---------------------------------------------------------------------------

/// Track tal como lo devuelve el nodo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackData {
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub plugin_info: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub user_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duración en milisegundos
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    pub source_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// -1 si no hay track seleccionado
    pub selected_track: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    #[serde(default)]
    pub plugin_info: Value,
    pub tracks: Vec<TrackData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
}

// ---------------------------------------------------------------------------
// Resultado de /loadtracks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoadResult {
    load_type: LoadType,
    #[serde(default)]
    data: Value,
}

/// Resultado etiquetado de una resolución de tracks
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawLoadResult")]
pub enum LoadResult {
    Track(TrackData),
    Playlist(PlaylistData),
    Search(Vec<TrackData>),
    Empty,
    Error(Exception),
}

impl TryFrom<RawLoadResult> for LoadResult {
    type Error = serde_json::Error;

    fn try_from(raw: RawLoadResult) -> Result<Self, serde_json::Error> {
        Ok(match raw.load_type {
            LoadType::Track => Self::Track(serde_json::from_value(raw.data)?),
            LoadType::Playlist => Self::Playlist(serde_json::from_value(raw.data)?),
            LoadType::Search => Self::Search(serde_json::from_value(raw.data)?),
            LoadType::Empty => Self::Empty,
            LoadType::Error => Self::Error(serde_json::from_value(raw.data)?),
        })
    }
}

// ---------------------------------------------------------------------------
// Mensajes entrantes del WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Ready(Ready),
    Stats(Stats),
    PlayerUpdate(PlayerUpdate),
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,
    /// Milisegundos
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub guild_id: GuildId,
    pub state: PlayerUpdateState,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PlayerUpdateState {
    /// Timestamp unix en milisegundos
    pub time: i64,
    #[serde(default)]
    pub position: u64,
    pub connected: bool,
    /// -1 si no está conectado
    pub ping: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    TrackStartEvent(TrackStart),
    TrackEndEvent(TrackEnd),
    TrackExceptionEvent(TrackException),
    TrackStuckEvent(TrackStuck),
    WebSocketClosedEvent(WebSocketClosed),
}

impl Event {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::TrackStartEvent(e) => e.guild_id,
            Self::TrackEndEvent(e) => e.guild_id,
            Self::TrackExceptionEvent(e) => e.guild_id,
            Self::TrackStuckEvent(e) => e.guild_id,
            Self::WebSocketClosedEvent(e) => e.guild_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStart {
    pub guild_id: GuildId,
    pub track: TrackData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEnd {
    pub guild_id: GuildId,
    pub track: TrackData,
    pub reason: TrackEndReason,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub guild_id: GuildId,
    pub track: TrackData,
    pub exception: Exception,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStuck {
    pub guild_id: GuildId,
    pub track: TrackData,
    pub threshold_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketClosed {
    pub guild_id: GuildId,
    pub code: u16,
    pub reason: String,
    pub by_remote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

// ---------------------------------------------------------------------------
// Peticiones REST salientes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UpdateSession {
    pub resuming: bool,
    /// Segundos
    pub timeout: u64,
}

/// Credenciales de voz que el nodo necesita para unirse al canal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceCredentials {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    /// `Some(None)` detiene el track actual
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

/// Parche parcial para `PATCH /sessions/{id}/players/{guild}`
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceCredentials>,
}

impl UpdatePlayer {
    pub fn has_track(&self) -> bool {
        self.track
            .as_ref()
            .is_some_and(|t| matches!(t.encoded, Some(Some(_))) || t.identifier.is_some())
    }

    /// Parche que detiene la reproducción
    pub fn stop() -> Self {
        Self {
            track: Some(UpdatePlayerTrack {
                encoded: Some(None),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Cuerpo de error devuelto por la API REST
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
    pub path: String,
}
