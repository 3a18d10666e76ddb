use serenity::model::id::GuildId;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::node::protocol::Exception;

pub type Result<T> = std::result::Result<T, Error>;

/// Errores del runtime de nodos y players
#[derive(Error, Debug)]
pub enum Error {
    #[error("no nodes connected")]
    NoNodesAvailable,
    #[error("node {0} is not ready")]
    NodeNotReady(String),
    #[error("the owning node is no longer available")]
    NodeGone,
    #[error("manager already initialized")]
    AlreadyInitialized,
    #[error("voice connection not ready for guild {0}")]
    VoiceNotConnected(GuildId),
    #[error("nothing to play")]
    NothingToPlay,
    #[error("track load failed ({severity:?}): {message}", severity = .0.severity, message = .0.message.as_deref().unwrap_or("unknown"))]
    LoadFailed(Exception),
    #[error("lavalink returned {status}: {message}")]
    Rest { status: u16, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] tungstenite::http::header::InvalidHeaderValue),
    #[error("state store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("voice gateway error: {0}")]
    Gateway(anyhow::Error),
}
