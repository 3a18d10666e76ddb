use serenity::model::id::{ChannelId, GuildId};

use crate::{
    audio::track::Track,
    node::protocol::{Exception, TrackEndReason},
};

/// Eventos de ciclo de vida emitidos por el manager, los nodos y los players.
///
/// Se reparten por un canal `tokio::sync::broadcast`; ver
/// [`Manager::subscribe`](crate::Manager::subscribe).
#[derive(Debug, Clone)]
pub enum Event<U> {
    NodeConnected {
        node: String,
    },
    NodeReady {
        node: String,
        restored_players: usize,
    },
    NodeResumed {
        node: String,
    },
    NodeDisconnected {
        node: String,
    },
    NodeError {
        node: String,
        message: String,
    },
    PlayerCreated {
        guild_id: GuildId,
    },
    PlayerRestored {
        guild_id: GuildId,
    },
    PlayerDestroyed {
        guild_id: GuildId,
    },
    PlayerMoved {
        guild_id: GuildId,
        old_channel: Option<ChannelId>,
        new_channel: Option<ChannelId>,
    },
    TrackStart {
        guild_id: GuildId,
        track: Track<U>,
    },
    TrackEnd {
        guild_id: GuildId,
        track: Track<U>,
        reason: TrackEndReason,
    },
    TrackException {
        guild_id: GuildId,
        track: Track<U>,
        exception: Exception,
    },
    TrackStuck {
        guild_id: GuildId,
        track: Track<U>,
        threshold_ms: u64,
    },
    WebSocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    QueueEnd {
        guild_id: GuildId,
    },
    AutoLeave {
        guild_id: GuildId,
    },
}
