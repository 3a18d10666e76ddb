use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use serenity::model::{
    channel::GuildChannel,
    event::VoiceServerUpdateEvent,
    id::{ChannelId, GuildId, UserId},
    voice::VoiceState,
};

/// Colaborador que habla con el gateway de Discord.
///
/// El runtime solo lo usa para entrar/salir de canales de voz (opcode 4).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()>;
}

/// Eventos del gateway que afectan a los players
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    ChannelDelete {
        guild_id: GuildId,
        channel_id: ChannelId,
    },
    VoiceServerUpdate {
        guild_id: GuildId,
        token: String,
        /// `None` cuando Discord libera el servidor de voz
        endpoint: Option<String>,
    },
    VoiceStateUpdate {
        guild_id: GuildId,
        user_id: UserId,
        channel_id: Option<ChannelId>,
        session_id: String,
    },
}

#[derive(Deserialize)]
struct RawChannelDelete {
    id: ChannelId,
    guild_id: Option<GuildId>,
}

#[derive(Deserialize)]
struct RawVoiceServerUpdate {
    guild_id: Option<GuildId>,
    token: String,
    endpoint: Option<String>,
}

#[derive(Deserialize)]
struct RawVoiceStateUpdate {
    guild_id: Option<GuildId>,
    user_id: UserId,
    channel_id: Option<ChannelId>,
    session_id: String,
}

impl GatewayEvent {
    /// Interpreta un paquete dispatch crudo (`t` + `d`); ignora el resto
    pub fn from_dispatch(kind: &str, data: &Value) -> Option<Self> {
        match kind {
            "CHANNEL_DELETE" => {
                let raw = RawChannelDelete::deserialize(data).ok()?;
                Some(Self::ChannelDelete {
                    guild_id: raw.guild_id?,
                    channel_id: raw.id,
                })
            }
            "VOICE_SERVER_UPDATE" => {
                let raw = RawVoiceServerUpdate::deserialize(data).ok()?;
                Some(Self::VoiceServerUpdate {
                    guild_id: raw.guild_id?,
                    token: raw.token,
                    endpoint: raw.endpoint,
                })
            }
            "VOICE_STATE_UPDATE" => {
                let raw = RawVoiceStateUpdate::deserialize(data).ok()?;
                Some(Self::VoiceStateUpdate {
                    guild_id: raw.guild_id?,
                    user_id: raw.user_id,
                    channel_id: raw.channel_id,
                    session_id: raw.session_id,
                })
            }
            _ => None,
        }
    }

    /// Desde un paquete completo `{ "t": ..., "d": ... }`
    pub fn from_packet(packet: &Value) -> Option<Self> {
        Self::from_dispatch(packet.get("t")?.as_str()?, packet.get("d")?)
    }

    pub fn from_voice_server(event: &VoiceServerUpdateEvent) -> Option<Self> {
        Some(Self::VoiceServerUpdate {
            guild_id: event.guild_id?,
            token: event.token.clone(),
            endpoint: event.endpoint.clone(),
        })
    }

    pub fn from_voice_state(state: &VoiceState) -> Option<Self> {
        Some(Self::VoiceStateUpdate {
            guild_id: state.guild_id?,
            user_id: state.user_id,
            channel_id: state.channel_id,
            session_id: state.session_id.clone(),
        })
    }

    pub fn from_channel_delete(channel: &GuildChannel) -> Self {
        Self::ChannelDelete {
            guild_id: channel.guild_id,
            channel_id: channel.id,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::ChannelDelete { guild_id, .. }
            | Self::VoiceServerUpdate { guild_id, .. }
            | Self::VoiceStateUpdate { guild_id, .. } => *guild_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_voice_packets() {
        let server = GatewayEvent::from_packet(&json!({
            "op": 0,
            "t": "VOICE_SERVER_UPDATE",
            "d": {"token": "tok", "guild_id": "41771983423143937", "endpoint": "smart.loyal.discord.gg"}
        }))
        .unwrap();
        assert_eq!(
            server,
            GatewayEvent::VoiceServerUpdate {
                guild_id: GuildId::new(41771983423143937),
                token: "tok".into(),
                endpoint: Some("smart.loyal.discord.gg".into()),
            }
        );

        let state = GatewayEvent::from_dispatch(
            "VOICE_STATE_UPDATE",
            &json!({
                "guild_id": "41771983423143937",
                "channel_id": null,
                "user_id": "80351110224678912",
                "session_id": "90326bd25d71d39b9ef95b299e3872ff",
                "deaf": false,
                "mute": false
            }),
        )
        .unwrap();
        assert!(matches!(
            state,
            GatewayEvent::VoiceStateUpdate { channel_id: None, ref session_id, .. }
                if session_id == "90326bd25d71d39b9ef95b299e3872ff"
        ));
    }

    #[test]
    fn test_ignores_unrelated_or_guildless_packets() {
        assert!(GatewayEvent::from_dispatch("MESSAGE_CREATE", &json!({})).is_none());
        // Canal de DM: sin guild
        assert!(GatewayEvent::from_dispatch("CHANNEL_DELETE", &json!({"id": "1"})).is_none());
        let deleted =
            GatewayEvent::from_dispatch("CHANNEL_DELETE", &json!({"id": "5", "guild_id": "9"}))
                .unwrap();
        assert_eq!(deleted.guild_id(), GuildId::new(9));
    }

    #[test]
    fn test_converts_serenity_voice_server_update() {
        let event: VoiceServerUpdateEvent = serde_json::from_value(json!({
            "token": "tok",
            "guild_id": "12",
            "endpoint": null
        }))
        .unwrap();
        assert_eq!(
            GatewayEvent::from_voice_server(&event),
            Some(GatewayEvent::VoiceServerUpdate {
                guild_id: GuildId::new(12),
                token: "tok".into(),
                endpoint: None,
            })
        );
    }
}
